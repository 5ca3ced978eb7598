//! Curation pipeline: harvesting, testing, persistence, selection
//!
//! This module provides functionality for:
//! - Extracting and normalizing proxy links from chat messages
//! - Driving the external tester binary under a concurrency bound
//! - Persisting endpoint records with retry/aging semantics
//! - Selecting and renaming the publishable set per location

pub mod extract;
pub mod harvest;
pub mod models;
pub mod pipeline;
pub mod proxy;
pub mod rename;
pub mod select;
pub mod store;
pub mod tester;

pub use harvest::{Harvester, MessageBatch, MessageSource, SourceMessage};
pub use models::{EndpointRecord, Protocol, SelectorMode, TestKind, TestOutcome};
pub use pipeline::Pipeline;
pub use proxy::{InternalProxyManager, ProxyManagerConfig, ProxyState, SocksEndpoint};
pub use select::{Selector, SelectorConfig};
pub use store::{Candidate, ServerStore};
pub use tester::{TestOracle, TesterConfig, XrayKnifeTester};
