//! Proxy Curator - Link Harvester, Tester and Curator
//!
//! Discovers candidate proxy endpoints published in chat groups, verifies
//! them through an external tester binary, curates a ranked, capped set of
//! working endpoints per location, and republishes the curated set.

pub mod config;
pub mod curator;
pub mod publish;
pub mod stats;

pub use config::Config;
pub use curator::*;

/// Application result type
pub type Result<T> = anyhow::Result<T>;
