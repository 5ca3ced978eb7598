//! Pipeline coordinator: sequences one full curation run
//!
//! Stages: optional internal proxy, harvest, latency phase, speed phase with
//! per-location capping, publish. The coordinator owns the cancellation
//! token; between stages it checks for shutdown and on the way out it always
//! stops the internal proxy, even when a stage failed.

use crate::config::Config;
use crate::curator::harvest::{Harvester, MessageSource};
use crate::curator::models::TestKind;
use crate::curator::proxy::{InternalProxyManager, ProxyManagerConfig};
use crate::curator::rename;
use crate::curator::select::{Selector, SelectorConfig};
use crate::curator::store::ServerStore;
use crate::curator::tester::TestOracle;
use crate::publish::{subscription_blob, Publisher};
use crate::stats::Stats;
use crate::Result;
use chrono::Duration;
use std::collections::BTreeSet;
use std::time::Duration as StdDuration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct Pipeline {
    config: Config,
    store: ServerStore,
    source: Box<dyn MessageSource>,
    oracle: Box<dyn TestOracle>,
    publisher: Box<dyn Publisher>,
    stats: Stats,
    cancel: CancellationToken,
    proxy: Option<InternalProxyManager>,
}

impl Pipeline {
    pub fn new(
        config: Config,
        store: ServerStore,
        source: Box<dyn MessageSource>,
        oracle: Box<dyn TestOracle>,
        publisher: Box<dyn Publisher>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            store,
            source,
            oracle,
            publisher,
            stats: Stats::new(),
            cancel,
            proxy: None,
        }
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn store(&self) -> &ServerStore {
        &self.store
    }

    /// Execute one run end to end. The internal proxy is stopped before this
    /// returns, regardless of how the stages went.
    pub async fn run(&mut self) -> Result<()> {
        let result = self.run_stages().await;
        if let Some(proxy) = self.proxy.as_mut() {
            proxy.stop().await;
        }
        if self.cancel.is_cancelled() {
            warn!("run interrupted, partial results persisted");
        }
        result
    }

    async fn run_stages(&mut self) -> Result<()> {
        self.start_internal_proxy().await;
        if self.cancel.is_cancelled() {
            return Ok(());
        }

        info!("--- stage: harvest ---");
        self.harvest().await?;
        if self.cancel.is_cancelled() {
            return Ok(());
        }

        info!("--- stage: latency tests ---");
        self.latency_phase().await?;
        if self.cancel.is_cancelled() {
            return Ok(());
        }

        if self.config.speed_test.enabled {
            info!("--- stage: speed tests ---");
            self.speed_phase().await?;
            if self.cancel.is_cancelled() {
                return Ok(());
            }
        }

        info!("--- stage: publish ---");
        self.publish_stage().await
    }

    fn selector_config(&self) -> SelectorConfig {
        SelectorConfig {
            min_download_mbps: self.config.speed_test.min_download_mbps,
            max_retries: self.config.database.max_retries,
            retest_window: Duration::hours(self.config.database.retest_window_hours),
        }
    }

    /// Non-fatal stage: a proxy that cannot start simply leaves harvesting
    /// on direct connectivity.
    async fn start_internal_proxy(&mut self) {
        if !self.config.internal_proxy.enabled {
            return;
        }

        let seeds = {
            let selector = Selector::new(&self.store, self.selector_config());
            match selector
                .select_internal_proxy_set(
                    self.config.internal_proxy.selector,
                    self.config.internal_proxy.max_links,
                )
                .await
            {
                Ok(records) => records.into_iter().map(|r| r.uri).collect::<Vec<_>>(),
                Err(e) => {
                    warn!(error = %e, "could not select internal proxy seeds");
                    return;
                }
            }
        };
        if seeds.is_empty() {
            info!("no curated endpoints yet, harvesting directly");
            return;
        }

        let mut manager = InternalProxyManager::new(ProxyManagerConfig {
            binary: self.config.tester.path.clone(),
            listen_host: self.config.internal_proxy.listen_host.clone(),
            listen_port: self.config.internal_proxy.listen_port,
            extra_args: self.config.internal_proxy.extra_args.clone(),
            startup_wait: StdDuration::from_millis(500),
        });
        match manager.start(&seeds).await {
            Ok(endpoint) => {
                self.source.use_proxy(&endpoint);
                self.stats.increment("internal_proxy_started");
            }
            Err(e) => {
                warn!(error = %e, "internal proxy failed, falling back to direct connectivity");
            }
        }
        self.proxy = Some(manager);
    }

    async fn harvest(&mut self) -> Result<()> {
        let harvester = Harvester::new(&self.store, self.config.sources.fetch_limit);
        for group in &self.config.sources.groups {
            if self.cancel.is_cancelled() {
                break;
            }
            let new = harvester.harvest_source(self.source.as_ref(), group).await?;
            self.stats.add("candidates_new", new);
            self.stats.increment("sources_harvested");
        }
        Ok(())
    }

    /// Latency candidates are everything the aging rule makes eligible; new
    /// candidates qualify automatically because they have never been checked.
    async fn latency_phase(&mut self) -> Result<()> {
        let window = Duration::hours(self.config.database.retest_window_hours);
        let uris = self
            .store
            .retest_candidates(window, self.config.database.max_retries)
            .await?;
        if uris.is_empty() {
            info!("no latency candidates this run");
            return Ok(());
        }

        let outcomes = self.oracle.run(TestKind::Latency, &uris).await?;
        self.store
            .record_outcomes(TestKind::Latency, &outcomes)
            .await?;

        let passed = outcomes.iter().filter(|o| o.passed).count() as u64;
        self.stats.add("latency_tested", outcomes.len() as u64);
        self.stats.add("latency_passed", passed);
        Ok(())
    }

    async fn speed_phase(&mut self) -> Result<()> {
        let pairs = self
            .store
            .speed_candidates(self.config.speed_test.max_candidates_per_location)
            .await?;
        if pairs.is_empty() {
            warn!("no latency-passed servers available to speed test");
            return Ok(());
        }

        let uris: Vec<String> = pairs.iter().map(|(_, uri)| uri.clone()).collect();
        let outcomes = self.oracle.run(TestKind::Speed, &uris).await?;
        self.store
            .record_outcomes(TestKind::Speed, &outcomes)
            .await?;

        let passed = outcomes.iter().filter(|o| o.passed).count() as u64;
        self.stats.add("speed_tested", outcomes.len() as u64);
        self.stats.add("speed_passed", passed);

        // Cap only once every outcome for the batch is persisted
        let locations: BTreeSet<&str> = pairs.iter().map(|(loc, _)| loc.as_str()).collect();
        for location in locations {
            let evicted = self
                .store
                .cap_location(location, self.config.database.max_servers_per_location)
                .await?;
            self.stats.add("capped", evicted);
        }
        Ok(())
    }

    async fn publish_stage(&mut self) -> Result<()> {
        let set = {
            let selector = Selector::new(&self.store, self.selector_config());
            selector.select_publish_set().await?
        };
        if set.is_empty() {
            warn!("publish set is empty, nothing to hand off");
            return Ok(());
        }

        let renamed: Vec<String> = set.iter().map(rename::renamed_uri).collect();
        let blob = subscription_blob(&renamed, self.config.publisher.upload_base64);
        self.publisher.publish(&blob).await?;
        self.stats.add("published", set.len() as u64);
        Ok(())
    }
}
