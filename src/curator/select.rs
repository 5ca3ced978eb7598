//! Selector/curator: ranks store snapshots into the publish set and the
//! internal-proxy candidate set
//!
//! Ranking strategies are pure functions over record snapshots so they can be
//! exercised without a database.

use crate::curator::models::{EndpointRecord, SelectorMode};
use crate::curator::store::ServerStore;
use crate::Result;
use chrono::{Duration, Utc};
use std::cmp::Ordering;

#[derive(Debug, Clone)]
pub struct SelectorConfig {
    /// Hard filter applied to the publish set before ranking, when set
    pub min_download_mbps: Option<f64>,
    pub max_retries: i64,
    pub retest_window: Duration,
}

pub struct Selector<'a> {
    store: &'a ServerStore,
    config: SelectorConfig,
}

impl<'a> Selector<'a> {
    pub fn new(store: &'a ServerStore, config: SelectorConfig) -> Self {
        Self { store, config }
    }

    /// The final ordered list for publication: post-cap speed-passed records,
    /// optionally hard-filtered by minimum download speed.
    pub async fn select_publish_set(&self) -> Result<Vec<EndpointRecord>> {
        let mut records = self.store.publish_snapshot().await?;
        if let Some(min) = self.config.min_download_mbps {
            records.retain(|r| r.download_mbps.map_or(false, |d| d >= min));
        }
        records.retain(|r| is_eligible(r, self.config.max_retries, self.config.retest_window));
        Ok(records)
    }

    /// Candidates for seeding the internal forwarding proxy.
    pub async fn select_internal_proxy_set(
        &self,
        mode: SelectorMode,
        max_links: usize,
    ) -> Result<Vec<EndpointRecord>> {
        let records = self.store.all_records().await?;
        Ok(rank_internal_proxy(
            records,
            mode,
            max_links,
            self.config.max_retries,
            self.config.retest_window,
        ))
    }
}

/// A record that exhausted its retries sits out selections until its
/// cool-down has elapsed.
fn is_eligible(record: &EndpointRecord, max_retries: i64, retest_window: Duration) -> bool {
    if record.retry_count < max_retries {
        return true;
    }
    match record.last_checked_at {
        Some(checked) => Utc::now() - checked >= retest_window,
        None => true,
    }
}

/// Rank eligible records for internal-proxy use and keep the top
/// `max_links`. Ties broken by the most recent successful check.
pub fn rank_internal_proxy(
    records: Vec<EndpointRecord>,
    mode: SelectorMode,
    max_links: usize,
    max_retries: i64,
    retest_window: Duration,
) -> Vec<EndpointRecord> {
    let mut eligible: Vec<EndpointRecord> = records
        .into_iter()
        .filter(|r| is_eligible(r, max_retries, retest_window))
        .collect();

    match mode {
        SelectorMode::SpeedPassed => eligible.sort_by(|a, b| {
            b.speed_passed
                .cmp(&a.speed_passed)
                .then_with(|| compare_desc_f64(a.download_mbps, b.download_mbps))
                .then_with(|| b.last_success_at().cmp(&a.last_success_at()))
        }),
        SelectorMode::LatencyPassed => eligible.sort_by(|a, b| {
            b.latency_passed
                .cmp(&a.latency_passed)
                .then_with(|| compare_asc_option(a.delay_ms, b.delay_ms))
                .then_with(|| b.last_success_at().cmp(&a.last_success_at()))
        }),
    }

    eligible.truncate(max_links);
    eligible
}

/// Descending on value, None ranked last
fn compare_desc_f64(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => b.partial_cmp(&a).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Ascending on value, None ranked last
fn compare_asc_option(a: Option<i64>, b: Option<i64>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}
