//! Harvester: incremental link collection with per-source progress tracking

use crate::curator::extract::extract_links;
use crate::curator::models::Protocol;
use crate::curator::store::{Candidate, ServerStore};
use crate::Result;
use async_trait::async_trait;
use tracing::{info, warn};

/// One message fetched from a source
#[derive(Debug, Clone)]
pub struct SourceMessage {
    pub id: i64,
    pub text: String,
}

/// One page of messages after a cursor
#[derive(Debug, Clone)]
pub struct MessageBatch {
    pub messages: Vec<SourceMessage>,
    pub reached_end: bool,
}

/// Capability interface over the chat platform. The production client lives
/// outside the core; tests inject a scripted fake.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Fetch up to `limit` messages with ids greater than `after_cursor`.
    /// Delivery is at-least-once across retries; duplicates are tolerated
    /// downstream via extraction-level dedup.
    async fn fetch_batch(
        &self,
        source_id: &str,
        after_cursor: Option<i64>,
        limit: usize,
    ) -> Result<MessageBatch>;

    /// Route subsequent fetches through a local SOCKS endpoint. Sources that
    /// cannot be re-routed ignore the call.
    fn use_proxy(&mut self, _endpoint: &crate::curator::proxy::SocksEndpoint) {}
}

/// Message source backed by exported chat dumps on disk: one JSON file per
/// source under the dump directory, holding `[{"id": .., "text": ".."}]`.
/// The live chat client is an external collaborator; this is the boundary
/// implementation the CLI ships with.
pub struct JsonFileSource {
    dump_dir: std::path::PathBuf,
}

impl JsonFileSource {
    pub fn new(dump_dir: std::path::PathBuf) -> Self {
        Self { dump_dir }
    }
}

#[derive(serde::Deserialize)]
struct DumpMessage {
    id: i64,
    #[serde(default)]
    text: String,
}

#[async_trait]
impl MessageSource for JsonFileSource {
    async fn fetch_batch(
        &self,
        source_id: &str,
        after_cursor: Option<i64>,
        limit: usize,
    ) -> Result<MessageBatch> {
        let path = self.dump_dir.join(format!("{}.json", source_id));
        let raw = tokio::fs::read_to_string(&path).await?;
        let mut dump: Vec<DumpMessage> = serde_json::from_str(&raw)?;
        dump.sort_by_key(|m| m.id);

        let cursor = after_cursor.unwrap_or(i64::MIN);
        let remaining: Vec<&DumpMessage> = dump.iter().filter(|m| m.id > cursor).collect();
        let reached_end = remaining.len() <= limit;
        let messages = remaining
            .into_iter()
            .take(limit)
            .map(|m| SourceMessage {
                id: m.id,
                text: m.text.clone(),
            })
            .collect();
        Ok(MessageBatch {
            messages,
            reached_end,
        })
    }
}

pub struct Harvester<'a> {
    store: &'a ServerStore,
    batch_limit: usize,
}

impl<'a> Harvester<'a> {
    pub fn new(store: &'a ServerStore, batch_limit: usize) -> Self {
        Self { store, batch_limit }
    }

    /// Harvest one source: fetch a batch past the stored cursor, extract and
    /// normalize candidates, persist them, and only then advance the cursor.
    ///
    /// A fetch or persist error leaves the cursor where it was, so the same
    /// message window is re-read on the next run rather than skipped.
    /// Returns the number of newly stored candidates.
    pub async fn harvest_source<S: MessageSource + ?Sized>(
        &self,
        source: &S,
        source_id: &str,
    ) -> Result<u64> {
        let cursor = self.store.progress(source_id).await?;

        let batch = match source.fetch_batch(source_id, cursor, self.batch_limit).await {
            Ok(batch) => batch,
            Err(e) => {
                // Transient upstream failure: no progress this run, safe to
                // re-invoke
                warn!(source_id, error = %e, "fetch failed, keeping cursor");
                return Ok(0);
            }
        };

        if batch.messages.is_empty() {
            return Ok(0);
        }

        let max_id = batch.messages.iter().map(|m| m.id).max().unwrap_or(0);
        let candidates = self.collect_candidates(&batch, source_id);

        let inserted = self.store.insert_candidates(&candidates).await?;

        // Candidates are durable; the cursor may now move
        self.store.set_progress(source_id, max_id).await?;

        info!(
            source_id,
            messages = batch.messages.len(),
            candidates = candidates.len(),
            new = inserted,
            cursor = max_id,
            "harvested"
        );
        Ok(inserted)
    }

    fn collect_candidates(&self, batch: &MessageBatch, source_id: &str) -> Vec<Candidate> {
        let mut seen = std::collections::BTreeSet::new();
        let mut candidates = Vec::new();
        for message in &batch.messages {
            for uri in extract_links(&message.text) {
                if !seen.insert(uri.clone()) {
                    continue;
                }
                let Some(protocol) = Protocol::from_uri(&uri) else {
                    continue;
                };
                candidates.push(Candidate {
                    uri,
                    protocol,
                    source_ref: Some(format!("{}:{}", source_id, message.id)),
                });
            }
        }
        candidates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted source: returns canned batches in sequence, or an error.
    struct FakeSource {
        batches: Vec<Result<MessageBatch>>,
        calls: AtomicUsize,
    }

    impl FakeSource {
        fn new(batches: Vec<Result<MessageBatch>>) -> Self {
            Self {
                batches,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl MessageSource for FakeSource {
        async fn fetch_batch(
            &self,
            _source_id: &str,
            _after_cursor: Option<i64>,
            _limit: usize,
        ) -> Result<MessageBatch> {
            let idx = self.calls.fetch_add(1, Ordering::SeqCst);
            match self.batches.get(idx) {
                Some(Ok(batch)) => Ok(batch.clone()),
                Some(Err(e)) => Err(anyhow!(e.to_string())),
                None => Ok(MessageBatch {
                    messages: vec![],
                    reached_end: true,
                }),
            }
        }
    }

    fn batch(messages: Vec<(i64, &str)>) -> MessageBatch {
        MessageBatch {
            messages: messages
                .into_iter()
                .map(|(id, text)| SourceMessage {
                    id,
                    text: text.to_string(),
                })
                .collect(),
            reached_end: false,
        }
    }

    #[tokio::test]
    async fn test_harvest_advances_cursor_after_persist() {
        let store = ServerStore::open_in_memory().await.unwrap();
        let source = FakeSource::new(vec![Ok(batch(vec![
            (10, "fresh: vless://uuid@host:443?type=ws#promo"),
            (11, "also trojan://pw@other:443 works"),
        ]))]);

        let harvester = Harvester::new(&store, 100);
        let new = harvester.harvest_source(&source, "group:1").await.unwrap();
        assert_eq!(new, 2);
        assert_eq!(store.progress("group:1").await.unwrap(), Some(11));
    }

    #[tokio::test]
    async fn test_fetch_failure_keeps_cursor() {
        let store = ServerStore::open_in_memory().await.unwrap();
        store.set_progress("group:1", 42).await.unwrap();

        let source = FakeSource::new(vec![Err(anyhow!("rate limited"))]);
        let harvester = Harvester::new(&store, 100);
        let new = harvester.harvest_source(&source, "group:1").await.unwrap();
        assert_eq!(new, 0);
        assert_eq!(store.progress("group:1").await.unwrap(), Some(42));
        assert!(store.all_records().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_overlapping_batches_store_one_record_per_uri() {
        let store = ServerStore::open_in_memory().await.unwrap();
        // Same endpoint re-published with a different display fragment
        let source = FakeSource::new(vec![
            Ok(batch(vec![(1, "vless://uuid@host:443?type=ws#old")])),
            Ok(batch(vec![
                (1, "vless://uuid@host:443?type=ws#old"),
                (2, "vless://uuid@host:443?type=ws#new"),
            ])),
        ]);

        let harvester = Harvester::new(&store, 100);
        harvester.harvest_source(&source, "group:1").await.unwrap();
        harvester.harvest_source(&source, "group:1").await.unwrap();

        assert_eq!(store.all_records().await.unwrap().len(), 1);
        assert_eq!(store.progress("group:1").await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_empty_batch_is_noop() {
        let store = ServerStore::open_in_memory().await.unwrap();
        let source = FakeSource::new(vec![Ok(MessageBatch {
            messages: vec![],
            reached_end: true,
        })]);
        let harvester = Harvester::new(&store, 100);
        assert_eq!(harvester.harvest_source(&source, "group:1").await.unwrap(), 0);
        assert_eq!(store.progress("group:1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_json_file_source_respects_cursor_and_limit() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("group:1.json"),
            r#"[{"id": 3, "text": "c"}, {"id": 1, "text": "a"}, {"id": 2, "text": "b"}]"#,
        )
        .unwrap();

        let source = JsonFileSource::new(dir.path().to_path_buf());
        let batch = source.fetch_batch("group:1", Some(1), 1).await.unwrap();
        assert_eq!(batch.messages.len(), 1);
        assert_eq!(batch.messages[0].id, 2);
        assert!(!batch.reached_end);

        let batch = source.fetch_batch("group:1", Some(2), 10).await.unwrap();
        assert_eq!(batch.messages.len(), 1);
        assert!(batch.reached_end);
    }

    #[tokio::test]
    async fn test_source_ref_traces_origin() {
        let store = ServerStore::open_in_memory().await.unwrap();
        let source = FakeSource::new(vec![Ok(batch(vec![(7, "ss://YWVzOnB3@host:8388")]))]);
        let harvester = Harvester::new(&store, 100);
        harvester.harvest_source(&source, "group:9").await.unwrap();

        let record = store.record("ss://YWVzOnB3@host:8388").await.unwrap().unwrap();
        assert_eq!(record.source_ref.as_deref(), Some("group:9:7"));
        assert_eq!(record.protocol, "ss");
    }
}
