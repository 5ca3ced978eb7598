//! Server store: the single writer of endpoint records
//!
//! Backed by SQLite through sqlx. Every outcome merge is a single statement,
//! so a write either lands completely or not at all; capping a location runs
//! as its own statement after the phase's writes for that location have been
//! persisted.

use crate::curator::models::{EndpointRecord, Protocol, TestKind, TestOutcome};
use crate::Result;
use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};

/// A freshly harvested candidate, before any test has run
#[derive(Debug, Clone)]
pub struct Candidate {
    pub uri: String,
    pub protocol: Protocol,
    pub source_ref: Option<String>,
}

pub struct ServerStore {
    pool: SqlitePool,
}

impl ServerStore {
    /// Open (or create) the store at the given path.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        info!("server store opened at {}", path.display());
        Ok(store)
    }

    /// In-memory store for tests. Single connection, since every connection
    /// to `:memory:` gets its own database.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS servers (
                uri TEXT PRIMARY KEY,
                protocol TEXT NOT NULL,
                location TEXT,
                delay_ms INTEGER,
                last_checked_at TIMESTAMP,
                latency_passed INTEGER NOT NULL DEFAULT 0,
                download_mbps REAL,
                last_speed_checked_at TIMESTAMP,
                speed_passed INTEGER NOT NULL DEFAULT 0,
                http_code INTEGER,
                retry_count INTEGER NOT NULL DEFAULT 0,
                first_seen_at TIMESTAMP NOT NULL,
                source_ref TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS source_progress (
                source_id TEXT PRIMARY KEY,
                last_message_id INTEGER NOT NULL,
                updated_at TIMESTAMP NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_servers_location ON servers(location)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Insert newly harvested candidates. Existing URIs are left untouched;
    /// returns how many rows were actually new.
    pub async fn insert_candidates(&self, candidates: &[Candidate]) -> Result<u64> {
        let now = Utc::now();
        let mut inserted = 0u64;
        for candidate in candidates {
            let result = sqlx::query(
                "INSERT OR IGNORE INTO servers (uri, protocol, first_seen_at, source_ref) \
                 VALUES (?, ?, ?, ?)",
            )
            .bind(&candidate.uri)
            .bind(candidate.protocol.as_str())
            .bind(now)
            .bind(&candidate.source_ref)
            .execute(&self.pool)
            .await?;
            inserted += result.rows_affected();
        }
        debug!(total = candidates.len(), new = inserted, "candidates inserted");
        Ok(inserted)
    }

    /// Merge a tester verdict into the matching record.
    ///
    /// A pass resets retry_count to 0; a failure increments it. Each branch
    /// is one statement, so a concurrent reader never observes a half-applied
    /// outcome.
    pub async fn record_outcome(&self, kind: TestKind, outcome: &TestOutcome) -> Result<()> {
        let now = Utc::now();
        match (kind, outcome.passed) {
            (TestKind::Latency, true) => {
                let protocol = Protocol::from_uri(&outcome.uri)
                    .map(|p| p.as_str())
                    .unwrap_or("vless");
                sqlx::query(
                    r#"
                    INSERT INTO servers
                        (uri, protocol, location, delay_ms, last_checked_at,
                         latency_passed, http_code, retry_count, first_seen_at)
                    VALUES (?, ?, ?, ?, ?, 1, ?, 0, ?)
                    ON CONFLICT(uri) DO UPDATE SET
                        location = COALESCE(excluded.location, servers.location),
                        delay_ms = excluded.delay_ms,
                        last_checked_at = excluded.last_checked_at,
                        latency_passed = 1,
                        http_code = excluded.http_code,
                        retry_count = 0
                    "#,
                )
                .bind(&outcome.uri)
                .bind(protocol)
                .bind(&outcome.location)
                .bind(outcome.delay_ms)
                .bind(now)
                .bind(outcome.http_code)
                .bind(now)
                .execute(&self.pool)
                .await?;
            }
            (TestKind::Latency, false) => {
                let protocol = Protocol::from_uri(&outcome.uri)
                    .map(|p| p.as_str())
                    .unwrap_or("vless");
                // A dead endpoint loses both flags; history is kept
                sqlx::query(
                    r#"
                    INSERT INTO servers
                        (uri, protocol, last_checked_at, latency_passed,
                         http_code, retry_count, first_seen_at)
                    VALUES (?, ?, ?, 0, ?, 1, ?)
                    ON CONFLICT(uri) DO UPDATE SET
                        last_checked_at = excluded.last_checked_at,
                        latency_passed = 0,
                        speed_passed = 0,
                        http_code = excluded.http_code,
                        retry_count = servers.retry_count + 1
                    "#,
                )
                .bind(&outcome.uri)
                .bind(protocol)
                .bind(now)
                .bind(outcome.http_code)
                .bind(now)
                .execute(&self.pool)
                .await?;
            }
            (TestKind::Speed, true) => {
                sqlx::query(
                    r#"
                    UPDATE servers SET
                        speed_passed = 1,
                        download_mbps = ?,
                        last_speed_checked_at = ?,
                        http_code = COALESCE(?, http_code),
                        retry_count = 0
                    WHERE uri = ?
                    "#,
                )
                .bind(outcome.download_mbps)
                .bind(now)
                .bind(outcome.http_code)
                .bind(&outcome.uri)
                .execute(&self.pool)
                .await?;
            }
            (TestKind::Speed, false) => {
                sqlx::query(
                    r#"
                    UPDATE servers SET
                        speed_passed = 0,
                        last_speed_checked_at = ?,
                        retry_count = retry_count + 1
                    WHERE uri = ?
                    "#,
                )
                .bind(now)
                .bind(&outcome.uri)
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }

    /// Persist a batch of outcomes in order.
    pub async fn record_outcomes(&self, kind: TestKind, outcomes: &[TestOutcome]) -> Result<()> {
        for outcome in outcomes {
            self.record_outcome(kind, outcome).await?;
        }
        Ok(())
    }

    /// URIs eligible for a fresh latency test: never tested, stale beyond the
    /// retest window, or failed with retries left.
    ///
    /// Rows that exhausted their retries but whose cool-down has elapsed are
    /// reset to retry_count 0 and become eligible again.
    pub async fn retest_candidates(
        &self,
        retest_window: Duration,
        max_retries: i64,
    ) -> Result<Vec<String>> {
        let threshold: DateTime<Utc> = Utc::now() - retest_window;

        sqlx::query(
            "UPDATE servers SET retry_count = 0 \
             WHERE retry_count >= ? AND last_checked_at IS NOT NULL AND last_checked_at < ?",
        )
        .bind(max_retries)
        .bind(threshold)
        .execute(&self.pool)
        .await?;

        let uris: Vec<String> = sqlx::query_scalar(
            "SELECT uri FROM servers \
             WHERE last_checked_at IS NULL \
                OR last_checked_at < ? \
                OR (latency_passed = 0 AND retry_count < ?) \
             ORDER BY uri",
        )
        .bind(threshold)
        .bind(max_retries)
        .fetch_all(&self.pool)
        .await?;

        Ok(uris)
    }

    /// Speed-phase candidates: per location, the top N latency-passed rows,
    /// non-403 strictly before 403, then ascending delay. Returned as
    /// (location, uri) pairs in rank order.
    pub async fn speed_candidates(&self, max_per_location: i64) -> Result<Vec<(String, String)>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT location, uri FROM (
                SELECT location, uri,
                       ROW_NUMBER() OVER (
                           PARTITION BY location
                           ORDER BY CASE WHEN http_code = 403 THEN 1 ELSE 0 END ASC,
                                    delay_ms ASC
                       ) AS rn
                FROM servers
                WHERE latency_passed = 1 AND location IS NOT NULL AND location != ''
            ) WHERE rn <= ?
            ORDER BY location, rn
            "#,
        )
        .bind(max_per_location)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Enforce the per-location publish cap: rank by (speed_passed desc,
    /// non-403 desc, download desc) and clear speed_passed beyond rank
    /// `max_n`. Soft eviction only; rows are never deleted.
    pub async fn cap_location(&self, location: &str, max_n: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE servers SET speed_passed = 0
            WHERE location = ? AND speed_passed = 1 AND uri IN (
                SELECT uri FROM (
                    SELECT uri,
                           ROW_NUMBER() OVER (
                               ORDER BY speed_passed DESC,
                                        CASE WHEN http_code = 403 THEN 1 ELSE 0 END ASC,
                                        download_mbps DESC
                           ) AS rn
                    FROM servers WHERE location = ?
                ) WHERE rn > ?
            )
            "#,
        )
        .bind(location)
        .bind(location)
        .bind(max_n)
        .execute(&self.pool)
        .await?;

        let evicted = result.rows_affected();
        if evicted > 0 {
            debug!(location, evicted, "capped location");
        }
        Ok(evicted)
    }

    /// Current publishable rows, ordered by location, non-403 first, fastest
    /// download first.
    pub async fn publish_snapshot(&self) -> Result<Vec<EndpointRecord>> {
        let records = sqlx::query_as::<_, EndpointRecord>(
            r#"
            SELECT * FROM servers WHERE speed_passed = 1
            ORDER BY location,
                     CASE WHEN http_code = 403 THEN 1 ELSE 0 END ASC,
                     download_mbps DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    /// Immutable snapshot of every record.
    pub async fn all_records(&self) -> Result<Vec<EndpointRecord>> {
        let records = sqlx::query_as::<_, EndpointRecord>("SELECT * FROM servers ORDER BY uri")
            .fetch_all(&self.pool)
            .await?;
        Ok(records)
    }

    /// Look up one record by URI.
    pub async fn record(&self, uri: &str) -> Result<Option<EndpointRecord>> {
        let record = sqlx::query_as::<_, EndpointRecord>("SELECT * FROM servers WHERE uri = ?")
            .bind(uri)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    /// Last processed message id for a source, if any.
    pub async fn progress(&self, source_id: &str) -> Result<Option<i64>> {
        let cursor: Option<i64> =
            sqlx::query_scalar("SELECT last_message_id FROM source_progress WHERE source_id = ?")
                .bind(source_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(cursor)
    }

    /// Advance the cursor for a source. Monotonic: a smaller id than the
    /// stored one is ignored.
    pub async fn set_progress(&self, source_id: &str, message_id: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO source_progress (source_id, last_message_id, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(source_id) DO UPDATE SET
                last_message_id = MAX(source_progress.last_message_id, excluded.last_message_id),
                updated_at = excluded.updated_at
            "#,
        )
        .bind(source_id)
        .bind(message_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
