//! Durable sliding-window usage ledger backed by SQLite.
//!
//! The ledger is the source of truth for admission decisions: one append-only
//! record per executed call against the external tool. It must survive process
//! restarts — a fresh process that silently started from zero would let
//! callers blow through the real upstream limit.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::error::Result;

/// Append-only ledger of executed calls with sliding-window queries.
///
/// All timestamps are stored as unix epoch milliseconds. Writes go through a
/// single pool, so a reader that follows a writer always observes the
/// increment (read-after-write consistency).
pub struct UsageLedger {
    pool: SqlitePool,
    window: Duration,
}

impl UsageLedger {
    /// Open (or create) the ledger database.
    ///
    /// Failure here is fatal at startup: a corrupt or unreadable ledger must
    /// never be treated as an empty one.
    pub async fn open(path: &Path, window: Duration) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS usage_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ts INTEGER NOT NULL,
                prompt_hash TEXT NOT NULL,
                response_length INTEGER NOT NULL DEFAULT 0
            )",
        )
        .execute(&pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_usage_records_ts ON usage_records (ts)")
            .execute(&pool)
            .await?;

        Ok(Self { pool, window })
    }

    /// The tracking window this ledger prunes against.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Append a record for a call that actually executed.
    ///
    /// `prompt_hash` and `response_length` are observability metadata; neither
    /// participates in admission decisions.
    pub async fn record_call(&self, prompt_hash: &str, response_length: i64) -> Result<()> {
        sqlx::query("INSERT INTO usage_records (ts, prompt_hash, response_length) VALUES (?, ?, ?)")
            .bind(Utc::now().timestamp_millis())
            .bind(prompt_hash)
            .bind(response_length)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Count records with a timestamp inside the trailing `window`.
    ///
    /// Counts inclusively: a record exactly `window` old is still in scope.
    pub async fn count_in_window(&self, window: Duration) -> Result<u64> {
        let cutoff = Utc::now().timestamp_millis() - window.as_millis() as i64;
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM usage_records WHERE ts >= ?")
                .bind(cutoff)
                .fetch_one(&self.pool)
                .await?;
        Ok(count as u64)
    }

    /// Count records with a timestamp at or after `since`.
    ///
    /// Used for day-level usage stats, where the boundary is a fixed instant
    /// rather than a trailing window.
    pub async fn count_since(&self, since: DateTime<Utc>) -> Result<u64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM usage_records WHERE ts >= ?")
                .bind(since.timestamp_millis())
                .fetch_one(&self.pool)
                .await?;
        Ok(count as u64)
    }

    /// Duration until the oldest in-window record ages out of the window.
    ///
    /// Zero when the window holds no records.
    pub async fn time_until_slot_free(&self) -> Result<Duration> {
        let now = Utc::now().timestamp_millis();
        let cutoff = now - self.window.as_millis() as i64;

        let (oldest,): (Option<i64>,) =
            sqlx::query_as("SELECT MIN(ts) FROM usage_records WHERE ts >= ?")
                .bind(cutoff)
                .fetch_one(&self.pool)
                .await?;

        match oldest {
            Some(ts) => {
                let free_at = ts + self.window.as_millis() as i64;
                Ok(Duration::from_millis(free_at.saturating_sub(now).max(0) as u64))
            }
            None => Ok(Duration::ZERO),
        }
    }

    /// Retention pass: delete records older than the tracking window.
    ///
    /// Returns the number of rows removed.
    pub async fn prune(&self) -> Result<u64> {
        let cutoff = Utc::now().timestamp_millis() - self.window.as_millis() as i64;
        let result = sqlx::query("DELETE FROM usage_records WHERE ts < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Insert a record with an explicit timestamp, for window-boundary tests.
    #[cfg(test)]
    pub(crate) async fn record_call_at(&self, ts: chrono::DateTime<Utc>) -> Result<()> {
        sqlx::query("INSERT INTO usage_records (ts, prompt_hash, response_length) VALUES (?, '', 0)")
            .bind(ts.timestamp_millis())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    async fn open_temp_ledger(window: Duration) -> (UsageLedger, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let ledger = UsageLedger::open(&dir.path().join("ledger.db"), window)
            .await
            .expect("open ledger");
        (ledger, dir)
    }

    #[tokio::test]
    async fn record_and_count() {
        let (ledger, _dir) = open_temp_ledger(Duration::from_secs(3600)).await;

        assert_eq!(ledger.count_in_window(Duration::from_secs(3600)).await.unwrap(), 0);

        ledger.record_call("hash-a", 42).await.unwrap();
        ledger.record_call("hash-b", 7).await.unwrap();

        assert_eq!(ledger.count_in_window(Duration::from_secs(3600)).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn count_excludes_records_outside_window() {
        let (ledger, _dir) = open_temp_ledger(Duration::from_secs(3600)).await;

        // One record well outside the window, one inside.
        ledger
            .record_call_at(Utc::now() - chrono::Duration::seconds(7200))
            .await
            .unwrap();
        ledger.record_call("recent", 1).await.unwrap();

        assert_eq!(ledger.count_in_window(Duration::from_secs(3600)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn slot_free_time_tracks_oldest_record() {
        let (ledger, _dir) = open_temp_ledger(Duration::from_secs(3600)).await;

        // Empty window: nothing to wait for.
        assert_eq!(ledger.time_until_slot_free().await.unwrap(), Duration::ZERO);

        // A record from 50 minutes ago frees its slot in ~10 minutes.
        ledger
            .record_call_at(Utc::now() - chrono::Duration::minutes(50))
            .await
            .unwrap();
        ledger.record_call("now", 1).await.unwrap();

        let wait = ledger.time_until_slot_free().await.unwrap();
        assert!(wait > Duration::from_secs(9 * 60), "wait was {wait:?}");
        assert!(wait <= Duration::from_secs(10 * 60), "wait was {wait:?}");
    }

    #[tokio::test]
    async fn count_since_uses_a_fixed_boundary() {
        let (ledger, _dir) = open_temp_ledger(Duration::from_secs(3600)).await;

        ledger
            .record_call_at(Utc::now() - chrono::Duration::days(2))
            .await
            .unwrap();
        ledger.record_call("recent", 1).await.unwrap();

        let day_start = Utc::now()
            .date_naive()
            .and_time(chrono::NaiveTime::MIN)
            .and_utc();
        assert_eq!(ledger.count_since(day_start).await.unwrap(), 1);
        assert_eq!(
            ledger
                .count_since(Utc::now() - chrono::Duration::days(7))
                .await
                .unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn prune_removes_only_expired_records() {
        let (ledger, _dir) = open_temp_ledger(Duration::from_secs(3600)).await;

        ledger
            .record_call_at(Utc::now() - chrono::Duration::seconds(7200))
            .await
            .unwrap();
        ledger.record_call("recent", 1).await.unwrap();

        assert_eq!(ledger.prune().await.unwrap(), 1);
        assert_eq!(ledger.count_in_window(Duration::from_secs(3600)).await.unwrap(), 1);

        // Second pass is a no-op.
        assert_eq!(ledger.prune().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn persists_across_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ledger.db");

        {
            let ledger = UsageLedger::open(&path, Duration::from_secs(3600))
                .await
                .unwrap();
            ledger.record_call("hash", 10).await.unwrap();
        }

        let reopened = UsageLedger::open(&path, Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(
            reopened.count_in_window(Duration::from_secs(3600)).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn corrupt_database_is_a_hard_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ledger.db");

        let mut file = std::fs::File::create(&path).expect("create file");
        file.write_all(b"this is not a sqlite database, promise")
            .expect("write garbage");
        drop(file);

        let result = UsageLedger::open(&path, Duration::from_secs(3600)).await;
        assert!(result.is_err(), "corrupt ledger must not open cleanly");
    }
}
