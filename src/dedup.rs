use crate::types::{DedupConfig, DedupEntry, DigestError, PaperRecord, Result};
use backoff::{backoff::Backoff, exponential::ExponentialBackoff};
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Durable record of papers already included in a digest, plus the advisory
/// run lock. The only state shared across runs.
pub struct DedupStore {
    pool: SqlitePool,
    config: DedupConfig,
}

impl DedupStore {
    pub async fn connect(database_url: &str, config: DedupConfig) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

        // Single connection: the store is only ever used by one run at a
        // time, and it keeps in-memory databases coherent in tests.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = Self { pool, config };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS delivered_papers (
                paper_id TEXT PRIMARY KEY,
                delivered_at TEXT NOT NULL,
                run_id TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS run_lock (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                run_id TEXT NOT NULL,
                acquired_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Returns only papers whose id is not yet recorded, preserving input
    /// order. A storage fault here is fatal to the run.
    pub async fn filter_unseen(&self, papers: Vec<PaperRecord>) -> Result<Vec<PaperRecord>> {
        if papers.is_empty() {
            return Ok(papers);
        }

        let rows = sqlx::query("SELECT paper_id FROM delivered_papers")
            .fetch_all(&self.pool)
            .await?;
        let seen: HashSet<String> = rows
            .into_iter()
            .map(|row| row.get::<String, _>("paper_id"))
            .collect();

        let unseen: Vec<PaperRecord> = papers
            .into_iter()
            .filter(|paper| !seen.contains(&paper.id))
            .collect();

        debug!(
            "filtered papers: {} unseen of {} already recorded",
            unseen.len(),
            seen.len()
        );
        Ok(unseen)
    }

    /// Records the given paper ids as covered, atomically and idempotently.
    /// Re-committing an already-present id is a no-op.
    pub async fn commit(&self, paper_ids: &HashSet<String>, run_id: Uuid) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        for paper_id in paper_ids {
            sqlx::query(
                r#"
                INSERT INTO delivered_papers (paper_id, delivered_at, run_id)
                VALUES (?1, ?2, ?3)
                ON CONFLICT(paper_id) DO NOTHING
                "#,
            )
            .bind(paper_id)
            .bind(now)
            .bind(run_id.to_string())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        info!("committed {} paper ids for run {}", paper_ids.len(), run_id);
        Ok(())
    }

    /// Commit with bounded backoff. Used after delivery, where giving up
    /// means accepting that papers may be re-sent on the next run.
    pub async fn commit_with_retry(&self, paper_ids: &HashSet<String>, run_id: Uuid) -> Result<()> {
        let mut backoff: ExponentialBackoff<backoff::SystemClock> = ExponentialBackoff {
            current_interval: Duration::from_millis(self.config.retry_delay_ms),
            initial_interval: Duration::from_millis(self.config.retry_delay_ms),
            max_interval: Duration::from_millis(self.config.retry_delay_ms * 16),
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        };

        let mut last_error = None;

        for attempt in 0..=self.config.commit_retries {
            match self.commit(paper_ids, run_id).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!("dedup commit attempt {} failed: {}", attempt + 1, e);
                    last_error = Some(e);

                    if attempt < self.config.commit_retries {
                        if let Some(delay) = backoff.next_backoff() {
                            tokio::time::sleep(delay).await;
                        }
                    }
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| DigestError::General("dedup commit failed".to_string())))
    }

    /// Acquires the single-run advisory lock. Stale locks (crashed runs) are
    /// taken over after the configured age.
    pub async fn acquire_run_lock(&self, run_id: Uuid) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let cutoff = Utc::now() - chrono::Duration::seconds(self.config.lock_stale_secs);
        sqlx::query("DELETE FROM run_lock WHERE acquired_at < ?1")
            .bind(cutoff)
            .execute(&mut *tx)
            .await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO run_lock (id, run_id, acquired_at)
            VALUES (1, ?1, ?2)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(run_id.to_string())
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            let holder: String = sqlx::query("SELECT run_id FROM run_lock WHERE id = 1")
                .fetch_one(&mut *tx)
                .await?
                .get("run_id");
            return Err(DigestError::LockHeld { holder });
        }

        tx.commit().await?;
        debug!("acquired run lock for run {}", run_id);
        Ok(())
    }

    pub async fn release_run_lock(&self, run_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM run_lock WHERE run_id = ?1")
            .bind(run_id.to_string())
            .execute(&self.pool)
            .await?;
        debug!("released run lock for run {}", run_id);
        Ok(())
    }

    pub async fn entry(&self, paper_id: &str) -> Result<Option<DedupEntry>> {
        let row = sqlx::query(
            "SELECT paper_id, delivered_at, run_id FROM delivered_papers WHERE paper_id = ?1",
        )
        .bind(paper_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| DedupEntry {
            paper_id: row.get("paper_id"),
            delivered_at: row.get("delivered_at"),
            run_id: row.get("run_id"),
        }))
    }

    pub async fn entry_count(&self) -> Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM delivered_papers")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("n") as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn paper(id: &str) -> PaperRecord {
        PaperRecord {
            id: id.to_string(),
            title: format!("Paper {}", id),
            authors: vec!["A. Author".to_string()],
            abstract_text: "An abstract.".to_string(),
            url: format!("https://arxiv.org/abs/{}", id),
            published_at: Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
        }
    }

    async fn memory_store() -> DedupStore {
        DedupStore::connect("sqlite::memory:", DedupConfig::default())
            .await
            .expect("in-memory store")
    }

    #[tokio::test]
    async fn commit_is_idempotent() {
        let store = memory_store().await;
        let run_a = Uuid::new_v4();
        let run_b = Uuid::new_v4();
        let ids: HashSet<String> = ["x", "y"].iter().map(|s| s.to_string()).collect();

        store.commit(&ids, run_a).await.unwrap();
        assert_eq!(store.entry_count().await.unwrap(), 2);
        let first = store.entry("x").await.unwrap().unwrap();

        store.commit(&ids, run_b).await.unwrap();
        assert_eq!(store.entry_count().await.unwrap(), 2);

        // The original entry survives the second commit untouched
        let second = store.entry("x").await.unwrap().unwrap();
        assert_eq!(first.run_id, second.run_id);
        assert_eq!(first.delivered_at, second.delivered_at);
    }

    #[tokio::test]
    async fn filter_excludes_committed_ids_across_runs() {
        let store = memory_store().await;
        let run_id = Uuid::new_v4();

        let first_batch = vec![paper("2401.00001"), paper("2401.00002")];
        let unseen = store.filter_unseen(first_batch).await.unwrap();
        assert_eq!(unseen.len(), 2);

        let ids: HashSet<String> = unseen.iter().map(|p| p.id.clone()).collect();
        store.commit(&ids, run_id).await.unwrap();

        // Second run sees one overlapping and one genuinely new paper
        let second_batch = vec![paper("2401.00002"), paper("2401.00003")];
        let unseen = store.filter_unseen(second_batch).await.unwrap();
        assert_eq!(unseen.len(), 1);
        assert_eq!(unseen[0].id, "2401.00003");
    }

    #[tokio::test]
    async fn filter_preserves_input_order() {
        let store = memory_store().await;
        let papers = vec![paper("c"), paper("a"), paper("b")];
        let unseen = store.filter_unseen(papers).await.unwrap();
        let ids: Vec<&str> = unseen.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[tokio::test]
    async fn run_lock_rejects_second_holder() {
        let store = memory_store().await;
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        store.acquire_run_lock(first).await.unwrap();

        match store.acquire_run_lock(second).await {
            Err(DigestError::LockHeld { holder }) => {
                assert_eq!(holder, first.to_string());
            }
            other => panic!("expected LockHeld, got {:?}", other.map(|_| ())),
        }

        store.release_run_lock(first).await.unwrap();
        store.acquire_run_lock(second).await.unwrap();
    }
}
