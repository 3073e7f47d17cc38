use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// A paper as fetched from the source catalog. Immutable once fetched;
/// identity is the canonical source-stable `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperRecord {
    pub id: String,
    pub title: String,
    pub authors: Vec<String>,
    pub abstract_text: String,
    pub url: String,
    pub published_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummaryStatus {
    Ok,
    FailedFallback,
}

/// One summary per paper per run. Never persisted outside the digest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryResult {
    pub paper_id: String,
    pub summary_text: String,
    pub status: SummaryStatus,
    pub attempt_count: u32,
}

/// The composed digest for one run. Immutable after composition; summaries
/// are ordered by published_at descending, paper id ascending on ties.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DigestDocument {
    pub run_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub summaries: Vec<SummaryResult>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Sent,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub run_id: Uuid,
    pub recipient: String,
    pub status: DeliveryStatus,
    pub error_detail: Option<String>,
}

/// Persistent record that a paper was included in a composed digest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupEntry {
    pub paper_id: String,
    pub delivered_at: DateTime<Utc>,
    pub run_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Fetching,
    Filtering,
    Summarizing,
    Composing,
    Dispatching,
    Committing,
    Done,
    Aborted,
}

/// Structured outcome of one pipeline run. Always produced, even for
/// aborted runs, so operators can tell "nothing new" from "failed early".
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub papers_considered: usize,
    pub papers_new: usize,
    pub papers_summarized_ok: usize,
    pub papers_fallback: usize,
    pub recipients_sent: usize,
    pub recipients_failed: usize,
    pub recipients_skipped: usize,
    pub final_state: RunState,
    pub warnings: Vec<String>,
    pub failure: Option<String>,
}

impl RunReport {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            papers_considered: 0,
            papers_new: 0,
            papers_summarized_ok: 0,
            papers_fallback: 0,
            recipients_sent: 0,
            recipients_failed: 0,
            recipients_skipped: 0,
            final_state: RunState::Fetching,
            warnings: Vec::new(),
            failure: None,
        }
    }

    pub fn abort(&mut self, reason: String) {
        self.failure = Some(reason);
        self.final_state = RunState::Aborted;
    }
}

/// Run-level cancellation flag. Components check it before issuing new
/// inference or email calls; in-flight calls finish or time out normally.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    flag: Arc<AtomicBool>,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct SummarizerConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub request_timeout_secs: u64,
    pub workers: usize,
    pub fallback_max_chars: usize,
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            request_timeout_secs: 90,
            workers: 4,
            fallback_max_chars: 600,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub batch_size: usize,
    pub batch_retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            batch_retries: 2,
            retry_delay_ms: 2000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DedupConfig {
    pub commit_retries: u32,
    pub retry_delay_ms: u64,
    pub lock_stale_secs: i64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            commit_retries: 3,
            retry_delay_ms: 500,
            lock_stale_secs: 3600,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DigestError {
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("run lock already held by run {holder}")]
    LockHeld { holder: String },

    #[error("email error: {0}")]
    Email(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    General(String),
}

pub type Result<T> = std::result::Result<T, DigestError>;
