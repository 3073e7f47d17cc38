use crate::types::{PaperRecord, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Trait for catalogs that yield candidate papers (arXiv API, weekly paper
/// listings, etc.)
#[async_trait]
pub trait PaperSource: Send + Sync {
    /// Human-readable name for this source
    fn source_name(&self) -> String;

    /// Fetch papers published after `since`. A failure here is fatal to the
    /// run and surfaces as `DigestError::SourceUnavailable`.
    async fn fetch_recent(&self, since: DateTime<Utc>) -> Result<Vec<PaperRecord>>;
}

/// Failure classes at the inference boundary. Everything except
/// `InvalidRequest` is worth retrying.
#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("inference request timed out")]
    Timeout,

    #[error("inference endpoint rate limited")]
    RateLimited,

    #[error("inference service error: {0}")]
    ServiceError(String),

    #[error("invalid inference request: {0}")]
    InvalidRequest(String),
}

impl InferenceError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::InvalidRequest(_))
    }
}

/// Trait for remote language-model endpoints
#[async_trait]
pub trait InferenceClient: Send + Sync {
    async fn infer(&self, prompt: &str) -> std::result::Result<String, InferenceError>;
}

#[derive(Debug, Clone)]
pub struct OutboundEmail {
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// Per-recipient acceptance as reported by the channel for one batch call
#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub to: String,
    pub accepted: bool,
    pub error: Option<String>,
}

/// Batch-level channel failures. Transient errors get the batch retried;
/// an outage stops the dispatcher from sending further batches.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("transient channel error: {0}")]
    Transient(String),

    #[error("channel outage: {0}")]
    Outage(String),
}

impl ChannelError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Trait for bulk email channels
#[async_trait]
pub trait EmailChannel: Send + Sync {
    /// Send one batch of messages, returning per-recipient outcomes. An
    /// `Err` means the batch call failed as a whole.
    async fn send_batch(
        &self,
        messages: &[OutboundEmail],
    ) -> std::result::Result<Vec<SendOutcome>, ChannelError>;
}
