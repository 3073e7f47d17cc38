use crate::traits::{InferenceClient, InferenceError};
use crate::types::{CancelSignal, PaperRecord, SummarizerConfig, SummaryResult, SummaryStatus};
use backoff::{backoff::Backoff, exponential::ExponentialBackoff};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Turns paper records into natural-language summaries through a remote
/// inference endpoint, with bounded retries and a deterministic fallback.
pub struct Summarizer {
    client: Arc<dyn InferenceClient>,
    config: SummarizerConfig,
}

impl Summarizer {
    pub fn new(client: Arc<dyn InferenceClient>, config: SummarizerConfig) -> Self {
        Self { client, config }
    }

    /// Summarizes papers with a bounded worker pool. Completion order is
    /// arbitrary; results carry their paper id so the caller can restore
    /// canonical order. Papers not yet started when the run is cancelled
    /// fall back without issuing an inference call.
    pub async fn summarize_all(
        &self,
        papers: &[PaperRecord],
        cancel: &CancelSignal,
    ) -> Vec<SummaryResult> {
        stream::iter(papers)
            .map(|paper| self.summarize_guarded(paper, cancel))
            .buffer_unordered(self.config.workers.max(1))
            .collect()
            .await
    }

    async fn summarize_guarded(&self, paper: &PaperRecord, cancel: &CancelSignal) -> SummaryResult {
        if cancel.is_cancelled() {
            debug!("run cancelled, skipping summarization of {}", paper.id);
            return self.fallback(paper, 0);
        }
        self.summarize(paper).await
    }

    /// Summarizes one paper: up to `max_attempts` inference calls with
    /// exponential backoff, retrying only retryable failure classes. On
    /// exhaustion the truncated abstract stands in for the summary; a
    /// failed paper never aborts the run.
    pub async fn summarize(&self, paper: &PaperRecord) -> SummaryResult {
        let prompt = build_prompt(paper);

        let mut backoff: ExponentialBackoff<backoff::SystemClock> = ExponentialBackoff {
            current_interval: Duration::from_millis(self.config.base_delay_ms),
            initial_interval: Duration::from_millis(self.config.base_delay_ms),
            max_interval: Duration::from_millis(self.config.max_delay_ms),
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        };

        let mut attempts = 0u32;

        while attempts < self.config.max_attempts {
            attempts += 1;

            match self.attempt(&prompt).await {
                Ok(text) => {
                    debug!(
                        "summarized {} on attempt {} ({} chars)",
                        paper.id,
                        attempts,
                        text.len()
                    );
                    return SummaryResult {
                        paper_id: paper.id.clone(),
                        summary_text: text,
                        status: SummaryStatus::Ok,
                        attempt_count: attempts,
                    };
                }
                Err(error) => {
                    if !error.is_retryable() {
                        warn!("non-retryable inference failure for {}: {}", paper.id, error);
                        break;
                    }

                    if attempts < self.config.max_attempts {
                        if let Some(delay) = backoff.next_backoff() {
                            warn!(
                                "attempt {} failed for {} ({}), retrying in {:?}",
                                attempts, paper.id, error, delay
                            );
                            tokio::time::sleep(delay).await;
                        }
                    } else {
                        warn!(
                            "inference exhausted after {} attempts for {}: {}",
                            attempts, paper.id, error
                        );
                    }
                }
            }
        }

        self.fallback(paper, attempts)
    }

    async fn attempt(&self, prompt: &str) -> std::result::Result<String, InferenceError> {
        let timeout = Duration::from_secs(self.config.request_timeout_secs);
        match tokio::time::timeout(timeout, self.client.infer(prompt)).await {
            Ok(result) => result,
            Err(_) => Err(InferenceError::Timeout),
        }
    }

    fn fallback(&self, paper: &PaperRecord, attempts: u32) -> SummaryResult {
        SummaryResult {
            paper_id: paper.id.clone(),
            summary_text: fallback_summary(paper, self.config.fallback_max_chars),
            status: SummaryStatus::FailedFallback,
            attempt_count: attempts,
        }
    }
}

/// Prompt asking for a short newsletter-style summary from the paper
/// metadata and abstract.
pub fn build_prompt(paper: &PaperRecord) -> String {
    format!(
        "Summarize the following AI research paper in 3-4 sentences for a \
         technical newsletter. Focus on the core contribution and why it \
         matters.\n\nTitle: {}\nAuthors: {}\n\nAbstract:\n{}",
        paper.title,
        paper.authors.join(", "),
        paper.abstract_text
    )
}

/// Deterministic substitute when inference is unavailable: the abstract,
/// truncated on a character boundary.
fn fallback_summary(paper: &PaperRecord, max_chars: usize) -> String {
    let text = paper.abstract_text.trim();
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut truncated: String = text.chars().take(max_chars).collect();
    truncated.push_str("...");
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn paper(id: &str, abstract_text: &str) -> PaperRecord {
        PaperRecord {
            id: id.to_string(),
            title: format!("Paper {}", id),
            authors: vec!["A. Author".to_string(), "B. Author".to_string()],
            abstract_text: abstract_text.to_string(),
            url: format!("https://arxiv.org/abs/{}", id),
            published_at: Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
        }
    }

    fn fast_config() -> SummarizerConfig {
        SummarizerConfig {
            base_delay_ms: 1,
            max_delay_ms: 2,
            ..SummarizerConfig::default()
        }
    }

    struct RateLimitedClient {
        calls: AtomicU32,
    }

    #[async_trait]
    impl InferenceClient for RateLimitedClient {
        async fn infer(&self, _prompt: &str) -> std::result::Result<String, InferenceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(InferenceError::RateLimited)
        }
    }

    struct InvalidRequestClient {
        calls: AtomicU32,
    }

    #[async_trait]
    impl InferenceClient for InvalidRequestClient {
        async fn infer(&self, _prompt: &str) -> std::result::Result<String, InferenceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(InferenceError::InvalidRequest("prompt rejected".to_string()))
        }
    }

    struct EchoClient;

    #[async_trait]
    impl InferenceClient for EchoClient {
        async fn infer(&self, prompt: &str) -> std::result::Result<String, InferenceError> {
            Ok(format!("summary of: {}", prompt.lines().next().unwrap_or("")))
        }
    }

    #[tokio::test]
    async fn rate_limited_endpoint_falls_back_after_three_attempts() {
        let client = Arc::new(RateLimitedClient {
            calls: AtomicU32::new(0),
        });
        let summarizer = Summarizer::new(client.clone(), fast_config());

        let result = summarizer.summarize(&paper("2401.1", "A short abstract.")).await;

        assert_eq!(result.status, SummaryStatus::FailedFallback);
        assert_eq!(result.attempt_count, 3);
        assert_eq!(client.calls.load(Ordering::SeqCst), 3);
        assert_eq!(result.summary_text, "A short abstract.");
    }

    #[tokio::test]
    async fn invalid_request_falls_back_without_retrying() {
        let client = Arc::new(InvalidRequestClient {
            calls: AtomicU32::new(0),
        });
        let summarizer = Summarizer::new(client.clone(), fast_config());

        let result = summarizer.summarize(&paper("2401.2", "Another abstract.")).await;

        assert_eq!(result.status, SummaryStatus::FailedFallback);
        assert_eq!(result.attempt_count, 1);
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn successful_inference_reports_single_attempt() {
        let summarizer = Summarizer::new(Arc::new(EchoClient), fast_config());

        let result = summarizer.summarize(&paper("2401.3", "An abstract.")).await;

        assert_eq!(result.status, SummaryStatus::Ok);
        assert_eq!(result.attempt_count, 1);
        assert!(result.summary_text.starts_with("summary of:"));
    }

    #[tokio::test]
    async fn summarize_all_reassociates_results_by_paper_id() {
        let summarizer = Summarizer::new(Arc::new(EchoClient), fast_config());
        let papers = vec![
            paper("2401.4", "First."),
            paper("2401.5", "Second."),
            paper("2401.6", "Third."),
        ];

        let results = summarizer.summarize_all(&papers, &CancelSignal::new()).await;

        assert_eq!(results.len(), 3);
        let mut ids: Vec<&str> = results.iter().map(|r| r.paper_id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["2401.4", "2401.5", "2401.6"]);
    }

    #[tokio::test]
    async fn cancelled_run_skips_inference_calls() {
        let client = Arc::new(RateLimitedClient {
            calls: AtomicU32::new(0),
        });
        let summarizer = Summarizer::new(client.clone(), fast_config());
        let cancel = CancelSignal::new();
        cancel.cancel();

        let results = summarizer
            .summarize_all(&[paper("2401.7", "Abstract.")], &cancel)
            .await;

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, SummaryStatus::FailedFallback);
        assert_eq!(results[0].attempt_count, 0);
        assert_eq!(client.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn fallback_truncates_long_abstracts_deterministically() {
        let long = "word ".repeat(500);
        let p = paper("2401.8", &long);
        let first = fallback_summary(&p, 100);
        let second = fallback_summary(&p, 100);
        assert_eq!(first, second);
        assert!(first.ends_with("..."));
        assert_eq!(first.chars().count(), 103);
    }
}
