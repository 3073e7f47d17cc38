use crate::composer::DigestEmail;
use crate::traits::{ChannelError, EmailChannel, OutboundEmail, SendOutcome};
use crate::types::{CancelSignal, DeliveryRecord, DeliveryStatus, DigestDocument, DispatcherConfig};
use backoff::{backoff::Backoff, exponential::ExponentialBackoff};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Sends the rendered digest to the subscriber list in fixed-size batches.
/// Batches go out sequentially in recipient-list order to keep channel rate
/// limits deterministic.
pub struct Dispatcher {
    channel: Arc<dyn EmailChannel>,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(channel: Arc<dyn EmailChannel>, config: DispatcherConfig) -> Self {
        Self { channel, config }
    }

    /// Dispatches the digest, producing exactly one DeliveryRecord per
    /// recipient. Transient batch failures retry the whole batch up to the
    /// configured count before its members are marked failed; a channel
    /// outage marks the current batch failed and records every recipient of
    /// un-sent batches as skipped.
    pub async fn dispatch(
        &self,
        digest: &DigestDocument,
        email: &DigestEmail,
        recipients: &[String],
        cancel: &CancelSignal,
    ) -> Vec<DeliveryRecord> {
        let mut records = Vec::with_capacity(recipients.len());
        let mut channel_down = false;

        for batch in recipients.chunks(self.config.batch_size.max(1)) {
            if channel_down {
                self.record_skipped(&mut records, digest, batch, "channel outage");
                continue;
            }
            if cancel.is_cancelled() {
                self.record_skipped(&mut records, digest, batch, "run cancelled");
                continue;
            }

            match self.send_batch_with_retry(email, batch).await {
                Ok(outcomes) => {
                    let by_recipient: HashMap<&str, &SendOutcome> =
                        outcomes.iter().map(|o| (o.to.as_str(), o)).collect();

                    for recipient in batch {
                        let record = match by_recipient.get(recipient.as_str()) {
                            Some(outcome) if outcome.accepted => DeliveryRecord {
                                run_id: digest.run_id,
                                recipient: recipient.clone(),
                                status: DeliveryStatus::Sent,
                                error_detail: None,
                            },
                            Some(outcome) => DeliveryRecord {
                                run_id: digest.run_id,
                                recipient: recipient.clone(),
                                status: DeliveryStatus::Failed,
                                error_detail: Some(
                                    outcome
                                        .error
                                        .clone()
                                        .unwrap_or_else(|| "rejected by channel".to_string()),
                                ),
                            },
                            None => DeliveryRecord {
                                run_id: digest.run_id,
                                recipient: recipient.clone(),
                                status: DeliveryStatus::Failed,
                                error_detail: Some("no outcome reported for recipient".to_string()),
                            },
                        };
                        records.push(record);
                    }
                }
                Err(error) => {
                    warn!("batch of {} recipients failed: {}", batch.len(), error);
                    for recipient in batch {
                        records.push(DeliveryRecord {
                            run_id: digest.run_id,
                            recipient: recipient.clone(),
                            status: DeliveryStatus::Failed,
                            error_detail: Some(error.to_string()),
                        });
                    }
                    if !error.is_transient() {
                        channel_down = true;
                    }
                }
            }
        }

        let sent = records
            .iter()
            .filter(|r| r.status == DeliveryStatus::Sent)
            .count();
        info!(
            "dispatch for run {} finished: {} sent of {} recipients",
            digest.run_id,
            sent,
            recipients.len()
        );
        records
    }

    async fn send_batch_with_retry(
        &self,
        email: &DigestEmail,
        batch: &[String],
    ) -> std::result::Result<Vec<SendOutcome>, ChannelError> {
        let messages: Vec<OutboundEmail> = batch
            .iter()
            .map(|to| OutboundEmail {
                to: to.clone(),
                subject: email.subject.clone(),
                body: email.body.clone(),
            })
            .collect();

        let mut backoff: ExponentialBackoff<backoff::SystemClock> = ExponentialBackoff {
            current_interval: Duration::from_millis(self.config.retry_delay_ms),
            initial_interval: Duration::from_millis(self.config.retry_delay_ms),
            max_interval: Duration::from_millis(self.config.retry_delay_ms * 8),
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        };

        let mut attempts = 0u32;

        loop {
            attempts += 1;
            match self.channel.send_batch(&messages).await {
                Ok(outcomes) => {
                    debug!("batch of {} accepted on attempt {}", messages.len(), attempts);
                    return Ok(outcomes);
                }
                Err(error) if error.is_transient() && attempts <= self.config.batch_retries => {
                    if let Some(delay) = backoff.next_backoff() {
                        warn!(
                            "transient batch failure on attempt {} ({}), retrying in {:?}",
                            attempts, error, delay
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(error) => return Err(error),
            }
        }
    }

    fn record_skipped(
        &self,
        records: &mut Vec<DeliveryRecord>,
        digest: &DigestDocument,
        batch: &[String],
        reason: &str,
    ) {
        for recipient in batch {
            records.push(DeliveryRecord {
                run_id: digest.run_id,
                recipient: recipient.clone(),
                status: DeliveryStatus::Skipped,
                error_detail: Some(reason.to_string()),
            });
        }
    }
}
