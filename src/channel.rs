use crate::traits::{ChannelError, EmailChannel, OutboundEmail, SendOutcome};
use crate::types::{DigestError, Result};
use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::{debug, warn};

/// SMTP implementation of the bulk email channel. One transport connection
/// pool, messages of a batch sent sequentially; per-recipient rejections
/// become outcomes, transient server responses and connection failures
/// become batch-level channel errors.
pub struct SmtpChannel {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpChannel {
    pub fn new(
        host: &str,
        port: u16,
        credentials: Option<(String, String)>,
        from: &str,
    ) -> Result<Self> {
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::relay(host)
            .map_err(|e| DigestError::Email(format!("SMTP relay setup failed: {}", e)))?
            .port(port);

        if let Some((username, password)) = credentials {
            builder = builder.credentials(Credentials::new(username, password));
        }

        Ok(Self {
            transport: builder.build(),
            from: parse_mailbox(from)?,
        })
    }

    /// Plaintext transport without TLS. Local testing only.
    pub fn insecure(host: &str, port: u16, from: &str) -> Result<Self> {
        let transport = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host)
            .port(port)
            .build();

        Ok(Self {
            transport,
            from: parse_mailbox(from)?,
        })
    }
}

fn parse_mailbox(address: &str) -> Result<Mailbox> {
    address
        .parse::<Mailbox>()
        .map_err(|e| DigestError::Email(format!("invalid address '{}': {}", address, e)))
}

#[async_trait]
impl EmailChannel for SmtpChannel {
    async fn send_batch(
        &self,
        messages: &[OutboundEmail],
    ) -> std::result::Result<Vec<SendOutcome>, ChannelError> {
        let mut outcomes = Vec::with_capacity(messages.len());

        for outbound in messages {
            let to = match outbound.to.parse::<Mailbox>() {
                Ok(mailbox) => mailbox,
                Err(e) => {
                    outcomes.push(SendOutcome {
                        to: outbound.to.clone(),
                        accepted: false,
                        error: Some(format!("invalid address: {}", e)),
                    });
                    continue;
                }
            };

            let message = match Message::builder()
                .from(self.from.clone())
                .to(to)
                .subject(&outbound.subject)
                .body(outbound.body.clone())
            {
                Ok(message) => message,
                Err(e) => {
                    outcomes.push(SendOutcome {
                        to: outbound.to.clone(),
                        accepted: false,
                        error: Some(format!("message build failed: {}", e)),
                    });
                    continue;
                }
            };

            match self.transport.send(message).await {
                Ok(_) => {
                    debug!("accepted by SMTP server: {}", outbound.to);
                    outcomes.push(SendOutcome {
                        to: outbound.to.clone(),
                        accepted: true,
                        error: None,
                    });
                }
                // Permanent rejection of this recipient only
                Err(e) if e.is_permanent() => {
                    warn!("SMTP rejected {}: {}", outbound.to, e);
                    outcomes.push(SendOutcome {
                        to: outbound.to.clone(),
                        accepted: false,
                        error: Some(e.to_string()),
                    });
                }
                Err(e) if e.is_transient() => {
                    return Err(ChannelError::Transient(e.to_string()));
                }
                Err(e) => {
                    return Err(ChannelError::Outage(e.to_string()));
                }
            }
        }

        Ok(outcomes)
    }
}
