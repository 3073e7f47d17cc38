use crate::traits::{InferenceClient, InferenceError};
use crate::types::Result;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Deserialize)]
struct CompletionResponse {
    text: String,
}

/// HTTP implementation of the inference boundary: a JSON completion
/// endpoint with bearer auth. Status codes map onto the retry taxonomy
/// (429 rate limited, 5xx service error, other non-2xx invalid request).
pub struct HttpInferenceClient {
    client: Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

impl HttpInferenceClient {
    pub fn new(
        endpoint: &str,
        model: &str,
        api_key: Option<String>,
        timeout_secs: u64,
    ) -> Result<Self> {
        let endpoint = url::Url::parse(endpoint)?;
        let client = Client::builder()
            .user_agent("paper-digest/0.1")
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            model: model.to_string(),
            api_key,
        })
    }
}

#[async_trait]
impl InferenceClient for HttpInferenceClient {
    async fn infer(&self, prompt: &str) -> std::result::Result<String, InferenceError> {
        let request = CompletionRequest {
            model: &self.model,
            prompt,
            max_tokens: 2048,
            temperature: 0.3,
        };

        let mut builder = self.client.post(&self.endpoint).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                InferenceError::Timeout
            } else {
                InferenceError::ServiceError(e.to_string())
            }
        })?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(InferenceError::RateLimited);
        }
        if status.is_server_error() {
            return Err(InferenceError::ServiceError(format!("HTTP {}", status)));
        }
        if !status.is_success() {
            return Err(InferenceError::InvalidRequest(format!("HTTP {}", status)));
        }

        let completion: CompletionResponse = response
            .json()
            .await
            .map_err(|e| InferenceError::ServiceError(format!("malformed response: {}", e)))?;

        debug!(
            "inference call to {} returned {} chars",
            self.model,
            completion.text.len()
        );
        Ok(completion.text.trim().to_string())
    }
}
