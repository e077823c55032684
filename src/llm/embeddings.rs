//! Batch embedding generation against an OpenAI-compatible embeddings API.
//!
//! Transient failures (rate limits, 5xx, transport errors) are retried with
//! capped exponential backoff; anything else surfaces as `EMBED_FAILED`.
//! The response must carry exactly one vector per input of the configured
//! dimension — a mismatch is an invariant violation, not a retry.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::EmbeddingConfig;
use crate::error::{Error, Result};

/// Base delay for the first retry; doubles per attempt.
const BACKOFF_BASE: Duration = Duration::from_secs(1);
/// Ceiling on any single backoff sleep.
const BACKOFF_CAP: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct EmbeddingClient {
    http: reqwest::Client,
    config: EmbeddingConfig,
    dimension: usize,
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbedResponse {
    data: Vec<EmbedData>,
}

#[derive(Deserialize)]
struct EmbedData {
    embedding: Vec<f32>,
}

impl EmbeddingClient {
    /// Fails when the configured model is unknown and no explicit dimension
    /// was provided; there is no silent fallback model.
    pub fn new(http: reqwest::Client, config: EmbeddingConfig) -> Result<Self> {
        let dimension = config.resolved_dimension()?;
        Ok(Self {
            http,
            config,
            dimension,
        })
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Embed `texts`, batching at the configured batch size. Returns one
    /// vector per input, in order.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut all_embeddings = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.config.batch_size.max(1)) {
            let embeddings = self.embed_with_retry(batch).await?;
            all_embeddings.extend(embeddings);
        }

        if all_embeddings.len() != texts.len() {
            return Err(Error::Internal(format!(
                "embedding count mismatch: got {}, expected {}",
                all_embeddings.len(),
                texts.len()
            )));
        }

        Ok(all_embeddings)
    }

    pub async fn embed_single(&self, text: &str) -> Result<Vec<f32>> {
        let mut embeddings = self.embed_batch(&[text.to_string()]).await?;
        embeddings
            .pop()
            .ok_or_else(|| Error::internal("no embedding returned"))
    }

    async fn embed_with_retry(&self, batch: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut last_err = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let delay = backoff_delay(attempt - 1);
                tracing::warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "retrying embedding batch"
                );
                tokio::time::sleep(delay).await;
            }

            match self.embed_once(batch).await {
                Ok(embeddings) => return Ok(embeddings),
                Err(RequestFailure::Transient(msg)) => {
                    last_err = Some(msg);
                }
                Err(RequestFailure::Fatal(err)) => return Err(err),
            }
        }

        Err(Error::EmbedFailed(format!(
            "exhausted {} retries: {}",
            self.config.max_retries,
            last_err.unwrap_or_default()
        )))
    }

    async fn embed_once(
        &self,
        batch: &[String],
    ) -> std::result::Result<Vec<Vec<f32>>, RequestFailure> {
        let url = format!(
            "{}/v1/embeddings",
            self.config.base_url.trim_end_matches('/')
        );
        let req = EmbedRequest {
            model: &self.config.model,
            input: batch,
        };

        let mut request = self
            .http
            .post(&url)
            .timeout(Duration::from_secs(self.config.timeout_secs))
            .json(&req);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let resp = request
            .send()
            .await
            .map_err(|e| RequestFailure::Transient(format!("transport error: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            if is_retryable_status(status.as_u16()) {
                return Err(RequestFailure::Transient(format!(
                    "embedding API returned {status}: {body}"
                )));
            }
            return Err(RequestFailure::Fatal(Error::EmbedFailed(format!(
                "embedding API returned {status}: {body}"
            ))));
        }

        let body: EmbedResponse = resp.json().await.map_err(|e| {
            RequestFailure::Fatal(Error::EmbedFailed(format!("invalid response: {e}")))
        })?;

        if body.data.len() != batch.len() {
            return Err(RequestFailure::Fatal(Error::Internal(format!(
                "embedding count mismatch: got {}, expected {}",
                body.data.len(),
                batch.len()
            ))));
        }

        let embeddings: Vec<Vec<f32>> = body.data.into_iter().map(|d| d.embedding).collect();
        for embedding in &embeddings {
            if embedding.len() != self.dimension {
                return Err(RequestFailure::Fatal(Error::Internal(format!(
                    "embedding dimension mismatch: got {}, expected {}",
                    embedding.len(),
                    self.dimension
                ))));
            }
        }

        Ok(embeddings)
    }
}

enum RequestFailure {
    /// Worth another attempt (rate limit, server error, transport)
    Transient(String),
    Fatal(Error),
}

fn is_retryable_status(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}

fn backoff_delay(prior_attempts: u32) -> Duration {
    let exp = BACKOFF_BASE.saturating_mul(1u32 << prior_attempts.min(16));
    exp.min(BACKOFF_CAP)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        assert_eq!(backoff_delay(0), Duration::from_secs(1));
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_delay(2), Duration::from_secs(4));
        assert_eq!(backoff_delay(10), BACKOFF_CAP);
    }

    #[test]
    fn test_retryable_statuses() {
        assert!(is_retryable_status(429));
        assert!(is_retryable_status(500));
        assert!(is_retryable_status(503));
        assert!(!is_retryable_status(400));
        assert!(!is_retryable_status(401));
        assert!(!is_retryable_status(404));
    }

    #[test]
    fn test_response_parsing() {
        let json = r#"{"data":[{"embedding":[0.1,0.2]},{"embedding":[0.3,0.4]}]}"#;
        let parsed: EmbedResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.data.len(), 2);
        assert_eq!(parsed.data[0].embedding, vec![0.1, 0.2]);
    }

    #[test]
    fn test_client_rejects_unknown_model_without_dim() {
        let config = EmbeddingConfig {
            model: "mystery-embed-v9".to_string(),
            ..Default::default()
        };
        assert!(EmbeddingClient::new(reqwest::Client::new(), config).is_err());
    }

    #[test]
    fn test_client_resolves_known_model_dimension() {
        let config = EmbeddingConfig::default();
        let client = EmbeddingClient::new(reqwest::Client::new(), config).unwrap();
        assert_eq!(client.dimension(), 1536);
    }
}
