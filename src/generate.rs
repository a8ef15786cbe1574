//! Code generation client
//!
//! Talks to an Ollama-style `/api/generate` endpoint. Rate limits and server
//! errors are retried with exponential backoff; everything else is reported
//! as a [`CollaboratorError`] for the runner to handle.

use crate::config::GenerationConfig;
use crate::error::CollaboratorError;
use crate::util::truncate;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tracing::{debug, warn};

pub type GenerateFuture<'a> =
    Pin<Box<dyn Future<Output = Result<String, CollaboratorError>> + Send + 'a>>;

/// Produces a complete candidate source for a prompt.
pub trait CodeGenerator: Send + Sync {
    fn generate<'a>(&'a self, prompt: &'a str) -> GenerateFuture<'a>;
}

const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 2000;
const BACKOFF_MULTIPLIER: u64 = 2;

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    temperature: f64,
    top_p: f64,
    top_k: u32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
    #[serde(default)]
    error: Option<String>,
}

pub struct HttpGenerator {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    system_prompt: Option<String>,
    temperature: f64,
    timeout: Duration,
}

impl HttpGenerator {
    pub fn from_config(config: &GenerationConfig) -> anyhow::Result<Self> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            system_prompt: config.system_prompt.clone(),
            temperature: config.temperature,
            timeout,
        })
    }

    async fn send_with_retry(&self, prompt: &str) -> Result<String, CollaboratorError> {
        let request = GenerateRequest {
            model: &self.model,
            prompt,
            system: self.system_prompt.as_deref(),
            stream: false,
            options: GenerateOptions {
                temperature: self.temperature,
                top_p: 0.9,
                top_k: 40,
            },
        };

        let mut retry_count = 0;
        loop {
            let response = self.client.post(&self.endpoint).json(&request).send().await;

            let (status, text) = match response {
                Ok(response) => {
                    let status = response.status();
                    match response.text().await {
                        Ok(text) => (status, text),
                        Err(err) => (status, err.to_string()),
                    }
                }
                Err(err) if err.is_timeout() => return Err(CollaboratorError::Timeout(self.timeout)),
                Err(err) => {
                    if retry_count < MAX_RETRIES {
                        retry_count += 1;
                        let wait = backoff_secs(retry_count);
                        warn!(error = %err, retry_count, wait, "generator unreachable; retrying");
                        tokio::time::sleep(Duration::from_secs(wait)).await;
                        continue;
                    }
                    return Err(CollaboratorError::Unavailable(err.to_string()));
                }
            };

            if status.is_success() {
                let parsed: GenerateResponse = serde_json::from_str(&text)
                    .map_err(|_| CollaboratorError::EmptyResponse)?;
                if let Some(error) = parsed.error {
                    return Err(CollaboratorError::Failed(error));
                }
                debug!(chars = parsed.response.len(), "generator responded");
                return Ok(parsed.response);
            }

            let retryable = status.as_u16() == 429 || status.is_server_error();
            if retryable && retry_count < MAX_RETRIES {
                retry_count += 1;
                let wait = parse_retry_after(&text).unwrap_or_else(|| backoff_secs(retry_count));
                warn!(
                    status = status.as_u16(),
                    retry_count,
                    max = MAX_RETRIES,
                    wait,
                    "generator request failed; retrying"
                );
                tokio::time::sleep(Duration::from_secs(wait)).await;
                continue;
            }

            let detail = truncate(text.trim(), 200);
            return Err(match status.as_u16() {
                429 => CollaboratorError::RateLimited(format!(
                    "after {} retries: {}",
                    retry_count, detail
                )),
                500..=599 => CollaboratorError::Unavailable(format!("server error {status}: {detail}")),
                _ => CollaboratorError::Failed(format!("API error {status}: {detail}")),
            });
        }
    }
}

impl CodeGenerator for HttpGenerator {
    fn generate<'a>(&'a self, prompt: &'a str) -> GenerateFuture<'a> {
        Box::pin(async move {
            let response = self.send_with_retry(prompt).await?;
            extract_code(&response).ok_or(CollaboratorError::EmptyResponse)
        })
    }
}

fn backoff_secs(retry_count: u32) -> u64 {
    (INITIAL_BACKOFF_MS * BACKOFF_MULTIPLIER.pow(retry_count.saturating_sub(1))) / 1000
}

/// Retry hint like "retry after 12 seconds" in an error body.
fn parse_retry_after(text: &str) -> Option<u64> {
    let text_lower = text.to_lowercase();
    let pos = text_lower.find("retry")?;
    text_lower[pos..]
        .split_whitespace()
        .skip(1)
        .take(5)
        .filter_map(|word| {
            word.trim_matches(|c: char| !c.is_numeric())
                .parse::<u64>()
                .ok()
        })
        .find(|secs| *secs > 0 && *secs < 300)
}

/// Pull the source out of a model response: the first fenced block if
/// there is one, otherwise the whole text. `None` when nothing is left.
pub fn extract_code(response: &str) -> Option<String> {
    let trimmed = response.trim();
    let code = match trimmed.find("```") {
        Some(start) => {
            let after = &trimmed[start + 3..];
            // skip the language tag line
            let body = match after.find('\n') {
                Some(nl) => &after[nl + 1..],
                None => after,
            };
            match body.find("```") {
                Some(end) => &body[..end],
                None => body,
            }
        }
        None => trimmed,
    };
    let code = code.trim_matches('\n').trim_end();
    if code.trim().is_empty() {
        None
    } else {
        Some(format!("{code}\n"))
    }
}
