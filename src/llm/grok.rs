//! xAI Grok LLM integration.
//!
//! The xAI API is OpenAI-compatible, so this client speaks the Chat
//! Completions wire format against `https://api.x.ai/v1`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

use super::SentimentOracle;
use crate::config::LlmSettings;
use crate::types::CdemError;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

const DEFAULT_BASE_URL: &str = "https://api.x.ai/v1";
const DEFAULT_MODEL: &str = "grok-4-fast-reasoning";

/// Retries for rate-limit and server errors within a single `generate`.
const MAX_RETRIES: u32 = 2;
const BASE_BACKOFF_MS: u64 = 1000;

// ---------------------------------------------------------------------------
// API types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f64,
    max_tokens: u32,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    #[serde(default)]
    message: Option<ResponseMessage>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct GrokClient {
    http: Client,
    api_key: SecretString,
    base_url: String,
    model: String,
    temperature: f64,
    max_tokens: u32,
    total_calls: AtomicU64,
}

impl GrokClient {
    pub fn new(api_key: String, settings: &LlmSettings) -> Result<Self> {
        // The per-sample hard timeout is enforced by the caller; this one
        // only guards against a connection that never completes.
        let http = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs + 10))
            .build()
            .context("Failed to build Grok HTTP client")?;

        let base_url = if settings.base_url.is_empty() {
            DEFAULT_BASE_URL.to_string()
        } else {
            settings.base_url.trim_end_matches('/').to_string()
        };
        let model = if settings.model.is_empty() {
            DEFAULT_MODEL.to_string()
        } else {
            settings.model.clone()
        };

        Ok(Self {
            http,
            api_key: SecretString::new(api_key),
            base_url,
            model,
            temperature: settings.temperature,
            max_tokens: settings.max_tokens,
            total_calls: AtomicU64::new(0),
        })
    }

    pub fn total_calls(&self) -> u64 {
        self.total_calls.load(Ordering::Relaxed)
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    async fn call_api(&self, system: &str, user: &str) -> Result<String> {
        let request = ChatRequest {
            model: &self.model,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            messages: vec![
                ChatMessage { role: "system", content: system },
                ChatMessage { role: "user", content: user },
            ],
        };

        let mut last_error = None;

        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                let delay = BASE_BACKOFF_MS * 2u64.pow(attempt - 1);
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }

            let resp = self
                .http
                .post(self.endpoint())
                .bearer_auth(self.api_key.expose_secret())
                .json(&request)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let body: ChatResponse = response
                            .json()
                            .await
                            .context("Failed to parse Grok response")?;
                        self.total_calls.fetch_add(1, Ordering::Relaxed);

                        let text = body
                            .choices
                            .into_iter()
                            .next()
                            .and_then(|c| c.message)
                            .and_then(|m| m.content)
                            .unwrap_or_default();
                        debug!(model = %self.model, chars = text.len(), "Grok response received");
                        return Ok(text.trim().to_string());
                    }

                    let error_text = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        warn!(status = %status, attempt, "Retryable Grok error");
                        last_error = Some(format!("HTTP {status}: {error_text}"));
                        continue;
                    }

                    return Err(CdemError::Llm {
                        model: self.model.clone(),
                        message: format!("HTTP {status}: {error_text}"),
                    }
                    .into());
                }
                Err(e) => {
                    last_error = Some(format!("Request error: {e}"));
                    continue;
                }
            }
        }

        Err(CdemError::Llm {
            model: self.model.clone(),
            message: format!(
                "failed after {MAX_RETRIES} retries: {}",
                last_error.unwrap_or_default()
            ),
        }
        .into())
    }
}

#[async_trait]
impl SentimentOracle for GrokClient {
    async fn generate(&self, system_prompt: &str, user_prompt: &str) -> Result<String> {
        self.call_api(system_prompt, user_prompt).await
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
