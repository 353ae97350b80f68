//! Gemini API client
//!
//! The only place that talks to the model provider. Uses a long-lived
//! reqwest::Client for connection pooling. Transport failures are retried
//! here a configured number of times; output parsing belongs to `llm`.

use crate::error::OrchestrationError;
use crate::llm::{CompletionRequest, LlmProvider};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, warn};

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";

/// Reusable Gemini client (connection-pooled)
pub struct GeminiClient {
    client: Client,
    api_key: String,
    model: String,
    max_retries: u32,
}

impl GeminiClient {
    pub fn new(api_key: String, model: String, max_retries: u32) -> crate::Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .timeout(Duration::from_secs(60))
            .build()?;

        Ok(Self {
            client,
            api_key,
            model,
            max_retries,
        })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/{}:generateContent?key={}",
            GEMINI_BASE_URL, self.model, self.api_key
        )
    }

    async fn generate_once(&self, request: &GeminiRequest) -> crate::Result<String> {
        let response = self
            .client
            .post(self.endpoint())
            .json(request)
            .send()
            .await
            .map_err(|e| {
                error!("Gemini API request failed: {}", e);
                OrchestrationError::LlmError(format!("Gemini API error: {}", e))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            error!(%status, "Gemini API error response: {}", error_text);
            return Err(OrchestrationError::LlmError(format!(
                "Gemini API returned {}: {}",
                status, error_text
            )));
        }

        let gemini_response: GeminiResponse = response.json().await.map_err(|e| {
            error!("Failed to decode Gemini response: {}", e);
            OrchestrationError::LlmError(format!("Gemini decode error: {}", e))
        })?;

        extract_text(gemini_response)
    }
}

#[async_trait]
impl LlmProvider for GeminiClient {
    async fn complete(&self, request: &CompletionRequest) -> crate::Result<String> {
        if self.api_key.is_empty() {
            return Err(OrchestrationError::LlmError(
                "GEMINI_API_KEY not configured".to_string(),
            ));
        }

        let body = GeminiRequest::from_completion(request);
        let mut attempt = 0;

        loop {
            debug!(agent = request.agent, attempt, "Calling Gemini API");

            match self.generate_once(&body).await {
                Ok(text) => return Ok(text),
                Err(e) if attempt < self.max_retries => {
                    attempt += 1;
                    warn!(agent = request.agent, attempt, error = %e, "Retrying Gemini call");
                    tokio::time::sleep(Duration::from_millis(250 * u64::from(attempt))).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn extract_text(response: GeminiResponse) -> crate::Result<String> {
    let candidate = response.candidates.into_iter().next().ok_or_else(|| {
        OrchestrationError::LlmError("No candidates in Gemini response".to_string())
    })?;

    if let Some(reason) = candidate.finish_reason.as_deref() {
        if reason != "STOP" {
            warn!(finish_reason = reason, "Gemini response finished early");
        }
    }

    let text: String = candidate
        .content
        .parts
        .into_iter()
        .map(|part| part.text)
        .collect::<Vec<_>>()
        .join("");

    if text.trim().is_empty() {
        return Err(OrchestrationError::LlmError(
            "Empty response from Gemini".to_string(),
        ));
    }

    Ok(text)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<Content>,
    generation_config: GenerationConfig,
    system_instruction: SystemInstruction,
}

impl GeminiRequest {
    fn from_completion(request: &CompletionRequest) -> Self {
        Self {
            contents: vec![Content {
                parts: vec![Part {
                    text: request.user.clone(),
                }],
            }],
            generation_config: GenerationConfig {
                temperature: request.temperature,
                top_p: 0.9,
                top_k: 40,
                max_output_tokens: 2048,
            },
            system_instruction: SystemInstruction {
                parts: vec![Part {
                    text: request.system.clone(),
                }],
            },
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    top_p: f32,
    top_k: i32,
    max_output_tokens: i32,
}

#[derive(Debug, Serialize)]
struct SystemInstruction {
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Content,
    finish_reason: Option<String>,
}
