//! Anthropic messages API client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::ExposeSecret;

use crate::config::ProviderSettings;
use crate::error::LlmError;
use crate::llm::provider::{
    Capability, CompletionRequest, CompletionResponse, Credential, ProviderClient, ProviderKind,
    Role, TokenUsage, http_error,
};

const API_VERSION: &str = "2023-06-01";

/// The messages API requires an explicit output cap.
const DEFAULT_MAX_TOKENS: u32 = 1024;

/// Anthropic API client. No embeddings endpoint.
pub struct AnthropicClient {
    client: Client,
    base_url: String,
    reasoning_model: String,
    ping_model: String,
}

impl AnthropicClient {
    pub fn new(settings: &ProviderSettings, timeout: Duration) -> Result<Self, LlmError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LlmError::RequestFailed {
                provider: ProviderKind::Anthropic.to_string(),
                reason: format!("Failed to create HTTP client: {e}"),
            })?;

        tracing::info!(model = %settings.reasoning_model, "Using Anthropic");
        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            reasoning_model: settings.reasoning_model.clone(),
            ping_model: settings.ping_model.clone(),
        })
    }
}

/// System messages move to the top-level `system` field; the rest keep order.
fn messages_payload(model: &str, request: &CompletionRequest) -> serde_json::Value {
    let system: Vec<&str> = request
        .messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .collect();

    let messages: Vec<serde_json::Value> = request
        .messages
        .iter()
        .filter(|m| m.role != Role::System)
        .map(|m| {
            let role = if m.role == Role::Assistant {
                "assistant"
            } else {
                "user"
            };
            serde_json::json!({ "role": role, "content": m.content })
        })
        .collect();

    let mut payload = serde_json::json!({
        "model": model,
        "max_tokens": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        "messages": messages,
    });
    if !system.is_empty() {
        payload["system"] = serde_json::json!(system.join("\n\n"));
    }
    if let Some(temperature) = request.temperature {
        payload["temperature"] = serde_json::json!(temperature);
    }
    payload
}

fn parse_messages(json: &serde_json::Value) -> Result<CompletionResponse, LlmError> {
    let blocks = json["content"]
        .as_array()
        .ok_or_else(|| LlmError::InvalidResponse {
            provider: ProviderKind::Anthropic.to_string(),
            reason: "missing content".to_string(),
        })?;

    let text = blocks
        .iter()
        .filter(|b| b["type"] == "text")
        .filter_map(|b| b["text"].as_str())
        .collect::<Vec<_>>()
        .join("")
        .trim()
        .to_string();

    let usage = json.get("usage").and_then(|u| {
        Some(TokenUsage {
            input_tokens: u["input_tokens"].as_u64()? as u32,
            output_tokens: u["output_tokens"].as_u64()? as u32,
        })
    });

    Ok(CompletionResponse { text, usage })
}

#[async_trait]
impl ProviderClient for AnthropicClient {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    fn supports(&self, capability: Capability) -> bool {
        matches!(capability, Capability::Reasoning | Capability::StatusPing)
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
        credential: &Credential,
    ) -> Result<CompletionResponse, LlmError> {
        let model = match request.capability {
            Capability::StatusPing => &self.ping_model,
            _ => &self.reasoning_model,
        };
        tracing::debug!(
            model = %model,
            credential = %credential.id,
            messages = request.messages.len(),
            "Anthropic completion"
        );

        let payload = messages_payload(model, request);
        let response = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("Content-Type", "application/json")
            .header("x-api-key", credential.secret.expose_secret())
            .header("anthropic-version", API_VERSION)
            .json(&payload)
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed {
                provider: ProviderKind::Anthropic.to_string(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(http_error(ProviderKind::Anthropic, status.as_u16(), &body));
        }

        let json: serde_json::Value =
            response
                .json()
                .await
                .map_err(|e| LlmError::InvalidResponse {
                    provider: ProviderKind::Anthropic.to_string(),
                    reason: e.to_string(),
                })?;
        parse_messages(&json)
    }
}
