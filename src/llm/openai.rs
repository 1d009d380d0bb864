//! OpenAI chat-completions and embeddings client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::ExposeSecret;

use crate::config::ProviderSettings;
use crate::error::LlmError;
use crate::llm::provider::{
    Capability, ChatMessage, CompletionRequest, CompletionResponse, Credential,
    EmbeddingRequest, EmbeddingResponse, ProviderClient, ProviderKind, Role, TokenUsage,
    http_error,
};

/// OpenAI API client. Stateless apart from the HTTP connection pool; the
/// credential is supplied per call.
pub struct OpenAiClient {
    client: Client,
    base_url: String,
    reasoning_model: String,
    ping_model: String,
    embedding_model: Option<String>,
}

impl OpenAiClient {
    pub fn new(settings: &ProviderSettings, timeout: Duration) -> Result<Self, LlmError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LlmError::RequestFailed {
                provider: ProviderKind::OpenAi.to_string(),
                reason: format!("Failed to create HTTP client: {e}"),
            })?;

        tracing::info!(model = %settings.reasoning_model, "Using OpenAI");
        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            reasoning_model: settings.reasoning_model.clone(),
            ping_model: settings.ping_model.clone(),
            embedding_model: settings.embedding_model.clone(),
        })
    }

    fn model_for(&self, capability: Capability) -> &str {
        match capability {
            Capability::StatusPing => &self.ping_model,
            _ => &self.reasoning_model,
        }
    }

    async fn post(
        &self,
        path: &str,
        credential: &Credential,
        payload: &serde_json::Value,
    ) -> Result<serde_json::Value, LlmError> {
        let response = self
            .client
            .post(format!("{}/{path}", self.base_url))
            .header("Content-Type", "application/json")
            .bearer_auth(credential.secret.expose_secret())
            .json(payload)
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed {
                provider: ProviderKind::OpenAi.to_string(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(http_error(ProviderKind::OpenAi, status.as_u16(), &body));
        }

        response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse {
                provider: ProviderKind::OpenAi.to_string(),
                reason: e.to_string(),
            })
    }
}

fn role_name(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

fn chat_payload(model: &str, request: &CompletionRequest) -> serde_json::Value {
    let messages: Vec<serde_json::Value> = request
        .messages
        .iter()
        .map(|m: &ChatMessage| serde_json::json!({ "role": role_name(m.role), "content": m.content }))
        .collect();

    let mut payload = serde_json::json!({
        "model": model,
        "messages": messages,
    });
    if let Some(max_tokens) = request.max_tokens {
        payload["max_tokens"] = serde_json::json!(max_tokens);
    }
    if let Some(temperature) = request.temperature {
        payload["temperature"] = serde_json::json!(temperature);
    }
    payload
}

fn parse_chat(json: &serde_json::Value) -> Result<CompletionResponse, LlmError> {
    let text = json["choices"][0]["message"]["content"]
        .as_str()
        .ok_or_else(|| LlmError::InvalidResponse {
            provider: ProviderKind::OpenAi.to_string(),
            reason: "missing choices[0].message.content".to_string(),
        })?
        .trim()
        .to_string();

    let usage = json.get("usage").and_then(|u| {
        Some(TokenUsage {
            input_tokens: u["prompt_tokens"].as_u64()? as u32,
            output_tokens: u["completion_tokens"].as_u64()? as u32,
        })
    });

    Ok(CompletionResponse { text, usage })
}

fn parse_embeddings(json: &serde_json::Value) -> Result<EmbeddingResponse, LlmError> {
    let invalid = |reason: &str| LlmError::InvalidResponse {
        provider: ProviderKind::OpenAi.to_string(),
        reason: reason.to_string(),
    };

    let data = json["data"].as_array().ok_or_else(|| invalid("missing data"))?;
    let mut indexed: Vec<(u64, Vec<f32>)> = Vec::with_capacity(data.len());
    for (pos, item) in data.iter().enumerate() {
        let vector = item["embedding"]
            .as_array()
            .ok_or_else(|| invalid("missing embedding"))?
            .iter()
            .map(|v| v.as_f64().map(|f| f as f32))
            .collect::<Option<Vec<f32>>>()
            .ok_or_else(|| invalid("non-numeric embedding value"))?;
        let index = item["index"].as_u64().unwrap_or(pos as u64);
        indexed.push((index, vector));
    }
    indexed.sort_by_key(|(i, _)| *i);

    Ok(EmbeddingResponse {
        embeddings: indexed.into_iter().map(|(_, v)| v).collect(),
    })
}

#[async_trait]
impl ProviderClient for OpenAiClient {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAi
    }

    fn supports(&self, capability: Capability) -> bool {
        match capability {
            Capability::Reasoning | Capability::StatusPing => true,
            Capability::Embeddings => self.embedding_model.is_some(),
        }
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
        credential: &Credential,
    ) -> Result<CompletionResponse, LlmError> {
        let model = self.model_for(request.capability);
        tracing::debug!(
            model,
            credential = %credential.id,
            messages = request.messages.len(),
            "OpenAI completion"
        );
        let payload = chat_payload(model, request);
        let json = self.post("chat/completions", credential, &payload).await?;
        parse_chat(&json)
    }

    async fn embed(
        &self,
        request: &EmbeddingRequest,
        credential: &Credential,
    ) -> Result<EmbeddingResponse, LlmError> {
        let model = self
            .embedding_model
            .as_deref()
            .ok_or_else(|| LlmError::Unsupported {
                provider: ProviderKind::OpenAi.to_string(),
                capability: Capability::Embeddings.to_string(),
            })?;
        let payload = serde_json::json!({ "model": model, "input": request.inputs });
        let json = self.post("embeddings", credential, &payload).await?;
        parse_embeddings(&json)
    }
}
