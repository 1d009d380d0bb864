//! Ordered failover across providers and credentials.
//!
//! Providers are tried in priority order, credentials in configured order,
//! one attempt per healthy credential, until a call succeeds or the global
//! attempt budget is spent. Failures feed back into the `KeyHealthRegistry`:
//! rate limits cool a credential down, exhausted credits disable it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{AutopilotConfig, DispatchConfig};
use crate::error::{DispatchError, LlmError};
use crate::llm::anthropic::AnthropicClient;
use crate::llm::classify::{FailureClass, classify_failure};
use crate::llm::health::{KeyHealthRegistry, KeyHealthSnapshot};
use crate::llm::openai::OpenAiClient;
use crate::llm::provider::{
    Capability, ChatMessage, CompletionRequest, CompletionResponse, Credential, EmbeddingRequest,
    EmbeddingResponse, ProviderClient, ProviderKind,
};

/// A request the dispatch loop can route.
#[async_trait]
trait Dispatchable: Send + Sync {
    type Output: Send;

    fn capability(&self) -> Capability;

    async fn send(
        &self,
        client: &dyn ProviderClient,
        credential: &Credential,
    ) -> Result<Self::Output, LlmError>;
}

#[async_trait]
impl Dispatchable for CompletionRequest {
    type Output = CompletionResponse;

    fn capability(&self) -> Capability {
        self.capability
    }

    async fn send(
        &self,
        client: &dyn ProviderClient,
        credential: &Credential,
    ) -> Result<CompletionResponse, LlmError> {
        client.complete(self, credential).await
    }
}

#[async_trait]
impl Dispatchable for EmbeddingRequest {
    type Output = EmbeddingResponse;

    fn capability(&self) -> Capability {
        Capability::Embeddings
    }

    async fn send(
        &self,
        client: &dyn ProviderClient,
        credential: &Credential,
    ) -> Result<EmbeddingResponse, LlmError> {
        client.embed(self, credential).await
    }
}

/// Routes requests across providers, consulting and updating key health.
pub struct ProviderDispatcher {
    clients: Vec<Arc<dyn ProviderClient>>,
    priority: Vec<ProviderKind>,
    registry: Arc<KeyHealthRegistry>,
    cooldown: Duration,
    max_attempts: u32,
    request_timeout: Duration,
}

impl ProviderDispatcher {
    pub fn new(
        config: &DispatchConfig,
        registry: Arc<KeyHealthRegistry>,
        clients: Vec<Arc<dyn ProviderClient>>,
    ) -> Self {
        Self {
            clients,
            priority: config.provider_priority.clone(),
            registry,
            cooldown: config.cooldown,
            max_attempts: config.max_attempts,
            request_timeout: config.request_timeout,
        }
    }

    /// Build HTTP clients and the key registry for every configured provider.
    pub fn from_config(config: &AutopilotConfig) -> Result<Self, LlmError> {
        let timeout = config.dispatch.request_timeout;
        let mut clients: Vec<Arc<dyn ProviderClient>> = Vec::new();
        for settings in &config.providers {
            if !config.dispatch.provider_priority.contains(&settings.kind) {
                tracing::warn!(
                    provider = %settings.kind,
                    "Provider has credentials but is not in the priority list; it will not be used"
                );
            }
            let client: Arc<dyn ProviderClient> = match settings.kind {
                ProviderKind::OpenAi => Arc::new(OpenAiClient::new(settings, timeout)?),
                ProviderKind::Anthropic => Arc::new(AnthropicClient::new(settings, timeout)?),
            };
            clients.push(client);
        }
        let registry = Arc::new(KeyHealthRegistry::from_settings(&config.providers));
        Ok(Self::new(&config.dispatch, registry, clients))
    }

    pub fn registry(&self) -> &Arc<KeyHealthRegistry> {
        &self.registry
    }

    /// Run a chat completion with failover.
    pub async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, DispatchError> {
        self.dispatch(&request).await
    }

    /// Compute embeddings with failover, skipping providers without them.
    pub async fn embed(&self, request: EmbeddingRequest) -> Result<EmbeddingResponse, DispatchError> {
        self.dispatch(&request).await
    }

    /// Minimal `status_ping` completion, used to check connectivity.
    pub async fn ping(&self) -> Result<CompletionResponse, DispatchError> {
        let request = CompletionRequest::new(
            Capability::StatusPing,
            vec![ChatMessage::user("Reply with the single word: pong")],
        )
        .with_max_tokens(5);
        self.dispatch(&request).await
    }

    /// Read-only view of every credential's health.
    pub async fn health_snapshot(&self) -> Vec<KeyHealthSnapshot> {
        self.registry.snapshot().await
    }

    fn client_for(&self, kind: ProviderKind) -> Option<&Arc<dyn ProviderClient>> {
        self.clients.iter().find(|c| c.kind() == kind)
    }

    async fn dispatch<R: Dispatchable>(&self, request: &R) -> Result<R::Output, DispatchError> {
        let capability = request.capability();
        let mut attempts: u32 = 0;
        let mut capable = false;
        let mut last_error: Option<LlmError> = None;

        'providers: for &kind in &self.priority {
            let Some(client) = self.client_for(kind) else {
                continue;
            };
            if !client.supports(capability) {
                tracing::debug!(provider = %kind, capability = %capability, "Provider skipped, capability unsupported");
                continue;
            }
            capable = true;

            for credential in self.registry.healthy_keys_for(kind).await {
                if attempts >= self.max_attempts {
                    break 'providers;
                }
                attempts += 1;

                let result = match tokio::time::timeout(
                    self.request_timeout,
                    request.send(client.as_ref(), &credential),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(LlmError::Timeout {
                        provider: kind.to_string(),
                        timeout: self.request_timeout,
                    }),
                };

                match result {
                    Ok(output) => {
                        tracing::debug!(
                            provider = %kind,
                            credential = %credential.id,
                            capability = %capability,
                            attempts,
                            "Provider call succeeded"
                        );
                        return Ok(output);
                    }
                    Err(e) => {
                        self.record_failure(kind, &credential, &e).await;
                        last_error = Some(e);
                    }
                }
            }
        }

        match last_error {
            Some(last) => {
                tracing::warn!(capability = %capability, attempts, error = %last, "All provider attempts failed");
                Err(DispatchError::Exhausted { attempts, last })
            }
            None if !capable => Err(DispatchError::NoCapableProvider {
                capability: capability.to_string(),
            }),
            None => Err(DispatchError::NoHealthyCredentials {
                capability: capability.to_string(),
            }),
        }
    }

    async fn record_failure(&self, kind: ProviderKind, credential: &Credential, error: &LlmError) {
        let message = error.to_string();
        match classify_failure(error.status_code(), &message) {
            FailureClass::RateLimited => {
                self.registry
                    .mark_cooldown(kind, &credential.id, self.cooldown, &message)
                    .await;
            }
            FailureClass::CredentialExhausted => {
                self.registry.disable(kind, &credential.id, &message).await;
            }
            FailureClass::Other => {
                tracing::warn!(
                    provider = %kind,
                    credential = %credential.id,
                    error = %message,
                    "Provider call failed"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;
    use crate::config::ProviderSettings;
    use crate::llm::health::KeyState;

    #[derive(Clone)]
    enum Behavior {
        Reply(&'static str),
        Status(u16),
        Fail(&'static str),
        Hang,
    }

    /// Scripted provider: behavior is chosen by credential id.
    struct StubClient {
        kind: ProviderKind,
        embeddings: bool,
        behavior: HashMap<&'static str, Behavior>,
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl StubClient {
        fn new(
            kind: ProviderKind,
            behavior: &[(&'static str, Behavior)],
            calls: &Arc<Mutex<Vec<String>>>,
        ) -> Self {
            Self {
                kind,
                embeddings: false,
                behavior: behavior.iter().cloned().collect(),
                calls: Arc::clone(calls),
            }
        }

        fn with_embeddings(mut self) -> Self {
            self.embeddings = true;
            self
        }

        async fn run(&self, credential: &Credential) -> Result<String, LlmError> {
            self.calls.lock().unwrap().push(credential.id.clone());
            match self.behavior.get(credential.id.as_str()) {
                Some(Behavior::Reply(text)) => Ok(text.to_string()),
                Some(Behavior::Status(status)) => Err(LlmError::Http {
                    provider: self.kind.to_string(),
                    status: *status,
                    message: "stub".into(),
                }),
                Some(Behavior::Fail(reason)) => Err(LlmError::RequestFailed {
                    provider: self.kind.to_string(),
                    reason: reason.to_string(),
                }),
                Some(Behavior::Hang) => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok("late".into())
                }
                None => Ok("default".into()),
            }
        }
    }

    #[async_trait]
    impl ProviderClient for StubClient {
        fn kind(&self) -> ProviderKind {
            self.kind
        }

        fn supports(&self, capability: Capability) -> bool {
            capability != Capability::Embeddings || self.embeddings
        }

        async fn complete(
            &self,
            _request: &CompletionRequest,
            credential: &Credential,
        ) -> Result<CompletionResponse, LlmError> {
            self.run(credential).await.map(CompletionResponse::new)
        }

        async fn embed(
            &self,
            request: &EmbeddingRequest,
            credential: &Credential,
        ) -> Result<EmbeddingResponse, LlmError> {
            self.run(credential).await?;
            Ok(EmbeddingResponse {
                embeddings: request.inputs.iter().map(|_| vec![0.1, 0.2]).collect(),
            })
        }
    }

    fn settings(kind: ProviderKind, keys: &[&str]) -> ProviderSettings {
        keys.iter().fold(ProviderSettings::for_kind(kind), |s, k| {
            s.with_credential(*k, format!("secret-{k}"))
        })
    }

    fn dispatcher(
        priority: Vec<ProviderKind>,
        providers: &[ProviderSettings],
        clients: Vec<StubClient>,
    ) -> ProviderDispatcher {
        let clients = clients
            .into_iter()
            .map(|c| Arc::new(c) as Arc<dyn ProviderClient>)
            .collect();
        let config = DispatchConfig {
            provider_priority: priority,
            request_timeout: Duration::from_secs(30),
            ..DispatchConfig::default()
        };
        let registry = Arc::new(KeyHealthRegistry::from_settings(providers));
        ProviderDispatcher::new(&config, registry, clients)
    }

    fn reasoning(text: &str) -> CompletionRequest {
        CompletionRequest::new(Capability::Reasoning, vec![ChatMessage::user(text)])
    }

    fn state_of(snap: &[KeyHealthSnapshot], id: &str) -> KeyState {
        snap.iter()
            .find(|s| s.credential_id == id)
            .map(|s| s.state)
            .unwrap()
    }

    #[tokio::test]
    async fn rate_limited_key_fails_over_to_next_provider() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let d = dispatcher(
            vec![ProviderKind::OpenAi, ProviderKind::Anthropic],
            &[
                settings(ProviderKind::OpenAi, &["keyA"]),
                settings(ProviderKind::Anthropic, &["keyB"]),
            ],
            vec![
                StubClient::new(ProviderKind::OpenAi, &[("keyA", Behavior::Status(429))], &calls),
                StubClient::new(ProviderKind::Anthropic, &[("keyB", Behavior::Reply("hello"))], &calls),
            ],
        );

        let resp = d.complete(reasoning("hi")).await.unwrap();
        assert_eq!(resp.text, "hello");
        assert_eq!(*calls.lock().unwrap(), vec!["keyA", "keyB"]);

        let snap = d.health_snapshot().await;
        assert_eq!(state_of(&snap, "keyA"), KeyState::CoolingDown);
        assert_eq!(state_of(&snap, "keyB"), KeyState::Healthy);
    }

    #[tokio::test]
    async fn budget_of_three_stops_after_three_rate_limits() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let d = dispatcher(
            vec![ProviderKind::OpenAi, ProviderKind::Anthropic],
            &[
                settings(ProviderKind::OpenAi, &["k1", "k2"]),
                settings(ProviderKind::Anthropic, &["k3", "k4"]),
            ],
            vec![
                StubClient::new(
                    ProviderKind::OpenAi,
                    &[("k1", Behavior::Status(429)), ("k2", Behavior::Status(429))],
                    &calls,
                ),
                StubClient::new(
                    ProviderKind::Anthropic,
                    &[("k3", Behavior::Status(429)), ("k4", Behavior::Status(429))],
                    &calls,
                ),
            ],
        );

        let err = d.complete(reasoning("hi")).await.unwrap_err();
        match err {
            DispatchError::Exhausted { attempts, last } => {
                assert_eq!(attempts, 3);
                assert_eq!(last.status_code(), Some(429));
            }
            other => panic!("expected Exhausted, got {other:?}"),
        }
        assert_eq!(*calls.lock().unwrap(), vec!["k1", "k2", "k3"]);

        let snap = d.health_snapshot().await;
        for id in ["k1", "k2", "k3"] {
            assert_eq!(state_of(&snap, id), KeyState::CoolingDown, "{id}");
        }
        assert_eq!(state_of(&snap, "k4"), KeyState::Healthy);
    }

    #[tokio::test]
    async fn exhausted_credits_disable_key() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let d = dispatcher(
            vec![ProviderKind::OpenAi],
            &[settings(ProviderKind::OpenAi, &["keyA", "keyC"])],
            vec![StubClient::new(
                ProviderKind::OpenAi,
                &[("keyA", Behavior::Status(402)), ("keyC", Behavior::Reply("ok"))],
                &calls,
            )],
        );

        d.complete(reasoning("one")).await.unwrap();
        d.complete(reasoning("two")).await.unwrap();
        // keyA tried once, then never again.
        assert_eq!(*calls.lock().unwrap(), vec!["keyA", "keyC", "keyC"]);
        assert_eq!(state_of(&d.health_snapshot().await, "keyA"), KeyState::Disabled);
    }

    #[tokio::test]
    async fn quota_message_without_status_disables_key() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let d = dispatcher(
            vec![ProviderKind::OpenAi],
            &[settings(ProviderKind::OpenAi, &["keyA"])],
            vec![StubClient::new(
                ProviderKind::OpenAi,
                &[("keyA", Behavior::Fail("insufficient_quota"))],
                &calls,
            )],
        );

        assert!(matches!(
            d.complete(reasoning("x")).await,
            Err(DispatchError::Exhausted { attempts: 1, .. })
        ));
        assert!(matches!(
            d.complete(reasoning("x")).await,
            Err(DispatchError::NoHealthyCredentials { .. })
        ));
    }

    #[tokio::test]
    async fn server_error_leaves_health_untouched() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let d = dispatcher(
            vec![ProviderKind::OpenAi],
            &[settings(ProviderKind::OpenAi, &["keyA", "keyC"])],
            vec![StubClient::new(
                ProviderKind::OpenAi,
                &[("keyA", Behavior::Status(500)), ("keyC", Behavior::Reply("ok"))],
                &calls,
            )],
        );

        assert_eq!(d.complete(reasoning("x")).await.unwrap().text, "ok");
        let snap = d.health_snapshot().await;
        assert_eq!(state_of(&snap, "keyA"), KeyState::Healthy);
        assert!(snap[0].last_error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn hung_call_times_out_and_counts_as_attempt() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let d = dispatcher(
            vec![ProviderKind::OpenAi],
            &[settings(ProviderKind::OpenAi, &["slow", "fast"])],
            vec![StubClient::new(
                ProviderKind::OpenAi,
                &[("slow", Behavior::Hang), ("fast", Behavior::Reply("ok"))],
                &calls,
            )],
        );

        assert_eq!(d.complete(reasoning("x")).await.unwrap().text, "ok");
        assert_eq!(*calls.lock().unwrap(), vec!["slow", "fast"]);
        assert_eq!(state_of(&d.health_snapshot().await, "slow"), KeyState::Healthy);
    }

    #[tokio::test]
    async fn embeddings_skip_providers_without_capability() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let d = dispatcher(
            vec![ProviderKind::Anthropic, ProviderKind::OpenAi],
            &[
                settings(ProviderKind::Anthropic, &["keyB"]),
                settings(ProviderKind::OpenAi, &["keyA"]),
            ],
            vec![
                StubClient::new(ProviderKind::Anthropic, &[], &calls),
                StubClient::new(ProviderKind::OpenAi, &[], &calls).with_embeddings(),
            ],
        );

        let resp = d
            .embed(EmbeddingRequest::new(vec!["a".into(), "b".into()]))
            .await
            .unwrap();
        assert_eq!(resp.embeddings.len(), 2);
        assert_eq!(*calls.lock().unwrap(), vec!["keyA"]);
    }

    #[tokio::test]
    async fn no_capable_provider() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let d = dispatcher(
            vec![ProviderKind::Anthropic],
            &[settings(ProviderKind::Anthropic, &["keyB"])],
            vec![StubClient::new(ProviderKind::Anthropic, &[], &calls)],
        );

        let err = d
            .embed(EmbeddingRequest::new(vec!["a".into()]))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::NoCapableProvider { .. }));
        assert!(calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn ping_uses_status_capability() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let d = dispatcher(
            vec![ProviderKind::OpenAi],
            &[settings(ProviderKind::OpenAi, &["keyA"])],
            vec![StubClient::new(
                ProviderKind::OpenAi,
                &[("keyA", Behavior::Reply("pong"))],
                &calls,
            )],
        );
        assert_eq!(d.ping().await.unwrap().text, "pong");
    }
}
