//! Key health registry.
//!
//! One entry per configured (provider, credential) pair, in configured order.
//! A credential is usable unless it is permanently disabled or still inside a
//! rate-limit cooldown. Entries are created once and never removed.
//!
//! ```text
//! ┌─────────┐  429         ┌─────────────┐  window elapses
//! │ Healthy ├─────────────►│ CoolingDown ├──────────────┐
//! └──┬───▲──┘              └──────┬──────┘              │
//!    │   └────────────────────────┼─────────────────────┘
//!    │ 401/402/403/quota          │ 401/402/403/quota
//!    ▼                            ▼
//! ┌──────────────────────────────────┐
//! │ Disabled (for process lifetime)  │
//! └──────────────────────────────────┘
//! ```

use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::config::ProviderSettings;
use crate::llm::provider::{Credential, ProviderKind};

#[derive(Debug)]
struct KeyHealth {
    credential: Credential,
    cooldown_until: Option<Instant>,
    disabled: bool,
    last_error: Option<String>,
}

impl KeyHealth {
    fn new(credential: Credential) -> Self {
        Self {
            credential,
            cooldown_until: None,
            disabled: false,
            last_error: None,
        }
    }

    fn state(&self, now: Instant) -> KeyState {
        if self.disabled {
            KeyState::Disabled
        } else if self.cooldown_until.is_some_and(|until| until > now) {
            KeyState::CoolingDown
        } else {
            KeyState::Healthy
        }
    }
}

/// Usability of one credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    Healthy,
    CoolingDown,
    Disabled,
}

/// Read-only view of one credential's health.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyHealthSnapshot {
    pub provider: ProviderKind,
    pub credential_id: String,
    pub state: KeyState,
    /// Time left in cooldown, if cooling down.
    pub cooldown_remaining: Option<Duration>,
    pub last_error: Option<String>,
}

/// Health of every configured credential, grouped by provider.
///
/// Mutations take the write lock briefly and never across a provider call.
#[derive(Debug, Default)]
pub struct KeyHealthRegistry {
    providers: RwLock<Vec<(ProviderKind, Vec<KeyHealth>)>>,
}

impl KeyHealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the registry from provider settings, keeping credential order.
    pub fn from_settings(settings: &[ProviderSettings]) -> Self {
        let mut providers: Vec<(ProviderKind, Vec<KeyHealth>)> = Vec::new();
        for s in settings {
            let keys = s.credentials.iter().cloned().map(KeyHealth::new);
            match providers.iter_mut().find(|(kind, _)| *kind == s.kind) {
                Some((_, existing)) => existing.extend(keys),
                None => providers.push((s.kind, keys.collect())),
            }
        }
        Self {
            providers: RwLock::new(providers),
        }
    }

    /// Add a credential after the ones already registered for `provider`.
    pub async fn register(&self, provider: ProviderKind, credential: Credential) {
        let mut providers = self.providers.write().await;
        match providers.iter_mut().find(|(kind, _)| *kind == provider) {
            Some((_, keys)) => keys.push(KeyHealth::new(credential)),
            None => providers.push((provider, vec![KeyHealth::new(credential)])),
        }
    }

    /// Credentials of `provider` that are neither disabled nor cooling down,
    /// in configured order.
    pub async fn healthy_keys_for(&self, provider: ProviderKind) -> Vec<Credential> {
        let now = Instant::now();
        let providers = self.providers.read().await;
        providers
            .iter()
            .find(|(kind, _)| *kind == provider)
            .map(|(_, keys)| {
                keys.iter()
                    .filter(|k| k.state(now) == KeyState::Healthy)
                    .map(|k| k.credential.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Whether any credential is configured for `provider`.
    pub async fn has_provider(&self, provider: ProviderKind) -> bool {
        self.providers
            .read()
            .await
            .iter()
            .any(|(kind, keys)| *kind == provider && !keys.is_empty())
    }

    /// Put a credential in cooldown for `window`. No effect on a disabled key.
    pub async fn mark_cooldown(
        &self,
        provider: ProviderKind,
        credential_id: &str,
        window: Duration,
        error: &str,
    ) {
        let until = Instant::now() + window;
        self.with_key(provider, credential_id, |key| {
            if !key.disabled {
                key.cooldown_until = Some(until);
            }
            key.last_error = Some(error.to_string());
        })
        .await;
        tracing::info!(
            provider = %provider,
            credential = credential_id,
            cooldown_secs = window.as_secs(),
            "Credential rate limited, cooling down"
        );
    }

    /// Permanently disable a credential for the rest of the process.
    pub async fn disable(&self, provider: ProviderKind, credential_id: &str, error: &str) {
        self.with_key(provider, credential_id, |key| {
            key.disabled = true;
            key.cooldown_until = None;
            key.last_error = Some(error.to_string());
        })
        .await;
        tracing::info!(
            provider = %provider,
            credential = credential_id,
            error,
            "Credential disabled"
        );
    }

    /// Every credential's state, providers in registration order.
    pub async fn snapshot(&self) -> Vec<KeyHealthSnapshot> {
        let now = Instant::now();
        let providers = self.providers.read().await;
        providers
            .iter()
            .flat_map(|(kind, keys)| {
                keys.iter().map(move |k| KeyHealthSnapshot {
                    provider: *kind,
                    credential_id: k.credential.id.clone(),
                    state: k.state(now),
                    cooldown_remaining: match k.state(now) {
                        KeyState::CoolingDown => k.cooldown_until.map(|u| u - now),
                        _ => None,
                    },
                    last_error: k.last_error.clone(),
                })
            })
            .collect()
    }

    async fn with_key<F>(&self, provider: ProviderKind, credential_id: &str, f: F)
    where
        F: FnOnce(&mut KeyHealth),
    {
        let mut providers = self.providers.write().await;
        let key = providers
            .iter_mut()
            .filter(|(kind, _)| *kind == provider)
            .flat_map(|(_, keys)| keys.iter_mut())
            .find(|k| k.credential.id == credential_id);
        match key {
            Some(key) => f(key),
            None => tracing::warn!(
                provider = %provider,
                credential = credential_id,
                "Health update for unknown credential ignored"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> KeyHealthRegistry {
        KeyHealthRegistry::from_settings(&[
            ProviderSettings::for_kind(ProviderKind::OpenAi)
                .with_credential("keyA", "sk-a")
                .with_credential("keyC", "sk-c"),
            ProviderSettings::for_kind(ProviderKind::Anthropic).with_credential("keyB", "sk-b"),
        ])
    }

    fn ids(keys: &[Credential]) -> Vec<&str> {
        keys.iter().map(|k| k.id.as_str()).collect()
    }

    #[tokio::test]
    async fn healthy_keys_keep_configured_order() {
        let reg = registry();
        assert_eq!(ids(&reg.healthy_keys_for(ProviderKind::OpenAi).await), vec!["keyA", "keyC"]);
        assert_eq!(ids(&reg.healthy_keys_for(ProviderKind::Anthropic).await), vec!["keyB"]);
    }

    #[tokio::test]
    async fn unknown_provider_has_no_keys() {
        let reg = KeyHealthRegistry::new();
        assert!(reg.healthy_keys_for(ProviderKind::OpenAi).await.is_empty());
        assert!(!reg.has_provider(ProviderKind::OpenAi).await);

        reg.register(ProviderKind::OpenAi, Credential::new("late", "sk")).await;
        assert!(reg.has_provider(ProviderKind::OpenAi).await);
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_expires() {
        let reg = registry();
        reg.mark_cooldown(ProviderKind::OpenAi, "keyA", Duration::from_secs(60), "429")
            .await;
        assert_eq!(ids(&reg.healthy_keys_for(ProviderKind::OpenAi).await), vec!["keyC"]);

        tokio::time::advance(Duration::from_secs(59)).await;
        assert_eq!(ids(&reg.healthy_keys_for(ProviderKind::OpenAi).await), vec!["keyC"]);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(ids(&reg.healthy_keys_for(ProviderKind::OpenAi).await), vec!["keyA", "keyC"]);
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_key_never_returns() {
        let reg = registry();
        reg.mark_cooldown(ProviderKind::OpenAi, "keyA", Duration::from_secs(60), "429")
            .await;
        reg.disable(ProviderKind::OpenAi, "keyA", "insufficient credits").await;

        tokio::time::advance(Duration::from_secs(3600)).await;
        assert_eq!(ids(&reg.healthy_keys_for(ProviderKind::OpenAi).await), vec!["keyC"]);

        // A later rate limit does not revive it.
        reg.mark_cooldown(ProviderKind::OpenAi, "keyA", Duration::from_secs(1), "429")
            .await;
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(ids(&reg.healthy_keys_for(ProviderKind::OpenAi).await), vec!["keyC"]);
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_reports_states() {
        let reg = registry();
        reg.mark_cooldown(ProviderKind::OpenAi, "keyA", Duration::from_secs(60), "rate limited")
            .await;
        reg.disable(ProviderKind::Anthropic, "keyB", "quota").await;

        let snap = reg.snapshot().await;
        assert_eq!(snap.len(), 3);
        assert_eq!(snap[0].credential_id, "keyA");
        assert_eq!(snap[0].state, KeyState::CoolingDown);
        assert_eq!(snap[0].cooldown_remaining, Some(Duration::from_secs(60)));
        assert_eq!(snap[0].last_error.as_deref(), Some("rate limited"));
        assert_eq!(snap[1].state, KeyState::Healthy);
        assert_eq!(snap[2].provider, ProviderKind::Anthropic);
        assert_eq!(snap[2].state, KeyState::Disabled);
    }

    #[tokio::test]
    async fn unknown_credential_is_ignored() {
        let reg = registry();
        reg.disable(ProviderKind::OpenAi, "keyZ", "x").await;
        assert_eq!(reg.healthy_keys_for(ProviderKind::OpenAi).await.len(), 2);
    }
}
