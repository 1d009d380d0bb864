//! Configuration types.
//!
//! Every section has a `Default` carrying the production constants, and
//! `AutopilotConfig::from_env()` overlays `AUTOPILOT_*` variables plus the
//! per-provider key lists.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::llm::provider::{Credential, ProviderKind};

/// Task store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Path of the libSQL database file.
    pub db_path: PathBuf,
    /// `running` tasks untouched for this long are reset on startup.
    pub stale_running_threshold: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/autopilot.db"),
            stale_running_threshold: Duration::from_secs(300), // 5 minutes
        }
    }
}

/// Provider dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Providers in the order they are tried.
    pub provider_priority: Vec<ProviderKind>,
    /// How long a rate-limited credential sits out.
    pub cooldown: Duration,
    /// Global attempt budget per request.
    pub max_attempts: u32,
    /// Upper bound on a single provider call.
    pub request_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            provider_priority: vec![ProviderKind::OpenAi, ProviderKind::Anthropic],
            cooldown: Duration::from_secs(60),
            max_attempts: 3,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Execution engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Delay between claim attempts.
    pub poll_interval: Duration,
    /// Hard cap on plan steps executed per run.
    pub max_steps: usize,
    /// Consecutive step failures that fail the run.
    pub max_consecutive_failures: u32,
    /// Minimum spacing of non-terminal status notifications.
    pub min_notify_interval: Duration,
    /// Upper bound on a single page observation.
    pub observe_timeout: Duration,
    /// Prior-experience hints pulled into the planning prompt.
    pub memory_hint_limit: usize,
    /// Output token cap for plan and step completions.
    pub max_output_tokens: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            max_steps: 20,
            max_consecutive_failures: 3,
            min_notify_interval: Duration::from_secs(300), // 5 minutes
            observe_timeout: Duration::from_secs(15),
            memory_hint_limit: 3,
            max_output_tokens: 1024,
        }
    }
}

/// One provider's endpoint, models and credentials.
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub kind: ProviderKind,
    /// Credentials in the order they are tried.
    pub credentials: Vec<Credential>,
    pub base_url: String,
    pub reasoning_model: String,
    pub ping_model: String,
    /// `None` when the provider has no embeddings endpoint.
    pub embedding_model: Option<String>,
}

impl ProviderSettings {
    /// Defaults for a provider kind, with no credentials.
    pub fn for_kind(kind: ProviderKind) -> Self {
        match kind {
            ProviderKind::OpenAi => Self {
                kind,
                credentials: Vec::new(),
                base_url: "https://api.openai.com/v1".to_string(),
                reasoning_model: "gpt-4o-mini".to_string(),
                ping_model: "gpt-4o-mini".to_string(),
                embedding_model: Some("text-embedding-3-small".to_string()),
            },
            ProviderKind::Anthropic => Self {
                kind,
                credentials: Vec::new(),
                base_url: "https://api.anthropic.com/v1".to_string(),
                reasoning_model: "claude-3-5-haiku-latest".to_string(),
                ping_model: "claude-3-5-haiku-latest".to_string(),
                embedding_model: None,
            },
        }
    }

    pub fn with_credential(mut self, id: impl Into<String>, secret: impl Into<String>) -> Self {
        self.credentials.push(Credential::new(id, secret));
        self
    }
}

/// Complete process configuration.
#[derive(Debug, Clone, Default)]
pub struct AutopilotConfig {
    pub store: StoreConfig,
    pub dispatch: DispatchConfig,
    pub engine: EngineConfig,
    /// Providers that have at least one credential.
    pub providers: Vec<ProviderSettings>,
    /// Agents to run, one engine loop each.
    pub agents: Vec<String>,
}

impl AutopilotConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let mut config = Self::default();

        if let Some(path) = get("AUTOPILOT_DB_PATH") {
            config.store.db_path = PathBuf::from(path);
        }
        config.store.stale_running_threshold = secs(
            &get,
            "AUTOPILOT_STALE_SECS",
            config.store.stale_running_threshold,
        )?;

        if let Some(raw) = get("AUTOPILOT_PROVIDER_PRIORITY") {
            config.dispatch.provider_priority = split_list(&raw)
                .map(|s| {
                    s.parse::<ProviderKind>()
                        .map_err(|message| ConfigError::InvalidValue {
                            key: "AUTOPILOT_PROVIDER_PRIORITY".to_string(),
                            message,
                        })
                })
                .collect::<Result<_, _>>()?;
        }
        config.dispatch.cooldown = secs(&get, "AUTOPILOT_COOLDOWN_SECS", config.dispatch.cooldown)?;
        config.dispatch.max_attempts =
            parsed(&get, "AUTOPILOT_MAX_ATTEMPTS", config.dispatch.max_attempts)?;
        if config.dispatch.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "AUTOPILOT_MAX_ATTEMPTS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        config.dispatch.request_timeout = secs(
            &get,
            "AUTOPILOT_REQUEST_TIMEOUT_SECS",
            config.dispatch.request_timeout,
        )?;

        let engine = &mut config.engine;
        engine.poll_interval = secs(&get, "AUTOPILOT_POLL_INTERVAL_SECS", engine.poll_interval)?;
        if engine.poll_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "AUTOPILOT_POLL_INTERVAL_SECS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        engine.max_steps = parsed(&get, "AUTOPILOT_MAX_STEPS", engine.max_steps)?;
        if engine.max_steps == 0 {
            return Err(ConfigError::InvalidValue {
                key: "AUTOPILOT_MAX_STEPS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        engine.max_consecutive_failures = parsed(
            &get,
            "AUTOPILOT_MAX_FAILURES",
            engine.max_consecutive_failures,
        )?;
        if engine.max_consecutive_failures == 0 {
            return Err(ConfigError::InvalidValue {
                key: "AUTOPILOT_MAX_FAILURES".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        engine.min_notify_interval = secs(
            &get,
            "AUTOPILOT_NOTIFY_INTERVAL_SECS",
            engine.min_notify_interval,
        )?;
        engine.observe_timeout =
            secs(&get, "AUTOPILOT_OBSERVE_TIMEOUT_SECS", engine.observe_timeout)?;

        for kind in [ProviderKind::OpenAi, ProviderKind::Anthropic] {
            let prefix = kind.env_prefix();
            let Some(keys) = get(&format!("{prefix}_API_KEYS")) else {
                continue;
            };
            let mut settings = ProviderSettings::for_kind(kind);
            for (i, key) in split_list(&keys).enumerate() {
                settings = settings.with_credential(format!("{kind}-{}", i + 1), key);
            }
            if let Some(url) = get(&format!("{prefix}_BASE_URL")) {
                settings.base_url = url.trim_end_matches('/').to_string();
            }
            if let Some(model) = get(&format!("AUTOPILOT_{prefix}_MODEL")) {
                settings.reasoning_model = model.clone();
                settings.ping_model = model;
            }
            if let Some(model) = get(&format!("AUTOPILOT_{prefix}_EMBEDDING_MODEL")) {
                settings.embedding_model = Some(model);
            }
            if !settings.credentials.is_empty() {
                config.providers.push(settings);
            }
        }

        config.agents = get("AUTOPILOT_AGENTS")
            .map(|raw| split_list(&raw).map(str::to_string).collect())
            .unwrap_or_default();
        if config.agents.is_empty() {
            return Err(ConfigError::MissingRequired {
                key: "AUTOPILOT_AGENTS".to_string(),
                hint: "Set a comma-separated list of agent ids, e.g. AUTOPILOT_AGENTS=alice,bob"
                    .to_string(),
            });
        }

        Ok(config)
    }
}

fn split_list(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn parsed<T, G>(get: &G, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn secs<G>(get: &G, key: &str, default: Duration) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    parsed(get, key, default.as_secs()).map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use secrecy::ExposeSecret;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<AutopilotConfig, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AutopilotConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_match_documented_constants() {
        let config = AutopilotConfig::default();
        assert_eq!(config.dispatch.cooldown, Duration::from_secs(60));
        assert_eq!(config.dispatch.max_attempts, 3);
        assert_eq!(config.engine.max_steps, 20);
        assert_eq!(config.engine.max_consecutive_failures, 3);
        assert_eq!(config.engine.min_notify_interval, Duration::from_secs(300));
        assert_eq!(config.store.stale_running_threshold, Duration::from_secs(300));
    }

    #[test]
    fn agents_are_required() {
        let err = load(&[]).unwrap_err();
        assert!(matches!(err, ConfigError::MissingRequired { key, .. } if key == "AUTOPILOT_AGENTS"));
    }

    #[test]
    fn overrides_apply() {
        let config = load(&[
            ("AUTOPILOT_AGENTS", "alice, bob,"),
            ("AUTOPILOT_PROVIDER_PRIORITY", "anthropic,openai"),
            ("AUTOPILOT_MAX_ATTEMPTS", "5"),
            ("AUTOPILOT_POLL_INTERVAL_SECS", "2"),
            ("AUTOPILOT_DB_PATH", "/tmp/q.db"),
        ])
        .unwrap();
        assert_eq!(config.agents, vec!["alice", "bob"]);
        assert_eq!(
            config.dispatch.provider_priority,
            vec![ProviderKind::Anthropic, ProviderKind::OpenAi]
        );
        assert_eq!(config.dispatch.max_attempts, 5);
        assert_eq!(config.engine.poll_interval, Duration::from_secs(2));
        assert_eq!(config.store.db_path, PathBuf::from("/tmp/q.db"));
    }

    #[test]
    fn invalid_number_is_reported() {
        let err = load(&[("AUTOPILOT_AGENTS", "a"), ("AUTOPILOT_MAX_STEPS", "lots")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key, .. } if key == "AUTOPILOT_MAX_STEPS"));
    }

    #[test]
    fn zero_step_and_failure_limits_are_rejected() {
        for key in ["AUTOPILOT_MAX_STEPS", "AUTOPILOT_MAX_FAILURES"] {
            let err = load(&[("AUTOPILOT_AGENTS", "a"), (key, "0")]).unwrap_err();
            assert!(
                matches!(&err, ConfigError::InvalidValue { key: k, .. } if k == key),
                "{key} accepted 0: {err}"
            );
        }
        let config = load(&[
            ("AUTOPILOT_AGENTS", "a"),
            ("AUTOPILOT_MAX_STEPS", "1"),
            ("AUTOPILOT_MAX_FAILURES", "1"),
        ])
        .unwrap();
        assert_eq!(config.engine.max_steps, 1);
        assert_eq!(config.engine.max_consecutive_failures, 1);
    }

    #[test]
    fn unknown_provider_is_rejected() {
        let err = load(&[
            ("AUTOPILOT_AGENTS", "a"),
            ("AUTOPILOT_PROVIDER_PRIORITY", "openai,mystery"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn provider_keys_keep_order() {
        let config = load(&[
            ("AUTOPILOT_AGENTS", "a"),
            ("OPENAI_API_KEYS", "sk-one, sk-two"),
            ("AUTOPILOT_OPENAI_MODEL", "gpt-test"),
        ])
        .unwrap();
        assert_eq!(config.providers.len(), 1);
        let openai = &config.providers[0];
        assert_eq!(openai.kind, ProviderKind::OpenAi);
        assert_eq!(openai.reasoning_model, "gpt-test");
        let ids: Vec<&str> = openai.credentials.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["openai-1", "openai-2"]);
        assert_eq!(openai.credentials[1].secret.expose_secret(), "sk-two");
    }

    #[test]
    fn debug_output_hides_keys() {
        let config = load(&[("AUTOPILOT_AGENTS", "a"), ("ANTHROPIC_API_KEYS", "sk-ant-secret")])
            .unwrap();
        let rendered = format!("{:?}", config.providers);
        assert!(!rendered.contains("sk-ant-secret"));
    }
}
