//! Error types for the autopilot.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Recurrence error: {0}")]
    Recurrence(#[from] RecurrenceError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<RecurrenceError> for DatabaseError {
    fn from(e: RecurrenceError) -> Self {
        DatabaseError::Constraint(e.to_string())
    }
}

/// Errors from a single provider call.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} returned HTTP {status}: {message}")]
    Http {
        provider: String,
        status: u16,
        message: String,
    },

    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} timed out after {timeout:?}")]
    Timeout { provider: String, timeout: Duration },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Provider {provider} does not support {capability}")]
    Unsupported {
        provider: String,
        capability: String,
    },
}

impl LlmError {
    /// HTTP-equivalent status code, when the failure carried one.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            LlmError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Errors surfaced by the provider dispatcher after failover.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("No configured provider supports {capability}")]
    NoCapableProvider { capability: String },

    #[error("No healthy credentials available for {capability}")]
    NoHealthyCredentials { capability: String },

    #[error("All providers failed after {attempts} attempt(s); last error: {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: LlmError,
    },
}

/// Invalid recurrence rules, rejected at enqueue time.
#[derive(Debug, thiserror::Error)]
pub enum RecurrenceError {
    #[error("Invalid cron expression '{expr}': {reason}")]
    InvalidCron { expr: String, reason: String },

    #[error("Unsupported time zone '{0}' (use UTC or a fixed offset like +05:30)")]
    InvalidTimeZone(String),

    #[error("Recurrence interval must be greater than zero")]
    ZeroInterval,

    #[error("Recurrence interval of {interval_ms} ms is too large")]
    IntervalOverflow { interval_ms: u64 },
}

/// Execution engine errors. Only persistence failures abort a run; provider and
/// collaborator failures are absorbed into the step log.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Persistence failed: {0}")]
    Database(#[from] DatabaseError),

    #[error("Task {id} is not running (status {status})")]
    NotRunning { id: Uuid, status: String },
}

/// Result type alias for the autopilot.
pub type Result<T> = std::result::Result<T, Error>;
