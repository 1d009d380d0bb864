//! LLM integration for the autopilot.
//!
//! Supports:
//! - **OpenAI**: chat completions and embeddings over reqwest
//! - **Anthropic**: messages API over reqwest
//!
//! `ProviderDispatcher` sits in front of both and fails over between
//! providers and credentials, tracking per-key health in
//! `KeyHealthRegistry`.

pub mod anthropic;
pub mod classify;
pub mod dispatcher;
pub mod health;
pub mod openai;
pub mod provider;

pub use classify::{FailureClass, classify_failure};
pub use dispatcher::ProviderDispatcher;
pub use health::{KeyHealthRegistry, KeyHealthSnapshot, KeyState};
pub use provider::*;

/// Rough token count for text a provider did not meter.
pub fn estimate_tokens(chars: usize) -> u64 {
    (chars as u64).div_ceil(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_estimate_rounds_up() {
        assert_eq!(estimate_tokens(0), 0);
        assert_eq!(estimate_tokens(1), 1);
        assert_eq!(estimate_tokens(8), 2);
        assert_eq!(estimate_tokens(9), 3);
    }
}
