//! Failure classification for provider errors.
//!
//! Status code decides first. Message matching is only a fallback for
//! failures that never got an HTTP answer.

/// What a failed call means for the credential that made it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Rate limited; sit out the cooldown window.
    RateLimited,
    /// Out of credits, over quota, or rejected; never use again this process.
    CredentialExhausted,
    /// Anything else; leave health untouched.
    Other,
}

const EXHAUSTION_MARKERS: &[&str] = &["insufficient", "credits", "quota"];

pub fn classify_failure(status: Option<u16>, message: &str) -> FailureClass {
    match status {
        Some(429) => FailureClass::RateLimited,
        Some(401 | 402 | 403) => FailureClass::CredentialExhausted,
        Some(_) => FailureClass::Other,
        None => {
            let lower = message.to_ascii_lowercase();
            if EXHAUSTION_MARKERS.iter().any(|m| lower.contains(m)) {
                FailureClass::CredentialExhausted
            } else {
                FailureClass::Other
            }
        }
    }
}
