//! Minimum-interval throttle for status notifications.

use std::time::Duration;

use tokio::time::Instant;

/// Lets at most one non-forced notification through per `min_interval`.
/// Forced (terminal) notifications always pass and restart the window.
#[derive(Debug)]
pub struct NotifyGate {
    min_interval: Duration,
    last_sent: Option<Instant>,
}

impl NotifyGate {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_sent: None,
        }
    }

    /// Whether a notification may be sent now; records it if so.
    pub fn allow(&mut self, force: bool) -> bool {
        let now = Instant::now();
        let due = self
            .last_sent
            .is_none_or(|last| now.duration_since(last) >= self.min_interval);
        if force || due {
            self.last_sent = Some(now);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn throttles_until_interval_passes() {
        let mut gate = NotifyGate::new(Duration::from_secs(300));
        assert!(gate.allow(false));
        assert!(!gate.allow(false));

        tokio::time::advance(Duration::from_secs(299)).await;
        assert!(!gate.allow(false));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(gate.allow(false));
    }

    #[tokio::test(start_paused = true)]
    async fn forced_always_passes() {
        let mut gate = NotifyGate::new(Duration::from_secs(300));
        assert!(gate.allow(false));
        assert!(gate.allow(true));
        // The forced send restarted the window.
        tokio::time::advance(Duration::from_secs(200)).await;
        assert!(!gate.allow(false));
    }
}
