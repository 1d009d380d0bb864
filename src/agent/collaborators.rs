//! External collaborators consumed by the execution engine.
//!
//! The engine never depends on a concrete browser, memory store or activity
//! feed. It talks to these traits, and every failure coming back through them
//! is non-fatal to a run.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

// ── Page observation ────────────────────────────────────────────────

/// Kind of alert raised by a page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    Captcha,
    #[serde(rename = "2fa")]
    TwoFactor,
    #[serde(other)]
    Other,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::Captcha => "captcha",
            AlertKind::TwoFactor => "2fa",
            AlertKind::Other => "other",
        }
    }

    /// Alerts that need a human before the agent can continue.
    pub fn is_blocking(&self) -> bool {
        matches!(self, AlertKind::Captcha | AlertKind::TwoFactor)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageAlert {
    #[serde(rename = "type")]
    pub kind: AlertKind,
    #[serde(default)]
    pub text: String,
}

/// Snapshot of an external page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageState {
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, rename = "pageType")]
    pub page_type: String,
    #[serde(default)]
    pub elements: Vec<serde_json::Value>,
    #[serde(default)]
    pub alerts: Vec<PageAlert>,
    pub hash: String,
}

impl PageState {
    pub fn blocking_alerts(&self) -> impl Iterator<Item = &PageAlert> {
        self.alerts.iter().filter(|a| a.kind.is_blocking())
    }
}

#[async_trait]
pub trait PageObserver: Send + Sync {
    async fn observe(&self, url: &str) -> anyhow::Result<PageState>;
}

/// Observer for deployments without a browser: every call reports
/// observation as unavailable.
pub struct NoopObserver;

#[async_trait]
impl PageObserver for NoopObserver {
    async fn observe(&self, _url: &str) -> anyhow::Result<PageState> {
        anyhow::bail!("page observation unavailable")
    }
}

// ── Episodic memory ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryHit {
    pub summary: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub agent_id: String,
    pub summary: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<Uuid>,
}

#[async_trait]
pub trait EpisodicMemory: Send + Sync {
    async fn search(
        &self,
        query: &str,
        limit: usize,
        agent_id: &str,
    ) -> anyhow::Result<Vec<MemoryHit>>;

    async fn store(&self, entry: MemoryEntry) -> anyhow::Result<()>;
}

/// Remembers nothing.
pub struct NoopMemory;

#[async_trait]
impl EpisodicMemory for NoopMemory {
    async fn search(&self, _query: &str, _limit: usize, _agent_id: &str) -> anyhow::Result<Vec<MemoryHit>> {
        Ok(Vec::new())
    }

    async fn store(&self, _entry: MemoryEntry) -> anyhow::Result<()> {
        Ok(())
    }
}

// ── Activity feed ───────────────────────────────────────────────────

/// One line in an agent's activity feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<Uuid>,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl ActivityEvent {
    pub fn new(agent_id: impl Into<String>, task_id: Option<Uuid>, message: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            task_id,
            message: message.into(),
            at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait ActivityNotifier: Send + Sync {
    async fn append(&self, event: ActivityEvent) -> anyhow::Result<()>;
}

/// Fans activity out to any number of subscribers.
///
/// Events sent while nobody is subscribed are dropped.
#[derive(Clone)]
pub struct BroadcastNotifier {
    tx: broadcast::Sender<ActivityEvent>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ActivityEvent> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl ActivityNotifier for BroadcastNotifier {
    async fn append(&self, event: ActivityEvent) -> anyhow::Result<()> {
        let _ = self.tx.send(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alert_wire_names() {
        let alert: PageAlert = serde_json::from_str(r#"{"type":"2fa","text":"Enter code"}"#).unwrap();
        assert_eq!(alert.kind, AlertKind::TwoFactor);
        assert!(alert.kind.is_blocking());

        let alert: PageAlert = serde_json::from_str(r#"{"type":"cookie_banner"}"#).unwrap();
        assert_eq!(alert.kind, AlertKind::Other);
        assert!(!alert.kind.is_blocking());
    }

    #[test]
    fn page_state_from_observer_json() {
        let raw = r#"{
            "url": "https://x.com/home",
            "title": "Home",
            "pageType": "feed",
            "elements": [{"tag": "button", "text": "Like"}],
            "alerts": [{"type": "captcha", "text": "Prove you are human"}, {"type": "toast", "text": "hi"}],
            "hash": "abc123"
        }"#;
        let page: PageState = serde_json::from_str(raw).unwrap();
        assert_eq!(page.page_type, "feed");
        let blocking: Vec<_> = page.blocking_alerts().collect();
        assert_eq!(blocking.len(), 1);
        assert_eq!(blocking[0].kind, AlertKind::Captcha);
    }

    #[tokio::test]
    async fn noop_observer_reports_unavailable() {
        assert!(NoopObserver.observe("https://example.com").await.is_err());
    }

    #[tokio::test]
    async fn noop_memory_is_empty() {
        assert!(NoopMemory.search("q", 3, "a").await.unwrap().is_empty());
        NoopMemory
            .store(MemoryEntry {
                agent_id: "a".into(),
                summary: "s".into(),
                tags: vec![],
                task_id: None,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn broadcast_reaches_subscribers() {
        let notifier = BroadcastNotifier::new(8);
        let mut rx = notifier.subscribe();
        notifier
            .append(ActivityEvent::new("A", None, "started"))
            .await
            .unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.agent_id, "A");
        assert_eq!(event.message, "started");
    }

    #[tokio::test]
    async fn broadcast_without_subscribers_is_ok() {
        let notifier = BroadcastNotifier::new(8);
        assert!(notifier.append(ActivityEvent::new("A", None, "x")).await.is_ok());
    }
}
