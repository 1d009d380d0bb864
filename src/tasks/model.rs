//! Task queue data model.
//!
//! A `Task` is one unit of agent work; a `TaskRun` is one execution attempt of
//! it; `AgentState` is the latest working-memory snapshot for an agent.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::RecurrenceError;
use crate::tasks::recurrence;

// ── Status ──────────────────────────────────────────────────────────

/// Lifecycle status of a task.
///
/// `queued → running → {done | failed | paused}`. A recurring `done` task goes
/// back to `queued`; `paused` and `failed` stay put until re-queued externally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Done,
    Failed,
    Paused,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
            TaskStatus::Paused => "paused",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(TaskStatus::Queued),
            "running" => Ok(TaskStatus::Running),
            "done" => Ok(TaskStatus::Done),
            "failed" => Ok(TaskStatus::Failed),
            "paused" => Ok(TaskStatus::Paused),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

// ── Priority ────────────────────────────────────────────────────────

/// Task priority, 1 (highest) through 5 (lowest).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Priority(u8);

impl Priority {
    pub const HIGHEST: Priority = Priority(1);
    pub const NORMAL: Priority = Priority(3);
    pub const LOWEST: Priority = Priority(5);

    pub fn new(value: u8) -> Result<Self, String> {
        if (1..=5).contains(&value) {
            Ok(Self(value))
        } else {
            Err(format!("priority must be between 1 and 5, got {value}"))
        }
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::NORMAL
    }
}

impl TryFrom<u8> for Priority {
    type Error = String;
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Priority::new(value)
    }
}

impl From<Priority> for u8 {
    fn from(p: Priority) -> u8 {
        p.0
    }
}

// ── Payload & recurrence ────────────────────────────────────────────

/// What the agent is asked to do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPayload {
    pub goal: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub params: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constraints: Vec<String>,
}

impl TaskPayload {
    pub fn new(goal: impl Into<String>) -> Self {
        Self {
            goal: goal.into(),
            url: None,
            params: serde_json::Map::new(),
            constraints: Vec::new(),
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    pub fn with_constraint(mut self, constraint: impl Into<String>) -> Self {
        self.constraints.push(constraint.into());
        self
    }
}

/// When a completed task re-enters the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Recurrence {
    #[default]
    Once,
    Every {
        interval_ms: u64,
    },
    Cron {
        expr: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tz: Option<String>,
    },
}

impl Recurrence {
    pub fn is_once(&self) -> bool {
        matches!(self, Recurrence::Once)
    }

    /// Reject rules that could never produce a next run.
    pub fn validate(&self) -> Result<(), RecurrenceError> {
        match self {
            Recurrence::Once => Ok(()),
            Recurrence::Every { interval_ms } => recurrence::interval(*interval_ms).map(|_| ()),
            Recurrence::Cron { expr, tz } => {
                recurrence::parse_schedule(expr)?;
                recurrence::parse_offset(tz.as_deref())?;
                Ok(())
            }
        }
    }
}

// ── Task ────────────────────────────────────────────────────────────

/// A unit of work owned by exactly one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub agent_id: String,
    pub status: TaskStatus,
    pub priority: Priority,
    pub payload: TaskPayload,
    pub recurrence: Recurrence,
    pub next_run_at: Option<DateTime<Utc>>,
    pub status_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Parameters for `TaskStore::enqueue`.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub agent_id: String,
    pub payload: TaskPayload,
    pub priority: Priority,
    pub recurrence: Recurrence,
    pub next_run_at: Option<DateTime<Utc>>,
}

impl NewTask {
    pub fn new(agent_id: impl Into<String>, payload: TaskPayload) -> Self {
        Self {
            agent_id: agent_id.into(),
            payload,
            priority: Priority::default(),
            recurrence: Recurrence::Once,
            next_run_at: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_recurrence(mut self, recurrence: Recurrence) -> Self {
        self.recurrence = recurrence;
        self
    }

    pub fn with_next_run_at(mut self, at: DateTime<Utc>) -> Self {
        self.next_run_at = Some(at);
        self
    }

    /// Materialize into a `queued` task stamped with `now`.
    pub fn into_task(self, now: DateTime<Utc>) -> Task {
        Task {
            id: Uuid::new_v4(),
            agent_id: self.agent_id,
            status: TaskStatus::Queued,
            priority: self.priority,
            payload: self.payload,
            recurrence: self.recurrence,
            next_run_at: self.next_run_at,
            status_reason: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// ── Runs ────────────────────────────────────────────────────────────

/// One executed plan step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStep {
    pub index: usize,
    pub description: String,
    pub result: String,
    pub at: DateTime<Utc>,
}

/// One execution attempt of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRun {
    pub id: Uuid,
    pub task_id: Uuid,
    pub agent_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub steps: Vec<RunStep>,
    pub tokens_estimate: Option<u64>,
    pub error: Option<String>,
}

impl TaskRun {
    pub fn start(task: &Task) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id: task.id,
            agent_id: task.agent_id.clone(),
            started_at: Utc::now(),
            finished_at: None,
            steps: Vec::new(),
            tokens_estimate: None,
            error: None,
        }
    }

    pub fn record_step(&mut self, index: usize, description: &str, result: impl Into<String>) {
        self.steps.push(RunStep {
            index,
            description: description.to_string(),
            result: result.into(),
            at: Utc::now(),
        });
    }

    pub fn add_tokens(&mut self, tokens: u64) {
        *self.tokens_estimate.get_or_insert(0) += tokens;
    }

    pub fn finish(&mut self, error: Option<String>) {
        self.finished_at = Some(Utc::now());
        self.error = error;
    }
}

// ── Agent state ─────────────────────────────────────────────────────

/// Scratch state the engine keeps while working a task.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WorkingMemory {
    pub goal: String,
    #[serde(default)]
    pub plan: Vec<String>,
    #[serde(default)]
    pub step_index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_page_hash: Option<String>,
    #[serde(default)]
    pub scratch: serde_json::Map<String, serde_json::Value>,
}

impl WorkingMemory {
    pub fn new(goal: impl Into<String>) -> Self {
        Self {
            goal: goal.into(),
            ..Default::default()
        }
    }
}

/// Latest snapshot for one agent. Exactly one row per agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    pub agent_id: String,
    pub current_task_id: Option<Uuid>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub working_memory: WorkingMemory,
}

impl AgentState {
    pub fn idle(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            current_task_id: None,
            last_heartbeat_at: Utc::now(),
            working_memory: WorkingMemory::default(),
        }
    }

    pub fn heartbeat(&mut self) {
        self.last_heartbeat_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_display_parse() {
        for status in [
            TaskStatus::Queued,
            TaskStatus::Running,
            TaskStatus::Done,
            TaskStatus::Failed,
            TaskStatus::Paused,
        ] {
            let parsed: TaskStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("stuck".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn priority_bounds() {
        assert!(Priority::new(0).is_err());
        assert!(Priority::new(6).is_err());
        assert_eq!(Priority::new(1).unwrap(), Priority::HIGHEST);
        assert_eq!(Priority::default().value(), 3);
        assert!(Priority::HIGHEST < Priority::LOWEST);
    }

    #[test]
    fn priority_rejects_out_of_range_json() {
        assert!(serde_json::from_str::<Priority>("9").is_err());
        assert_eq!(serde_json::from_str::<Priority>("2").unwrap().value(), 2);
    }

    #[test]
    fn recurrence_serializes_tagged() {
        let every = Recurrence::Every { interval_ms: 60_000 };
        let json = serde_json::to_value(&every).unwrap();
        assert_eq!(json["kind"], "every");
        assert_eq!(json["interval_ms"], 60_000);

        let cron: Recurrence =
            serde_json::from_str(r#"{"kind":"cron","expr":"0 9 * * *"}"#).unwrap();
        assert_eq!(
            cron,
            Recurrence::Cron {
                expr: "0 9 * * *".into(),
                tz: None
            }
        );
    }

    #[test]
    fn recurrence_validation() {
        assert!(Recurrence::Once.validate().is_ok());
        assert!(Recurrence::Every { interval_ms: 0 }.validate().is_err());
        assert!(Recurrence::Every { interval_ms: 10 }.validate().is_ok());
        assert!(
            Recurrence::Cron {
                expr: "not a cron".into(),
                tz: None
            }
            .validate()
            .is_err()
        );
        assert!(
            Recurrence::Cron {
                expr: "*/5 * * * *".into(),
                tz: Some("Mars/Olympus".into())
            }
            .validate()
            .is_err()
        );
        assert!(
            Recurrence::Cron {
                expr: "*/5 * * * *".into(),
                tz: Some("+02:00".into())
            }
            .validate()
            .is_ok()
        );
    }

    #[test]
    fn payload_builder_skips_empty_fields() {
        let payload = TaskPayload::new("Like latest post").with_url("https://x.com/home");
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["goal"], "Like latest post");
        assert_eq!(json["url"], "https://x.com/home");
        assert!(json.get("params").is_none());
        assert!(json.get("constraints").is_none());
    }

    #[test]
    fn run_accumulates_tokens() {
        let task = NewTask::new("a", TaskPayload::new("g")).into_task(Utc::now());
        let mut run = TaskRun::start(&task);
        assert!(run.tokens_estimate.is_none());
        run.add_tokens(10);
        run.add_tokens(5);
        assert_eq!(run.tokens_estimate, Some(15));
        run.record_step(0, "open page", "ok");
        run.finish(None);
        assert_eq!(run.steps.len(), 1);
        assert!(run.finished_at.is_some());
    }
}
