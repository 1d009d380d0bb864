//! Single async interface for task queue persistence.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::tasks::model::{AgentState, NewTask, Task, TaskRun, TaskStatus};

/// Reason written on tasks reset by the stale-running scan.
pub const STALE_RESET_REASON: &str = "reset after stale run";

/// Backend-agnostic persistence for tasks, run history and agent snapshots.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Tasks ───────────────────────────────────────────────────────

    /// Insert a new task in status `queued`.
    ///
    /// Rejects recurrence rules that can never fire (zero interval, bad cron
    /// expression, unknown time zone) and a `next_run_at` past year 9999.
    async fn enqueue(&self, task: NewTask) -> Result<Task, DatabaseError>;

    /// Atomically claim the next eligible task for an agent.
    ///
    /// Eligible: `queued` with `next_run_at` unset or in the past. Lowest
    /// priority value first, then oldest. The selected row is flipped to
    /// `running` by the same statement, so two callers never get the same task.
    async fn claim_next(&self, agent_id: &str) -> Result<Option<Task>, DatabaseError>;

    /// Get a task by ID.
    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError>;

    /// Set status and reason, bumping `updated_at`.
    async fn update_status(
        &self,
        id: Uuid,
        status: TaskStatus,
        reason: Option<&str>,
    ) -> Result<(), DatabaseError>;

    /// Bump `updated_at` on a task without changing anything else.
    async fn touch_task(&self, id: Uuid) -> Result<(), DatabaseError>;

    /// Put a finished recurring task back in the queue.
    ///
    /// Returns `false` (and writes nothing) for `once` tasks. A cron rule with
    /// no upcoming fire time marks the task `done` and also returns `false`.
    /// A next run past year 9999 is a `Constraint` error and writes nothing.
    async fn requeue_recurring(&self, task: &Task) -> Result<bool, DatabaseError>;

    /// Operator re-queue of a `paused` or `failed` task.
    ///
    /// Returns `false` if the task is missing or in any other state.
    async fn requeue_task(
        &self,
        id: Uuid,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<bool, DatabaseError>;

    /// List an agent's tasks, optionally filtered by status, in claim order.
    async fn list_tasks(
        &self,
        agent_id: &str,
        status: Option<TaskStatus>,
    ) -> Result<Vec<Task>, DatabaseError>;

    /// Force `running` tasks untouched for longer than `older_than` back to
    /// `queued`. Returns the number of tasks reset.
    async fn recover_stale_tasks(&self, older_than: Duration) -> Result<usize, DatabaseError>;

    // ── Runs ────────────────────────────────────────────────────────

    /// Insert or replace a run record.
    async fn save_task_run(&self, run: &TaskRun) -> Result<(), DatabaseError>;

    /// Runs of a task, most recent first.
    async fn list_task_runs(&self, task_id: Uuid, limit: u32)
    -> Result<Vec<TaskRun>, DatabaseError>;

    // ── Agent state ─────────────────────────────────────────────────

    async fn get_agent_state(&self, agent_id: &str) -> Result<Option<AgentState>, DatabaseError>;

    /// Overwrite the agent's snapshot.
    async fn save_agent_state(&self, state: &AgentState) -> Result<(), DatabaseError>;
}
