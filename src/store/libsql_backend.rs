//! libSQL implementation of `TaskStore`.
//!
//! Supports local file and in-memory databases. File databases run in WAL
//! mode so status queries are not blocked by the writer.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, SecondsFormat, SubsecRound, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::store::codec;
use crate::store::migrations;
use crate::store::traits::{STALE_RESET_REASON, TaskStore};
use crate::tasks::model::{
    AgentState, NewTask, Priority, Recurrence, RunStep, Task, TaskPayload, TaskRun, TaskStatus,
    WorkingMemory,
};
use crate::tasks::recurrence;

/// Reason written when a cron rule has no further fire times.
const CRON_EXHAUSTED_REASON: &str = "cron schedule exhausted";

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file, run migrations, and reset
    /// `running` tasks that have not been touched for `stale_after`.
    pub async fn new_local(path: &Path, stale_after: Duration) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.apply_pragmas().await?;
        backend.run_migrations().await?;

        let reset = backend.recover_stale_tasks(stale_after).await?;
        if reset > 0 {
            warn!(count = reset, "Reset stale running tasks to queued");
        }
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn apply_pragmas(&self) -> Result<(), DatabaseError> {
        // PRAGMAs return a row, so they go through query().
        for pragma in ["PRAGMA journal_mode=WAL", "PRAGMA busy_timeout=5000"] {
            let mut rows = self
                .conn()
                .query(pragma, ())
                .await
                .map_err(|e| DatabaseError::Pool(format!("{pragma}: {e}")))?;
            let _ = rows.next().await;
        }
        self.conn()
            .execute("PRAGMA foreign_keys=ON", ())
            .await
            .map_err(|e| DatabaseError::Pool(format!("foreign_keys: {e}")))?;
        Ok(())
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Column list for task SELECT / RETURNING clauses.
const TASK_COLUMNS: &str = "id, agent_id, status, priority, payload_json, recurrence_json, next_run_at, status_reason, created_at, updated_at";

const RUN_COLUMNS: &str =
    "id, task_id, agent_id, started_at, finished_at, steps_json, tokens_estimate, error";

/// Current time at the precision we persist.
fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// Fixed-width RFC 3339 so lexical order equals time order.
fn fmt_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Format a scheduling timestamp, refusing years that would not render as
/// four digits and so would break string ordering against `now`.
fn schedule_ts(column: &str, dt: DateTime<Utc>) -> Result<String, DatabaseError> {
    if !(0..=9999).contains(&dt.year()) {
        return Err(DatabaseError::Constraint(format!(
            "{column} {dt} is outside the years 0000-9999"
        )));
    }
    Ok(fmt_ts(dt.trunc_subsecs(3)))
}

fn parse_ts(column: &str, s: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| DatabaseError::Serialization(format!("{column}: {e}")))
}

fn parse_optional_ts(column: &str, s: Option<String>) -> Result<Option<DateTime<Utc>>, DatabaseError> {
    match s.filter(|s| !s.is_empty()) {
        Some(s) => parse_ts(column, &s).map(Some),
        None => Ok(None),
    }
}

fn parse_uuid(column: &str, s: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Serialization(format!("{column}: {e}")))
}

fn text(row: &libsql::Row, idx: i32, column: &str) -> Result<String, DatabaseError> {
    row.get::<String>(idx)
        .map_err(|e| DatabaseError::Query(format!("{column}: {e}")))
}

/// Map a libsql Row to a Task. Column order matches TASK_COLUMNS.
fn row_to_task(row: &libsql::Row) -> Result<Task, DatabaseError> {
    let id = text(row, 0, "tasks.id")?;
    let agent_id = text(row, 1, "tasks.agent_id")?;
    let status = text(row, 2, "tasks.status")?;
    let priority = row
        .get::<i64>(3)
        .map_err(|e| DatabaseError::Query(format!("tasks.priority: {e}")))?;
    let payload_json = text(row, 4, "tasks.payload_json")?;
    let recurrence_json = text(row, 5, "tasks.recurrence_json")?;
    let next_run_at: Option<String> = row.get::<String>(6).ok();
    let status_reason: Option<String> = row.get::<String>(7).ok();
    let created_at = text(row, 8, "tasks.created_at")?;
    let updated_at = text(row, 9, "tasks.updated_at")?;

    let priority = u8::try_from(priority)
        .map_err(|e| e.to_string())
        .and_then(Priority::new)
        .map_err(|e| DatabaseError::Serialization(format!("tasks.priority: {e}")))?;

    Ok(Task {
        id: parse_uuid("tasks.id", &id)?,
        agent_id,
        status: status
            .parse::<TaskStatus>()
            .map_err(DatabaseError::Serialization)?,
        priority,
        payload: codec::decode::<TaskPayload>("tasks.payload_json", &payload_json)?,
        recurrence: codec::decode::<Recurrence>("tasks.recurrence_json", &recurrence_json)?,
        next_run_at: parse_optional_ts("tasks.next_run_at", next_run_at)?,
        status_reason,
        created_at: parse_ts("tasks.created_at", &created_at)?,
        updated_at: parse_ts("tasks.updated_at", &updated_at)?,
    })
}

fn row_to_run(row: &libsql::Row) -> Result<TaskRun, DatabaseError> {
    let id = text(row, 0, "task_runs.id")?;
    let task_id = text(row, 1, "task_runs.task_id")?;
    let agent_id = text(row, 2, "task_runs.agent_id")?;
    let started_at = text(row, 3, "task_runs.started_at")?;
    let finished_at: Option<String> = row.get::<String>(4).ok();
    let steps_json = text(row, 5, "task_runs.steps_json")?;
    let tokens_estimate: Option<i64> = row.get::<i64>(6).ok();
    let error: Option<String> = row.get::<String>(7).ok();

    Ok(TaskRun {
        id: parse_uuid("task_runs.id", &id)?,
        task_id: parse_uuid("task_runs.task_id", &task_id)?,
        agent_id,
        started_at: parse_ts("task_runs.started_at", &started_at)?,
        finished_at: parse_optional_ts("task_runs.finished_at", finished_at)?,
        steps: codec::decode::<Vec<RunStep>>("task_runs.steps_json", &steps_json)?,
        tokens_estimate: tokens_estimate.and_then(|t| u64::try_from(t).ok()),
        error,
    })
}

async fn collect_tasks(mut rows: libsql::Rows, op: &str) -> Result<Vec<Task>, DatabaseError> {
    let mut tasks = Vec::new();
    while let Some(row) = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Query(format!("{op} row: {e}")))?
    {
        tasks.push(row_to_task(&row)?);
    }
    Ok(tasks)
}

// ── TaskStore implementation ────────────────────────────────────────

#[async_trait]
impl TaskStore for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    async fn enqueue(&self, new_task: NewTask) -> Result<Task, DatabaseError> {
        new_task.recurrence.validate()?;

        let mut task = new_task.into_task(now());
        let next_run_at = task
            .next_run_at
            .map(|t| schedule_ts("next_run_at", t))
            .transpose()?;
        task.next_run_at = task.next_run_at.map(|t| t.trunc_subsecs(3));

        let payload_json = codec::encode(&task.payload)?;
        let recurrence_json = codec::encode(&task.recurrence)?;

        self.conn()
            .execute(
                "INSERT INTO tasks (id, agent_id, status, priority, payload_json, recurrence_json, next_run_at, status_reason, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL, ?8, ?9)",
                params![
                    task.id.to_string(),
                    task.agent_id.as_str(),
                    task.status.as_str(),
                    task.priority.value() as i64,
                    payload_json,
                    recurrence_json,
                    next_run_at,
                    fmt_ts(task.created_at),
                    fmt_ts(task.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("enqueue: {e}")))?;

        debug!(task_id = %task.id, agent_id = %task.agent_id, priority = task.priority.value(), "Task enqueued");
        Ok(task)
    }

    async fn claim_next(&self, agent_id: &str) -> Result<Option<Task>, DatabaseError> {
        let ts = fmt_ts(now());
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "UPDATE tasks SET status = 'running', status_reason = NULL, updated_at = ?2 \
                     WHERE id = ( \
                         SELECT id FROM tasks \
                         WHERE agent_id = ?1 AND status = 'queued' \
                           AND (next_run_at IS NULL OR next_run_at <= ?2) \
                         ORDER BY priority ASC, created_at ASC, rowid ASC \
                         LIMIT 1 \
                     ) AND status = 'queued' \
                     RETURNING {TASK_COLUMNS}"
                ),
                params![agent_id, ts],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("claim_next: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let task = row_to_task(&row)?;
                debug!(task_id = %task.id, agent_id, "Task claimed");
                Ok(Some(task))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("claim_next row: {e}"))),
        }
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_task: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_task(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_task row: {e}"))),
        }
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: TaskStatus,
        reason: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE tasks SET status = ?1, status_reason = ?2, updated_at = ?3 WHERE id = ?4",
                params![
                    status.as_str(),
                    reason.map(str::to_string),
                    fmt_ts(now()),
                    id.to_string()
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_status: {e}")))?;

        if count == 0 {
            return Err(DatabaseError::NotFound {
                entity: "task".to_string(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn touch_task(&self, id: Uuid) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE tasks SET updated_at = ?1 WHERE id = ?2",
                params![fmt_ts(now()), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("touch_task: {e}")))?;
        Ok(())
    }

    async fn requeue_recurring(&self, task: &Task) -> Result<bool, DatabaseError> {
        if task.recurrence.is_once() {
            return Ok(false);
        }

        let ts = now();
        match recurrence::next_run_after(&task.recurrence, ts)? {
            Some(next) => {
                let next_ts = schedule_ts("next_run_at", next)?;
                self.conn()
                    .execute(
                        "UPDATE tasks SET status = 'queued', status_reason = NULL, next_run_at = ?1, updated_at = ?2 WHERE id = ?3",
                        params![next_ts, fmt_ts(ts), task.id.to_string()],
                    )
                    .await
                    .map_err(|e| DatabaseError::Query(format!("requeue_recurring: {e}")))?;
                debug!(task_id = %task.id, next_run_at = %next, "Recurring task requeued");
                Ok(true)
            }
            None => {
                self.update_status(task.id, TaskStatus::Done, Some(CRON_EXHAUSTED_REASON))
                    .await?;
                info!(task_id = %task.id, "Recurrence has no upcoming run, task marked done");
                Ok(false)
            }
        }
    }

    async fn requeue_task(
        &self,
        id: Uuid,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<bool, DatabaseError> {
        let next_run_at = next_run_at
            .map(|t| schedule_ts("next_run_at", t))
            .transpose()?;
        let count = self
            .conn()
            .execute(
                "UPDATE tasks SET status = 'queued', status_reason = NULL, next_run_at = ?1, updated_at = ?2 \
                 WHERE id = ?3 AND status IN ('paused', 'failed')",
                params![
                    next_run_at,
                    fmt_ts(now()),
                    id.to_string()
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("requeue_task: {e}")))?;
        Ok(count > 0)
    }

    async fn list_tasks(
        &self,
        agent_id: &str,
        status: Option<TaskStatus>,
    ) -> Result<Vec<Task>, DatabaseError> {
        let rows = match status {
            Some(status) => self
                .conn()
                .query(
                    &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE agent_id = ?1 AND status = ?2 ORDER BY priority ASC, created_at ASC, rowid ASC"),
                    params![agent_id, status.as_str()],
                )
                .await,
            None => self
                .conn()
                .query(
                    &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE agent_id = ?1 ORDER BY priority ASC, created_at ASC, rowid ASC"),
                    params![agent_id],
                )
                .await,
        }
        .map_err(|e| DatabaseError::Query(format!("list_tasks: {e}")))?;

        collect_tasks(rows, "list_tasks").await
    }

    async fn recover_stale_tasks(&self, older_than: Duration) -> Result<usize, DatabaseError> {
        let current = now();
        let threshold = chrono::Duration::from_std(older_than)
            .map_err(|e| DatabaseError::Constraint(format!("stale threshold: {e}")))?;
        let cutoff = current - threshold;

        let count = self
            .conn()
            .execute(
                "UPDATE tasks SET status = 'queued', status_reason = ?1, updated_at = ?2 \
                 WHERE status = 'running' AND updated_at < ?3",
                params![STALE_RESET_REASON, fmt_ts(current), fmt_ts(cutoff)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("recover_stale_tasks: {e}")))?;
        Ok(count as usize)
    }

    // ── Runs ────────────────────────────────────────────────────────

    async fn save_task_run(&self, run: &TaskRun) -> Result<(), DatabaseError> {
        let steps_json = codec::encode(&run.steps)?;
        let tokens: Option<i64> = run.tokens_estimate.and_then(|t| i64::try_from(t).ok());

        self.conn()
            .execute(
                "INSERT INTO task_runs (id, task_id, agent_id, started_at, finished_at, steps_json, tokens_estimate, error)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT (id) DO UPDATE SET finished_at = excluded.finished_at, steps_json = excluded.steps_json, tokens_estimate = excluded.tokens_estimate, error = excluded.error",
                params![
                    run.id.to_string(),
                    run.task_id.to_string(),
                    run.agent_id.as_str(),
                    fmt_ts(run.started_at),
                    run.finished_at.map(fmt_ts),
                    steps_json,
                    tokens,
                    run.error.clone(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("save_task_run: {e}")))?;
        Ok(())
    }

    async fn list_task_runs(
        &self,
        task_id: Uuid,
        limit: u32,
    ) -> Result<Vec<TaskRun>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {RUN_COLUMNS} FROM task_runs WHERE task_id = ?1 ORDER BY started_at DESC, rowid DESC LIMIT ?2"
                ),
                params![task_id.to_string(), i64::from(limit)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_task_runs: {e}")))?;

        let mut runs = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_task_runs row: {e}")))?
        {
            runs.push(row_to_run(&row)?);
        }
        Ok(runs)
    }

    // ── Agent state ─────────────────────────────────────────────────

    async fn get_agent_state(&self, agent_id: &str) -> Result<Option<AgentState>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT agent_id, current_task_id, last_heartbeat_at, working_memory_json FROM agent_state WHERE agent_id = ?1",
                params![agent_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_agent_state: {e}")))?;

        let row = match rows.next().await {
            Ok(Some(row)) => row,
            Ok(None) => return Ok(None),
            Err(e) => return Err(DatabaseError::Query(format!("get_agent_state row: {e}"))),
        };

        let agent_id = text(&row, 0, "agent_state.agent_id")?;
        let current_task_id = match row.get::<String>(1).ok().filter(|s| !s.is_empty()) {
            Some(s) => Some(parse_uuid("agent_state.current_task_id", &s)?),
            None => None,
        };
        let heartbeat = text(&row, 2, "agent_state.last_heartbeat_at")?;
        let memory_json = text(&row, 3, "agent_state.working_memory_json")?;

        Ok(Some(AgentState {
            agent_id,
            current_task_id,
            last_heartbeat_at: parse_ts("agent_state.last_heartbeat_at", &heartbeat)?,
            working_memory: codec::decode::<WorkingMemory>(
                "agent_state.working_memory_json",
                &memory_json,
            )?,
        }))
    }

    async fn save_agent_state(&self, state: &AgentState) -> Result<(), DatabaseError> {
        let memory_json = codec::encode(&state.working_memory)?;
        self.conn()
            .execute(
                "INSERT INTO agent_state (agent_id, current_task_id, last_heartbeat_at, working_memory_json)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (agent_id) DO UPDATE SET current_task_id = excluded.current_task_id, last_heartbeat_at = excluded.last_heartbeat_at, working_memory_json = excluded.working_memory_json",
                params![
                    state.agent_id.as_str(),
                    state.current_task_id.map(|id| id.to_string()),
                    fmt_ts(state.last_heartbeat_at),
                    memory_json,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("save_agent_state: {e}")))?;
        Ok(())
    }
}
