//! Execution engine: one polling loop per agent.
//!
//! Each tick claims at most one task, obtains a plan, and walks it step by
//! step through the provider dispatcher. Working memory is persisted after
//! every step so a crashed process leaves a usable snapshot behind.
//!
//! Only persistence failures escape a run. Provider, observer, memory and
//! notifier failures are absorbed into the step log or logged and skipped.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::agent::collaborators::{
    ActivityEvent, ActivityNotifier, EpisodicMemory, MemoryEntry, PageObserver, PageState,
};
use crate::agent::notify::NotifyGate;
use crate::agent::planner;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::llm::provider::CompletionRequest;
use crate::llm::{ProviderDispatcher, estimate_tokens};
use crate::store::TaskStore;
use crate::tasks::model::{AgentState, Task, TaskRun, TaskStatus, WorkingMemory};

/// Everything an engine talks to.
#[derive(Clone)]
pub struct EngineDeps {
    pub store: Arc<dyn TaskStore>,
    pub dispatcher: Arc<ProviderDispatcher>,
    pub observer: Arc<dyn PageObserver>,
    pub memory: Arc<dyn EpisodicMemory>,
    pub notifier: Arc<dyn ActivityNotifier>,
}

/// How a run ended, as persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub task_id: Uuid,
    pub run_id: Uuid,
    /// Status the task was left in. `Queued` means a recurring task was requeued.
    pub status: TaskStatus,
    pub reason: Option<String>,
    pub steps: usize,
    pub tokens_estimate: Option<u64>,
}

/// Why the step loop stopped.
enum RunEnd {
    Completed,
    Paused(String),
    Failed(String),
}

pub struct ExecutionEngine {
    agent_id: String,
    config: EngineConfig,
    deps: EngineDeps,
    notify_gate: Mutex<NotifyGate>,
}

impl ExecutionEngine {
    pub fn new(agent_id: impl Into<String>, config: EngineConfig, deps: EngineDeps) -> Self {
        let notify_gate = Mutex::new(NotifyGate::new(config.min_notify_interval));
        Self {
            agent_id: agent_id.into(),
            config,
            deps,
            notify_gate,
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Claim and execute at most one task.
    pub async fn tick(&self) -> Result<Option<RunOutcome>, EngineError> {
        let Some(task) = self.deps.store.claim_next(&self.agent_id).await? else {
            debug!(agent_id = %self.agent_id, "No eligible task");
            return Ok(None);
        };
        info!(
            agent_id = %self.agent_id,
            task_id = %task.id,
            goal = %truncate(&task.payload.goal, 80),
            "Task claimed"
        );
        self.execute(task).await.map(Some)
    }

    /// Execute an already-claimed (`running`) task to a persisted outcome.
    pub async fn execute(&self, task: Task) -> Result<RunOutcome, EngineError> {
        if task.status != TaskStatus::Running {
            return Err(EngineError::NotRunning {
                id: task.id,
                status: task.status.to_string(),
            });
        }

        let mut run = TaskRun::start(&task);
        let mut state = AgentState::idle(&self.agent_id);
        state.current_task_id = Some(task.id);
        state.working_memory = WorkingMemory::new(&task.payload.goal);

        let result = match self.drive(&task, &mut run, &mut state).await {
            Ok(end) => self.finalize(&task, &mut run, &mut state, end).await,
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            self.abort(&task, run, state, e).await;
        }
        result
    }

    /// Run the polling loop until `cancel` fires. A tick in progress when
    /// the token is cancelled runs to completion first.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> EngineHandle {
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            info!(
                agent_id = %self.agent_id,
                interval_ms = self.config.poll_interval.as_millis() as u64,
                "Engine loop started"
            );
            let mut ticker = tokio::time::interval(self.config.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                match self.tick().await {
                    Ok(Some(outcome)) => debug!(
                        agent_id = %self.agent_id,
                        task_id = %outcome.task_id,
                        status = %outcome.status,
                        "Tick finished a run"
                    ),
                    Ok(None) => {}
                    Err(e) => error!(agent_id = %self.agent_id, error = %e, "Tick failed"),
                }
            }
            info!(agent_id = %self.agent_id, "Engine loop stopped");
        });
        EngineHandle { cancel, handle }
    }

    // ── Run phases ──────────────────────────────────────────────────

    async fn drive(
        &self,
        task: &Task,
        run: &mut TaskRun,
        state: &mut AgentState,
    ) -> Result<RunEnd, EngineError> {
        self.deps.store.save_agent_state(state).await?;
        self.notify(task.id, format!("Started: {}", truncate(&task.payload.goal, 120)), false)
            .await;

        let plan = self.plan(task, run).await;
        info!(task_id = %task.id, steps = plan.len(), "Plan ready");
        state.working_memory.plan = plan.clone();
        state.heartbeat();
        self.deps.store.save_agent_state(state).await?;

        let step_count = plan.len().min(self.config.max_steps);
        if plan.len() > step_count {
            warn!(task_id = %task.id, planned = plan.len(), cap = step_count, "Plan truncated to step cap");
        }

        let mut consecutive_failures: u32 = 0;
        let mut previous: Option<String> = None;

        for (index, description) in plan.iter().take(step_count).enumerate() {
            let page = match &task.payload.url {
                Some(url) => self.observe(task.id, url).await,
                None => None,
            };
            if let Some(page) = &page {
                let blocking: Vec<_> = page.blocking_alerts().collect();
                if !blocking.is_empty() {
                    let kinds: Vec<&str> = blocking.iter().map(|a| a.kind.as_str()).collect();
                    let texts: Vec<&str> = blocking
                        .iter()
                        .map(|a| a.text.as_str())
                        .filter(|t| !t.is_empty())
                        .collect();
                    let mut reason = format!("blocked by {}", kinds.join(", "));
                    if !texts.is_empty() {
                        reason.push_str(&format!(": {}", texts.join("; ")));
                    }
                    info!(task_id = %task.id, step = index, reason = %reason, "Run paused");
                    return Ok(RunEnd::Paused(reason));
                }
                state.working_memory.last_page_hash = Some(page.hash.clone());
            }

            let request = planner::build_step_request(
                task,
                &plan,
                index,
                previous.as_deref(),
                page.as_ref(),
                self.config.max_output_tokens,
            );
            match self.complete(request, run).await {
                Ok(text) => {
                    debug!(task_id = %task.id, step = index, "Step succeeded");
                    run.record_step(index, description, text.clone());
                    consecutive_failures = 0;
                    previous = Some(text);
                }
                Err(message) => {
                    warn!(task_id = %task.id, step = index, error = %message, "Step failed");
                    run.record_step(index, description, message.clone());
                    consecutive_failures += 1;
                    previous = Some(message);
                }
            }

            state.working_memory.step_index = index + 1;
            state.heartbeat();
            self.deps.store.save_agent_state(state).await?;
            self.deps.store.touch_task(task.id).await?;

            if consecutive_failures >= self.config.max_consecutive_failures {
                return Ok(RunEnd::Failed(format!(
                    "{consecutive_failures} consecutive failures"
                )));
            }

            self.notify(
                task.id,
                format!("Step {}/{}: {}", index + 1, step_count, truncate(description, 120)),
                false,
            )
            .await;
        }

        Ok(RunEnd::Completed)
    }

    async fn plan(&self, task: &Task, run: &mut TaskRun) -> Vec<String> {
        let goal = &task.payload.goal;
        let hints = if self.config.memory_hint_limit == 0 {
            Vec::new()
        } else {
            match self
                .deps
                .memory
                .search(goal, self.config.memory_hint_limit, &self.agent_id)
                .await
            {
                Ok(hints) => hints,
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "Memory search failed, planning without hints");
                    Vec::new()
                }
            }
        };

        let request = planner::build_plan_request(task, &hints, self.config.max_output_tokens);
        match self.complete(request, run).await {
            Ok(text) => planner::parse_plan(&text, goal),
            Err(message) => {
                warn!(task_id = %task.id, error = %message, "Planning failed, using single-step plan");
                vec![goal.clone()]
            }
        }
    }

    /// One dispatched completion. Token usage goes on the run either way the
    /// provider reports it; failures come back as the text to record.
    async fn complete(&self, request: CompletionRequest, run: &mut TaskRun) -> Result<String, String> {
        let prompt_chars = request.prompt_chars();
        match self.deps.dispatcher.complete(request).await {
            Ok(resp) => {
                let tokens = match resp.usage {
                    Some(usage) => u64::from(usage.total()),
                    None => estimate_tokens(prompt_chars + resp.text.len()),
                };
                run.add_tokens(tokens);
                Ok(resp.text)
            }
            Err(e) => Err(format!("LLM call failed: {e}")),
        }
    }

    async fn observe(&self, task_id: Uuid, url: &str) -> Option<PageState> {
        match tokio::time::timeout(self.config.observe_timeout, self.deps.observer.observe(url)).await
        {
            Ok(Ok(page)) => Some(page),
            Ok(Err(e)) => {
                debug!(task_id = %task_id, error = %e, "Observation unavailable, continuing without page context");
                None
            }
            Err(_) => {
                warn!(
                    task_id = %task_id,
                    timeout_secs = self.config.observe_timeout.as_secs(),
                    "Observation timed out, continuing without page context"
                );
                None
            }
        }
    }

    async fn finalize(
        &self,
        task: &Task,
        run: &mut TaskRun,
        state: &mut AgentState,
        end: RunEnd,
    ) -> Result<RunOutcome, EngineError> {
        let store = &self.deps.store;
        let (status, reason) = match end {
            RunEnd::Completed => {
                let requeued = store.requeue_recurring(task).await?;
                if !requeued && task.recurrence.is_once() {
                    store.update_status(task.id, TaskStatus::Done, None).await?;
                }
                run.finish(None);
                self.remember(task, run).await;
                if requeued {
                    (TaskStatus::Queued, None)
                } else {
                    // An exhausted cron rule leaves its own reason on the row.
                    let reason = store.get_task(task.id).await?.and_then(|t| t.status_reason);
                    (TaskStatus::Done, reason)
                }
            }
            RunEnd::Paused(reason) => {
                store
                    .update_status(task.id, TaskStatus::Paused, Some(&reason))
                    .await?;
                run.finish(Some(reason.clone()));
                (TaskStatus::Paused, Some(reason))
            }
            RunEnd::Failed(reason) => {
                store
                    .update_status(task.id, TaskStatus::Failed, Some(&reason))
                    .await?;
                run.finish(Some(reason.clone()));
                (TaskStatus::Failed, Some(reason))
            }
        };

        store.save_task_run(run).await?;
        state.current_task_id = None;
        state.heartbeat();
        store.save_agent_state(state).await?;

        let line = match (&status, &reason) {
            (TaskStatus::Queued, _) => "Completed, scheduled to run again".to_string(),
            (TaskStatus::Done, _) => "Completed".to_string(),
            (s, Some(r)) => format!("{s}: {r}"),
            (s, None) => s.to_string(),
        };
        self.notify(task.id, format!("{line} ({} steps)", run.steps.len()), true)
            .await;

        info!(
            agent_id = %self.agent_id,
            task_id = %task.id,
            status = %status,
            steps = run.steps.len(),
            tokens = run.tokens_estimate.unwrap_or(0),
            "Run finished"
        );

        Ok(RunOutcome {
            task_id: task.id,
            run_id: run.id,
            status,
            reason,
            steps: run.steps.len(),
            tokens_estimate: run.tokens_estimate,
        })
    }

    /// Best-effort cleanup after a persistence failure while running or
    /// finalizing: mark the task failed, keep the run, clear the pointer.
    async fn abort(&self, task: &Task, mut run: TaskRun, mut state: AgentState, cause: &EngineError) {
        error!(agent_id = %self.agent_id, task_id = %task.id, error = %cause, "Run aborted by persistence failure");
        let reason = truncate(&format!("persistence error: {cause}"), 500);
        let store = &self.deps.store;

        if let Err(e) = store
            .update_status(task.id, TaskStatus::Failed, Some(&reason))
            .await
        {
            error!(task_id = %task.id, error = %e, "Failed to mark aborted task failed");
        }
        run.finish(Some(reason));
        if let Err(e) = store.save_task_run(&run).await {
            error!(task_id = %task.id, error = %e, "Failed to save aborted run");
        }
        state.current_task_id = None;
        state.heartbeat();
        if let Err(e) = store.save_agent_state(&state).await {
            error!(agent_id = %self.agent_id, error = %e, "Failed to clear agent state");
        }
    }

    async fn remember(&self, task: &Task, run: &TaskRun) {
        let last = run
            .steps
            .last()
            .map(|s| truncate(&s.result, 160))
            .unwrap_or_default();
        let entry = MemoryEntry {
            agent_id: self.agent_id.clone(),
            summary: format!(
                "Completed \"{}\" in {} steps. Last result: {last}",
                truncate(&task.payload.goal, 120),
                run.steps.len()
            ),
            tags: vec!["task_run".to_string(), "success".to_string()],
            task_id: Some(task.id),
        };
        if let Err(e) = self.deps.memory.store(entry).await {
            warn!(task_id = %task.id, error = %e, "Failed to store run summary");
        }
    }

    async fn notify(&self, task_id: Uuid, message: String, force: bool) {
        if !self.notify_gate.lock().await.allow(force) {
            return;
        }
        let event = ActivityEvent::new(&self.agent_id, Some(task_id), message);
        if let Err(e) = self.deps.notifier.append(event).await {
            debug!(agent_id = %self.agent_id, error = %e, "Activity notification dropped");
        }
    }
}

/// Handle to a running engine loop.
pub struct EngineHandle {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl EngineHandle {
    /// Stop polling and wait for the loop to exit.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            error!(error = %e, "Engine loop panicked");
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while end > 0 && !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &s[..end])
    }
}
