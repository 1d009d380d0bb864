//! One engine loop per configured agent, sharing a store and dispatcher.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::agent::engine::{EngineDeps, EngineHandle, ExecutionEngine};
use crate::config::EngineConfig;

pub struct AgentFleet {
    cancel: CancellationToken,
    agents: Vec<(String, EngineHandle)>,
}

impl AgentFleet {
    /// Start an engine loop for each agent id. Duplicate ids are started once.
    pub fn spawn(agent_ids: &[String], config: &EngineConfig, deps: EngineDeps) -> Self {
        let cancel = CancellationToken::new();
        let mut agents: Vec<(String, EngineHandle)> = Vec::with_capacity(agent_ids.len());

        for id in agent_ids {
            if agents.iter().any(|(existing, _)| existing == id) {
                continue;
            }
            let engine = Arc::new(ExecutionEngine::new(id.clone(), config.clone(), deps.clone()));
            let agent_id = engine.agent_id().to_string();
            let handle = engine.spawn(cancel.child_token());
            agents.push((agent_id, handle));
        }

        info!(agents = agents.len(), "Agent fleet started");
        Self { cancel, agents }
    }

    pub fn agent_ids(&self) -> Vec<&str> {
        self.agents.iter().map(|(id, _)| id.as_str()).collect()
    }

    /// Cancel every loop and wait for in-flight ticks to finish.
    pub async fn stop(self) {
        self.cancel.cancel();
        futures::future::join_all(self.agents.into_iter().map(|(_, h)| h.stop())).await;
        info!("Agent fleet stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::agent::collaborators::{BroadcastNotifier, NoopMemory, NoopObserver};
    use crate::config::DispatchConfig;
    use crate::llm::{KeyHealthRegistry, ProviderDispatcher};
    use crate::store::{LibSqlBackend, TaskStore};
    use crate::tasks::model::{NewTask, TaskPayload, TaskStatus};

    #[tokio::test]
    async fn each_agent_drains_its_own_queue() {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let a = store.enqueue(NewTask::new("A", TaskPayload::new("a goal"))).await.unwrap();
        let b = store.enqueue(NewTask::new("B", TaskPayload::new("b goal"))).await.unwrap();

        let deps = EngineDeps {
            store: store.clone(),
            dispatcher: Arc::new(ProviderDispatcher::new(
                &DispatchConfig::default(),
                Arc::new(KeyHealthRegistry::new()),
                Vec::new(),
            )),
            observer: Arc::new(NoopObserver),
            memory: Arc::new(NoopMemory),
            notifier: Arc::new(BroadcastNotifier::new(16)),
        };
        let config = EngineConfig {
            poll_interval: Duration::from_millis(20),
            ..EngineConfig::default()
        };
        let ids = vec!["A".to_string(), "B".to_string(), "A".to_string()];
        let fleet = AgentFleet::spawn(&ids, &config, deps);
        assert_eq!(fleet.agent_ids(), vec!["A", "B"]);

        let mut done = false;
        for _ in 0..100 {
            let ta = store.get_task(a.id).await.unwrap().unwrap();
            let tb = store.get_task(b.id).await.unwrap().unwrap();
            if ta.status == TaskStatus::Done && tb.status == TaskStatus::Done {
                done = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        fleet.stop().await;
        assert!(done, "both agents should finish their task");
    }
}
