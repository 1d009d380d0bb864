//! Agent module — execution engine and the fleet that runs one per agent.

pub mod collaborators;
pub mod engine;
pub mod fleet;
pub mod notify;
pub mod planner;

pub use collaborators::{
    ActivityEvent, ActivityNotifier, BroadcastNotifier, EpisodicMemory, MemoryEntry, MemoryHit,
    NoopMemory, NoopObserver, PageObserver, PageState,
};
pub use engine::{EngineDeps, EngineHandle, ExecutionEngine, RunOutcome};
pub use fleet::AgentFleet;
