//! Task queue domain types and recurrence rules.

pub mod model;
pub mod recurrence;

pub use model::{
    AgentState, NewTask, Priority, Recurrence, RunStep, Task, TaskPayload, TaskRun, TaskStatus,
    WorkingMemory,
};
