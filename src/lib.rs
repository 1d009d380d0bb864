//! Agent Autopilot — durable task queue and multi-provider agent execution.

pub mod agent;
pub mod config;
pub mod error;
pub mod llm;
pub mod store;
pub mod tasks;
