//! Foreman Coordinator Library
//!
//! This crate provides the coordinator daemon for Foreman: the task and
//! worker registries, the scheduling engine, the failure/disable policy,
//! the pruner, state persistence, and the JSON-over-HTTP RPC surface.

pub mod config;
pub mod history;
pub mod http;
pub mod metrics;
pub mod persistence;
pub mod scheduler;
pub mod state;

pub use config::Config;
pub use history::{JsonlHistory, NopHistory, TaskEvent, TaskHistory, TransitionCause};
pub use scheduler::Scheduler;
pub use state::SchedulerState;
