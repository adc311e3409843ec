//! Foreman Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - Network/HTTP
//! - Persistence
//! - Runtime specifics
//!
//! All types here represent the core scheduling domain of Foreman: tasks,
//! workers, resources, and the clock they are judged against.

pub mod clock;
pub mod error;
pub mod ids;
pub mod resources;
pub mod status;
pub mod task;
pub mod worker;

// Re-export commonly used types
pub use clock::{Clock, SimulatedClock, SystemClock};
pub use error::SchedulerError;
pub use ids::{TaskId, WorkerId};
pub use resources::ResourceLedger;
pub use status::TaskStatus;
pub use task::{FailureWindow, Task};
pub use worker::Worker;
