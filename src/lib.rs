//! taskmem library
//!
//! Cross-process coordination over a named shared-memory segment: a shared
//! counter, leader election between MAIN processes, and short-lived copy
//! processes launched by the leader.

pub mod commands;
pub mod config;
pub mod coordinator;
pub mod core;
pub mod election;
pub mod error;
pub mod platform;
pub mod roles;
pub mod signal;
pub mod storage;
pub mod supervisor;
pub mod task_log;
pub mod utils;
pub mod workers;

// Re-export commonly used types for convenience
pub use config::Settings;
pub use core::{DetachOutcome, Segment, SegmentError, SegmentGuard, SegmentName, SharedState};
pub use error::{ErrorCategory, TaskmemError, TaskmemResult};
pub use roles::Role;
pub use storage::{InProcessBackend, SegmentBackend, ShmemBackend};
