//! Unified error handling for taskmem
//!
//! Low-level shared-memory failures are reported as [`SegmentError`] by the
//! segment layer and classified here into [`TaskmemError`] so the binary can
//! decide between local recovery and aborting the owning process.

use crate::core::shared_segment::SegmentError;
use std::io;
use thiserror::Error;

/// Main error type for the application
#[derive(Error, Debug)]
pub enum TaskmemError {
    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Shared memory resources (region, lock object)
    #[error("Resource error: {message}")]
    Resource {
        message: String,
        resource_type: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Lock acquisition or release failures
    #[error("Concurrency error: {message}")]
    Concurrency {
        message: String,
        operation: Option<String>,
    },

    /// Process management errors
    #[error("Process error: {message}")]
    Process {
        message: String,
        command: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Filesystem errors
    #[error("Filesystem error: {message} (path: {path})")]
    Filesystem {
        message: String,
        path: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Validation errors
    #[error("Validation error: {message}")]
    Validation {
        message: String,
        field: Option<String>,
        value: Option<String>,
    },
}

pub type TaskmemResult<T> = Result<T, TaskmemError>;

/// Error categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Config,
    Resource,
    Concurrency,
    Process,
    Filesystem,
    Validation,
}

impl ErrorCategory {
    pub fn display_name(&self) -> &'static str {
        match self {
            ErrorCategory::Config => "Configuration",
            ErrorCategory::Resource => "Resource",
            ErrorCategory::Concurrency => "Concurrency",
            ErrorCategory::Process => "Process",
            ErrorCategory::Filesystem => "Filesystem",
            ErrorCategory::Validation => "Validation",
        }
    }
}

impl TaskmemError {
    /// Get error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            TaskmemError::Config { .. } => ErrorCategory::Config,
            TaskmemError::Resource { .. } => ErrorCategory::Resource,
            TaskmemError::Concurrency { .. } => ErrorCategory::Concurrency,
            TaskmemError::Process { .. } => ErrorCategory::Process,
            TaskmemError::Filesystem { .. } => ErrorCategory::Filesystem,
            TaskmemError::Validation { .. } => ErrorCategory::Validation,
        }
    }

    /// Whether the owning process may keep running after this error.
    ///
    /// Anything touching the segment or its lock is fatal: continuing could
    /// leave `reference_count` or the lock state inconsistent.
    pub fn is_recoverable(&self) -> bool {
        match self {
            TaskmemError::Config { .. } => false,
            TaskmemError::Resource { .. } => false,
            TaskmemError::Concurrency { .. } => false,
            TaskmemError::Process { .. } => true,
            TaskmemError::Filesystem { .. } => true,
            TaskmemError::Validation { .. } => true,
        }
    }

    /// Get user-friendly message
    pub fn user_message(&self) -> String {
        match self {
            TaskmemError::Config { message, .. } => format!("Configuration problem: {}", message),
            TaskmemError::Resource {
                message,
                resource_type,
                ..
            } => format!("Failed to initialize shared memory ({}): {}", resource_type, message),
            TaskmemError::Concurrency { message, .. } => {
                format!("Shared lock failure: {}", message)
            }
            TaskmemError::Process {
                message, command, ..
            } => format!("Could not launch '{}': {}", command, message),
            TaskmemError::Filesystem { message, path, .. } => {
                format!("File access failed for {}: {}", path, message)
            }
            TaskmemError::Validation { message, .. } => format!("Invalid input: {}", message),
        }
    }
}

impl From<SegmentError> for TaskmemError {
    fn from(err: SegmentError) -> Self {
        match err {
            SegmentError::Lock(message) => TaskmemError::Concurrency {
                message,
                operation: Some("shared_segment_lock::acquire".to_string()),
            },
            SegmentError::LockInit(message) => TaskmemError::Concurrency {
                message,
                operation: Some("shared_segment_lock::init".to_string()),
            },
            SegmentError::InvalidName(name) => TaskmemError::Validation {
                message: format!("invalid segment name '{name}'"),
                field: Some("segment_name".to_string()),
                value: Some(name),
            },
            other => {
                let message = other.to_string();
                TaskmemError::Resource {
                    message,
                    resource_type: "shared_memory".to_string(),
                    source: Some(Box::new(other)),
                }
            }
        }
    }
}

impl From<config::ConfigError> for TaskmemError {
    fn from(err: config::ConfigError) -> Self {
        TaskmemError::Config {
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }
}

impl From<io::Error> for TaskmemError {
    fn from(err: io::Error) -> Self {
        TaskmemError::Filesystem {
            message: err.to_string(),
            path: "unknown".to_string(),
            source: Some(Box::new(err)),
        }
    }
}

/// Error creation helpers
pub mod errors {
    use super::*;

    pub fn config_error(message: impl Into<String>) -> TaskmemError {
        TaskmemError::Config {
            message: message.into(),
            source: None,
        }
    }

    pub fn filesystem_error(
        message: impl Into<String>,
        path: impl Into<String>,
        source: io::Error,
    ) -> TaskmemError {
        TaskmemError::Filesystem {
            message: message.into(),
            path: path.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn process_error(
        message: impl Into<String>,
        command: impl Into<String>,
        source: Option<io::Error>,
    ) -> TaskmemError {
        TaskmemError::Process {
            message: message.into(),
            command: command.into(),
            source: source.map(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>),
        }
    }

    pub fn validation_error(
        message: impl Into<String>,
        field: Option<String>,
        value: Option<String>,
    ) -> TaskmemError {
        TaskmemError::Validation {
            message: message.into(),
            field,
            value,
        }
    }
}
