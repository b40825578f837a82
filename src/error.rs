//! Error types for rune-launch

use crate::launcher::report::AggregateFailure;
use crate::launcher::state::LaunchState;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for launcher operations
pub type Result<T> = std::result::Result<T, LaunchError>;

/// Exit code for a fully successful run
pub const EXIT_OK: i32 = 0;
/// Exit code when one or more services failed to launch
pub const EXIT_RUNTIME_FAILURE: i32 = 1;
/// Exit code when the descriptor or its dependency graph is invalid
pub const EXIT_VALIDATION_FAILURE: i32 = 2;
/// Exit code for I/O and adapter setup problems
pub const EXIT_ENVIRONMENT_FAILURE: i32 = 3;
/// Exit code after a user abort
pub const EXIT_CANCELLED: i32 = 130;

/// Launcher error types
#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("Compose file parse error: {0}")]
    ComposeParse(String),

    #[error("No compose file found in {}", .0.display())]
    ComposeNotFound(PathBuf),

    #[error("Invalid deployment: {0}")]
    Validation(#[from] ValidationError),

    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Invalid state transition for service {service}: {from} -> {to}")]
    InvalidTransition {
        service: String,
        from: LaunchState,
        to: LaunchState,
    },

    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("{0}")]
    Aggregate(#[from] AggregateFailure),

    #[error("Launch cancelled")]
    Cancelled,

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl LaunchError {
    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            LaunchError::ComposeParse(_)
            | LaunchError::ComposeNotFound(_)
            | LaunchError::Validation(_) => EXIT_VALIDATION_FAILURE,
            LaunchError::Aggregate(_) => EXIT_RUNTIME_FAILURE,
            LaunchError::Cancelled => EXIT_CANCELLED,
            _ => EXIT_ENVIRONMENT_FAILURE,
        }
    }
}

/// Problems found while turning a descriptor into a deployment plan.
///
/// All of these are detected before the first runtime call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Service '{service}' depends on unknown service '{missing}'")]
    UnknownDependency { service: String, missing: String },

    #[error("Cyclic dependency: {}", .cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    #[error("Host port {port}/{protocol} is published by both '{first}' and '{second}'")]
    DuplicateHostPort {
        port: u16,
        protocol: String,
        first: String,
        second: String,
    },

    #[error("Service '{0}' specifies both 'image' and 'build'")]
    ConflictingSource(String),

    #[error("Service '{0}' must have either 'image' or 'build' specified")]
    MissingSource(String),

    #[error("Service '{service}' mounts undefined volume '{volume}'")]
    UndefinedVolume { service: String, volume: String },

    #[error("Service '{service}' has invalid port mapping '{value}'")]
    InvalidPort { service: String, value: String },

    #[error("Service '{service}' has invalid volume mount '{value}'")]
    InvalidMount { service: String, value: String },

    #[error("Service '{service}' has invalid restart policy '{value}'")]
    InvalidRestartPolicy { service: String, value: String },

    #[error("Invalid duration '{0}'")]
    InvalidDuration(String),

    #[error("Invalid project name '{0}'")]
    InvalidProjectName(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::report::{FailureCause, ServiceFailure};

    #[test]
    fn test_cycle_message_lists_path() {
        let err = ValidationError::CyclicDependency {
            cycle: vec![
                "frontend".to_string(),
                "fourth".to_string(),
                "frontend".to_string(),
            ],
        };
        assert_eq!(
            err.to_string(),
            "Cyclic dependency: frontend -> fourth -> frontend"
        );
    }

    #[test]
    fn test_exit_codes_are_distinct() {
        let validation: LaunchError = ValidationError::MissingSource("web".to_string()).into();
        let runtime: LaunchError = AggregateFailure {
            failures: vec![ServiceFailure {
                service: "web".to_string(),
                cause: FailureCause::Start("port busy".to_string()),
            }],
        }
        .into();

        assert_eq!(validation.exit_code(), EXIT_VALIDATION_FAILURE);
        assert_eq!(runtime.exit_code(), EXIT_RUNTIME_FAILURE);
        assert_eq!(LaunchError::Cancelled.exit_code(), EXIT_CANCELLED);
        assert_ne!(validation.exit_code(), runtime.exit_code());
    }
}
