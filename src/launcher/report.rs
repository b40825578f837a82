//! Launch results and failure causes

use super::state::{LaunchState, ServiceRecord};
use crate::error::{LaunchError, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Why a single service did not reach `ready`
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureCause {
    #[error("build failed: {0}")]
    Build(String),

    #[error("runtime refused to start: {0}")]
    Start(String),

    #[error("volume '{volume}' unavailable: {message}")]
    Volume { volume: String, message: String },

    #[error("not ready after {attempts} probe attempt(s) over {waited:?}")]
    ReadinessTimeout { attempts: u32, waited: Duration },

    #[error("dependency '{0}' failed, service is unreachable")]
    DependencyFailed(String),
}

/// A failed service and its cause
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceFailure {
    pub service: String,
    pub cause: FailureCause,
}

impl fmt::Display for ServiceFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.service, self.cause)
    }
}

/// Every service failure of a run, reported together
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[error("{} service(s) failed to launch: {}", .failures.len(), join_failures(.failures))]
pub struct AggregateFailure {
    pub failures: Vec<ServiceFailure>,
}

fn join_failures(failures: &[ServiceFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Settled outcome of a launcher run
#[derive(Debug, Clone, Serialize)]
pub struct LaunchReport {
    /// Project name
    pub project: String,
    /// When the run began
    pub started_at: DateTime<Utc>,
    /// When the run settled
    pub finished_at: DateTime<Utc>,
    /// Final record of every service, in descriptor order
    pub services: Vec<ServiceRecord>,
    /// Failed services with causes, in descriptor order
    pub failures: Vec<ServiceFailure>,
    /// Services never launched because the run stopped early
    pub skipped: Vec<String>,
    /// Whether the run was cancelled
    pub cancelled: bool,
}

impl LaunchReport {
    /// Every service reached `ready`
    pub fn is_success(&self) -> bool {
        !self.cancelled
            && self.failures.is_empty()
            && self.services.iter().all(|s| s.state == LaunchState::Ready)
    }

    /// Final state of one service
    pub fn state_of(&self, service: &str) -> Option<LaunchState> {
        self.services
            .iter()
            .find(|s| s.name == service)
            .map(|s| s.state)
    }

    /// Failure cause of one service
    pub fn cause_of(&self, service: &str) -> Option<&FailureCause> {
        self.failures
            .iter()
            .find(|f| f.service == service)
            .map(|f| &f.cause)
    }

    /// Convert into a result: cancellation first, then aggregate failure
    pub fn into_result(self) -> Result<LaunchReport> {
        if self.cancelled {
            return Err(LaunchError::Cancelled);
        }
        if !self.failures.is_empty() {
            return Err(AggregateFailure {
                failures: self.failures,
            }
            .into());
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_message() {
        let failure = AggregateFailure {
            failures: vec![
                ServiceFailure {
                    service: "backend".to_string(),
                    cause: FailureCause::Build("no Dockerfile".to_string()),
                },
                ServiceFailure {
                    service: "frontend".to_string(),
                    cause: FailureCause::DependencyFailed("backend".to_string()),
                },
            ],
        };

        assert_eq!(
            failure.to_string(),
            "2 service(s) failed to launch: backend: build failed: no Dockerfile; \
             frontend: dependency 'backend' failed, service is unreachable"
        );
    }
}
