//! Per-service launch state

use super::report::FailureCause;
use crate::error::{LaunchError, Result};
use crate::runtime::{ImageHandle, InstanceHandle};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;
use std::sync::{Mutex, MutexGuard};

/// Launch state of a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LaunchState {
    /// Not launched yet
    Pending,
    /// Image build in progress
    Building,
    /// Instance started, waiting for readiness
    Starting,
    /// Ready for dependents
    Ready,
    /// Failed, see the recorded cause
    Failed,
    /// Stopped by cancellation or teardown. A service cancelled while
    /// starting keeps its instance handle and its container may still be
    /// running until teardown removes it.
    Stopped,
}

impl LaunchState {
    /// Whether moving to `next` is a legal transition
    pub fn can_transition_to(self, next: LaunchState) -> bool {
        use LaunchState::*;
        matches!(
            (self, next),
            (Pending, Building | Starting | Failed | Stopped)
                | (Building, Starting | Failed | Stopped)
                | (Starting, Ready | Failed | Stopped)
                | (Ready, Stopped)
                | (Failed, Stopped)
        )
    }

    /// No further launch progress is possible
    pub fn is_settled(self) -> bool {
        matches!(
            self,
            LaunchState::Ready | LaunchState::Failed | LaunchState::Stopped
        )
    }
}

impl std::fmt::Display for LaunchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LaunchState::Pending => write!(f, "pending"),
            LaunchState::Building => write!(f, "building"),
            LaunchState::Starting => write!(f, "starting"),
            LaunchState::Ready => write!(f, "ready"),
            LaunchState::Failed => write!(f, "failed"),
            LaunchState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Everything the launcher knows about one service
#[derive(Debug, Clone, Serialize)]
pub struct ServiceRecord {
    pub name: String,
    pub state: LaunchState,
    /// Set when the state is `failed`
    pub cause: Option<FailureCause>,
    pub image: Option<ImageHandle>,
    pub instance: Option<InstanceHandle>,
    /// Readiness probes performed
    pub probe_attempts: u32,
    pub updated_at: DateTime<Utc>,
}

impl ServiceRecord {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: LaunchState::Pending,
            cause: None,
            image: None,
            instance: None,
            probe_attempts: 0,
            updated_at: Utc::now(),
        }
    }
}

/// Launch records for a fixed set of services.
///
/// Keys never change after construction and each record has its own lock,
/// so concurrent launches only contend on the service they touch.
#[derive(Debug)]
pub struct LaunchTable {
    records: IndexMap<String, Mutex<ServiceRecord>>,
}

impl LaunchTable {
    /// Table with every service pending
    pub fn new<'a>(services: impl IntoIterator<Item = &'a str>) -> Self {
        let records = services
            .into_iter()
            .map(|name| (name.to_string(), Mutex::new(ServiceRecord::new(name))))
            .collect();
        Self { records }
    }

    fn lock(&self, service: &str) -> Result<MutexGuard<'_, ServiceRecord>> {
        self.records
            .get(service)
            .ok_or_else(|| LaunchError::ServiceNotFound(service.to_string()))?
            .lock()
            .map_err(|e| LaunchError::Lock(e.to_string()))
    }

    /// Current state of a service
    pub fn state(&self, service: &str) -> Result<LaunchState> {
        Ok(self.lock(service)?.state)
    }

    /// Copy of one record
    pub fn record(&self, service: &str) -> Result<ServiceRecord> {
        Ok(self.lock(service)?.clone())
    }

    /// Move a service to `to`, returning the previous state
    pub fn transition(&self, service: &str, to: LaunchState) -> Result<LaunchState> {
        let mut record = self.lock(service)?;
        let from = record.state;
        if !from.can_transition_to(to) {
            return Err(LaunchError::InvalidTransition {
                service: service.to_string(),
                from,
                to,
            });
        }
        record.state = to;
        record.updated_at = Utc::now();
        Ok(from)
    }

    /// Mark a service failed with a cause.
    ///
    /// Returns `false` without changing anything when the service already
    /// settled, so repeated propagation is harmless.
    pub fn fail(&self, service: &str, cause: FailureCause) -> Result<bool> {
        let mut record = self.lock(service)?;
        if record.state.is_settled() {
            return Ok(false);
        }
        record.state = LaunchState::Failed;
        record.cause = Some(cause);
        record.updated_at = Utc::now();
        Ok(true)
    }

    /// Move an unsettled service to `stopped`
    pub fn stop_unsettled(&self, service: &str) -> Result<bool> {
        let mut record = self.lock(service)?;
        if record.state.is_settled() {
            return Ok(false);
        }
        record.state = LaunchState::Stopped;
        record.updated_at = Utc::now();
        Ok(true)
    }

    pub fn set_image(&self, service: &str, image: ImageHandle) -> Result<()> {
        self.lock(service)?.image = Some(image);
        Ok(())
    }

    pub fn set_instance(&self, service: &str, instance: InstanceHandle) -> Result<()> {
        self.lock(service)?.instance = Some(instance);
        Ok(())
    }

    pub fn set_probe_attempts(&self, service: &str, attempts: u32) -> Result<()> {
        self.lock(service)?.probe_attempts = attempts;
        Ok(())
    }

    /// Names of services currently in `state`, in descriptor order
    pub fn in_state(&self, state: LaunchState) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for name in self.records.keys() {
            if self.lock(name)?.state == state {
                names.push(name.clone());
            }
        }
        Ok(names)
    }

    /// Copy of every record, in descriptor order
    pub fn snapshot(&self) -> Result<Vec<ServiceRecord>> {
        self.records
            .keys()
            .map(|name| self.record(name))
            .collect()
    }
}
