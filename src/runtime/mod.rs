//! Container runtime adapter
//!
//! The launcher never talks to a container engine directly. Everything it
//! needs goes through [`ContainerRuntime`], a deliberately narrow interface:
//! build an image, start an instance, check readiness once, stop, and manage
//! named volumes. Retry and backoff policy stays in the launcher.

pub mod docker;
#[cfg(test)]
pub(crate) mod fake;

pub use docker::DockerRuntime;

use crate::plan::{BuildSpec, PortBinding, Readiness, ServiceSpec, VolumeSpec};
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Image produced by a build or named by the descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageHandle {
    /// Reference the runtime can start from
    pub reference: String,
}

/// A started service instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceHandle {
    /// Runtime identifier (container name or id)
    pub id: String,
    /// Service the instance belongs to
    pub service: String,
}

impl fmt::Display for InstanceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.id, self.service)
    }
}

/// A named volume known to the runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VolumeHandle {
    /// Runtime name of the volume
    pub name: String,
    /// Key the descriptor uses for it
    pub key: String,
    /// Whether this call created it (as opposed to finding it)
    pub created: bool,
    /// Managed outside the project
    pub external: bool,
}

/// Mount with its source resolved to a runtime name or host path
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedMount {
    /// Runtime volume name or absolute host path
    pub source: String,
    /// Mount path in the container
    pub target: String,
    /// Read only
    pub read_only: bool,
}

/// Errors reported by a runtime adapter
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("build failed: {0}")]
    Build(String),

    #[error("start rejected: {0}")]
    Start(String),

    #[error("volume error: {0}")]
    Volume(String),

    #[error("probe error: {0}")]
    Probe(String),

    #[error("stop failed: {0}")]
    Stop(String),

    #[error("command failed: {0}")]
    Command(String),
}

impl RuntimeError {
    /// Underlying message without the category prefix
    pub fn message(&self) -> String {
        match self {
            RuntimeError::Build(m)
            | RuntimeError::Start(m)
            | RuntimeError::Volume(m)
            | RuntimeError::Probe(m)
            | RuntimeError::Stop(m)
            | RuntimeError::Command(m) => m.clone(),
        }
    }
}

/// Narrow interface to an external container engine
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Build an image for a service
    async fn build(&self, service: &ServiceSpec, build: &BuildSpec)
        -> Result<ImageHandle, RuntimeError>;

    /// Start a service instance from an image
    async fn start(
        &self,
        service: &ServiceSpec,
        image: &ImageHandle,
        ports: &[PortBinding],
        volumes: &[ResolvedMount],
    ) -> Result<InstanceHandle, RuntimeError>;

    /// Single, non-blocking readiness check
    async fn probe_ready(
        &self,
        instance: &InstanceHandle,
        readiness: &Readiness,
    ) -> Result<bool, RuntimeError>;

    /// Stop and release an instance
    async fn stop(&self, instance: &InstanceHandle) -> Result<(), RuntimeError>;

    /// Find or create a named volume
    async fn ensure_volume(&self, volume: &VolumeSpec) -> Result<VolumeHandle, RuntimeError>;

    /// Remove a named volume
    async fn remove_volume(&self, volume: &VolumeHandle) -> Result<(), RuntimeError>;
}
