//! Deployment plans
//!
//! A [`DeploymentPlan`] is the validated, immutable form of a compose
//! descriptor: resolved services, named volumes and the dependency graph
//! between services.

pub mod deployment;
pub mod duration;
pub mod graph;
pub mod spec;

pub use deployment::DeploymentPlan;
pub use graph::DependencyGraph;
pub use spec::{
    BuildContext, BuildSpec, ImageRef, ImageSource, MountBinding, MountSource, PortBinding,
    Protocol, Readiness, RestartPolicy, ServiceSpec, VolumeSpec,
};
