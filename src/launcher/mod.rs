//! Dependency-ordered launcher
//!
//! Takes a [`DeploymentPlan`](crate::plan::DeploymentPlan) and brings its
//! services up through a [`ContainerRuntime`](crate::runtime::ContainerRuntime),
//! tracking each service in a [`LaunchTable`].

pub mod orchestrator;
pub mod probe;
pub mod report;
pub mod state;
pub mod volumes;

pub use orchestrator::{Launcher, LauncherConfig};
pub use probe::ProbePolicy;
pub use report::{AggregateFailure, FailureCause, LaunchReport, ServiceFailure};
pub use state::{LaunchState, LaunchTable, ServiceRecord};
