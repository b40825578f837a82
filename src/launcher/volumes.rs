//! Named volume provisioning shared by concurrent launches

use crate::plan::DeploymentPlan;
use crate::runtime::{ContainerRuntime, RuntimeError, VolumeHandle};
use std::collections::HashMap;
use tokio::sync::OnceCell;
use tracing::debug;

/// Ensures each named volume exactly once per run.
///
/// Every declared volume gets its own cell, so services racing on the same
/// volume wait for a single `ensure_volume` call while different volumes
/// proceed independently. A failed attempt leaves the cell empty.
#[derive(Debug, Default)]
pub struct VolumeRegistry {
    cells: HashMap<String, OnceCell<VolumeHandle>>,
}

impl VolumeRegistry {
    pub fn new(plan: &DeploymentPlan) -> Self {
        let cells = plan
            .volumes
            .keys()
            .map(|name| (name.clone(), OnceCell::new()))
            .collect();
        Self { cells }
    }

    /// Handle for `volume`, creating it on first use
    pub async fn ensure(
        &self,
        runtime: &dyn ContainerRuntime,
        plan: &DeploymentPlan,
        volume: &str,
    ) -> Result<VolumeHandle, RuntimeError> {
        let (cell, spec) = match (self.cells.get(volume), plan.volume(volume)) {
            (Some(cell), Some(spec)) => (cell, spec),
            _ => {
                return Err(RuntimeError::Volume(format!(
                    "volume '{}' is not declared",
                    volume
                )))
            }
        };

        let handle = cell
            .get_or_try_init(|| async {
                debug!("Ensuring volume {}", volume);
                runtime.ensure_volume(spec).await
            })
            .await?;
        Ok(handle.clone())
    }

    /// Volumes provisioned so far
    pub fn provisioned(&self) -> Vec<VolumeHandle> {
        let mut handles: Vec<VolumeHandle> =
            self.cells.values().filter_map(|c| c.get().cloned()).collect();
        handles.sort_by(|a, b| a.key.cmp(&b.key));
        handles
    }
}
