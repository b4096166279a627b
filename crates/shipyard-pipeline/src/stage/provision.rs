//! Provision stage: allocate the deployment's sandbox.

use tracing::{info, instrument};

use crate::error::StageFailure;
use crate::provisioner::{SandboxHandle, SandboxProvider, SandboxSpec};
use crate::types::Stage;

/// Run the provision stage.
///
/// The handle returned here is owned by the run until finalize destroys it.
#[instrument(skip_all, fields(sandbox_id = %spec.sandbox_id(), namespace = %spec.namespace))]
pub async fn provision(
    provider: &dyn SandboxProvider,
    spec: &SandboxSpec,
) -> Result<SandboxHandle, StageFailure> {
    let handle = provider
        .create(spec)
        .await
        .map_err(|e| StageFailure::from_provider(Stage::Provision, &e))?;

    info!(sandbox_id = %handle.id, "sandbox provisioned");
    Ok(handle)
}
