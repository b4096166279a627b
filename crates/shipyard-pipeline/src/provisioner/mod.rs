//! Sandbox provisioning for deployment runs.
//!
//! The orchestrator depends only on [`SandboxProvider`]. Each deployment gets
//! its own sandbox, keyed by the deployment id, and destroys it in finalize.

mod directory;

pub use directory::DirectorySandboxProvider;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;
use crate::types::{DeploymentContext, DeploymentId};

/// Request to allocate a sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxSpec {
    /// Deployment the sandbox belongs to.
    pub deployment_id: DeploymentId,
    /// Project identifier.
    pub project_id: String,
    /// Environment name.
    pub environment: String,
    /// Namespace resolved during validation.
    pub namespace: String,
}

impl SandboxSpec {
    /// Build a spec for a deployment.
    #[must_use]
    pub fn for_deployment(context: &DeploymentContext, namespace: &str) -> Self {
        Self {
            deployment_id: context.deployment_id.clone(),
            project_id: context.project_id.to_string(),
            environment: context.environment.clone(),
            namespace: namespace.to_owned(),
        }
    }

    /// Sandbox id derived from the deployment id.
    ///
    /// Sandboxes are never shared between deployments.
    #[must_use]
    pub fn sandbox_id(&self) -> String {
        format!("sbx-{}", self.deployment_id)
    }

    /// Handle addressing the sandbox this spec allocates.
    ///
    /// Finalize destroys it even when provisioning never returned a handle.
    #[must_use]
    pub fn handle(&self) -> SandboxHandle {
        SandboxHandle {
            id: self.sandbox_id(),
            deployment_id: self.deployment_id.clone(),
            workdir: None,
        }
    }
}

/// Handle to an allocated sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SandboxHandle {
    /// Unique sandbox identifier.
    pub id: String,
    /// Deployment that owns the sandbox.
    pub deployment_id: DeploymentId,
    /// Working directory inside the sandbox, if it has one on local disk.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workdir: Option<PathBuf>,
}

/// Capability for allocating and releasing sandboxes.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// Allocate a sandbox.
    ///
    /// Creating a sandbox that is already live returns its handle, so an
    /// attempt whose response was lost can be retried. Infrastructure
    /// capacity exhaustion is reported with
    /// [`crate::error::FaultClass::Capacity`].
    async fn create(&self, spec: &SandboxSpec) -> Result<SandboxHandle, ProviderError>;

    /// Release a sandbox.
    ///
    /// A sandbox that no longer exists is reported with
    /// [`crate::error::FaultClass::NotFound`].
    async fn destroy(&self, handle: &SandboxHandle) -> Result<(), ProviderError>;
}

/// In-memory provider for tests.
#[derive(Debug, Default)]
pub struct MockSandboxProvider {
    live: Mutex<HashMap<String, SandboxHandle>>,
    created: Mutex<Vec<String>>,
    destroyed: Mutex<Vec<String>>,
}

impl MockSandboxProvider {
    /// Create an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Ids of every sandbox created so far.
    #[must_use]
    pub fn created(&self) -> Vec<String> {
        self.created.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Ids of every sandbox destroyed so far, in order.
    #[must_use]
    pub fn destroyed(&self) -> Vec<String> {
        self.destroyed.lock().map(|d| d.clone()).unwrap_or_default()
    }

    /// Number of sandboxes currently alive.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live.lock().map(|l| l.len()).unwrap_or_default()
    }
}

#[async_trait]
impl SandboxProvider for MockSandboxProvider {
    async fn create(&self, spec: &SandboxSpec) -> Result<SandboxHandle, ProviderError> {
        let handle = spec.handle();

        let mut live = self
            .live
            .lock()
            .map_err(|_| ProviderError::rejected("lock poisoned"))?;
        if let Some(existing) = live.get(&handle.id) {
            return Ok(existing.clone());
        }
        live.insert(handle.id.clone(), handle.clone());
        drop(live);

        if let Ok(mut created) = self.created.lock() {
            created.push(handle.id.clone());
        }
        Ok(handle)
    }

    async fn destroy(&self, handle: &SandboxHandle) -> Result<(), ProviderError> {
        let removed = self
            .live
            .lock()
            .map_err(|_| ProviderError::rejected("lock poisoned"))?
            .remove(&handle.id);

        if removed.is_none() {
            return Err(ProviderError::not_found(format!(
                "sandbox not found: {}",
                handle.id
            )));
        }

        if let Ok(mut destroyed) = self.destroyed.lock() {
            destroyed.push(handle.id.clone());
        }
        Ok(())
    }
}
