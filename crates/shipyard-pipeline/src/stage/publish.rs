//! Publish stage: push the artifact to the target runtime.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use super::build::BuildArtifact;
use super::sync::classify;
use crate::error::{ProviderError, StageFailure};
use crate::types::{DeploymentConfig, Stage};

/// Public identity of a published revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishIdentity {
    /// URL the revision is served from.
    pub endpoint: String,
    /// Revision identifier assigned by the target.
    pub revision_id: String,
}

/// Capability that makes an artifact live.
///
/// A successful publish is externally visible and is not undone by the
/// pipeline.
#[async_trait]
pub trait PublishTarget: Send + Sync {
    /// Publish `artifact` using the resolved deployment config.
    async fn publish(
        &self,
        artifact: &BuildArtifact,
        config: &DeploymentConfig,
    ) -> Result<PublishIdentity, ProviderError>;
}

/// Run the publish stage.
#[instrument(skip_all, fields(namespace = %config.namespace, artifact = %artifact.artifact_ref))]
pub async fn publish(
    target: &dyn PublishTarget,
    artifact: &BuildArtifact,
    config: &DeploymentConfig,
) -> Result<PublishIdentity, StageFailure> {
    let identity = target
        .publish(artifact, config)
        .await
        .map_err(|e| StageFailure::from_provider(Stage::Publish, &e))?;

    info!(endpoint = %identity.endpoint, revision_id = %identity.revision_id, "revision published");
    Ok(identity)
}

/// Manifest written for every published revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionManifest {
    /// Revision identifier.
    pub revision_id: String,
    /// Namespace the revision belongs to.
    pub namespace: String,
    /// Registry name.
    pub registry: String,
    /// Artifact reference from the build.
    pub artifact_ref: String,
    /// Public endpoint.
    pub endpoint: String,
    /// When the revision was published.
    pub published_at: DateTime<Utc>,
}

/// Publishes revisions into an object store registry.
///
/// Each publish writes `{registry}/revisions/{revision_id}.json` and then
/// repoints `{registry}/current.json` at it.
pub struct RegistryPublisher {
    store: Arc<dyn ObjectStore>,
    base_domain: String,
}

impl RegistryPublisher {
    /// Create a publisher writing into `store`.
    #[must_use]
    pub fn new(store: Arc<dyn ObjectStore>, base_domain: impl Into<String>) -> Self {
        Self {
            store,
            base_domain: base_domain.into(),
        }
    }

    /// Read the manifest currently live for `registry`.
    pub async fn current(&self, registry: &str) -> Result<RevisionManifest, ProviderError> {
        let location = ObjectPath::from(format!("{registry}/current.json"));
        let data = self
            .store
            .get(&location)
            .await
            .map_err(|e| ProviderError::new(classify(&e), format!("failed to read {location}: {e}")))?
            .bytes()
            .await
            .map_err(|e| ProviderError::network(format!("failed to read {location}: {e}")))?;

        serde_json::from_slice(&data)
            .map_err(|e| ProviderError::rejected(format!("invalid manifest at {location}: {e}")))
    }

    async fn put_json(&self, location: &ObjectPath, data: Vec<u8>) -> Result<(), ProviderError> {
        self.store
            .put(location, Bytes::from(data).into())
            .await
            .map_err(|e| ProviderError::new(classify(&e), format!("failed to write {location}: {e}")))?;
        Ok(())
    }
}

impl std::fmt::Debug for RegistryPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryPublisher")
            .field("store", &self.store.to_string())
            .field("base_domain", &self.base_domain)
            .finish()
    }
}

#[async_trait]
impl PublishTarget for RegistryPublisher {
    async fn publish(
        &self,
        artifact: &BuildArtifact,
        config: &DeploymentConfig,
    ) -> Result<PublishIdentity, ProviderError> {
        let revision_id = ulid::Ulid::new().to_string().to_lowercase();
        let endpoint = format!("https://{}.{}", config.namespace, self.base_domain);

        let manifest = RevisionManifest {
            revision_id: revision_id.clone(),
            namespace: config.namespace.clone(),
            registry: config.registry.clone(),
            artifact_ref: artifact.artifact_ref.clone(),
            endpoint: endpoint.clone(),
            published_at: Utc::now(),
        };
        let data = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| ProviderError::rejected(format!("failed to serialise manifest: {e}")))?;

        let revision = ObjectPath::from(format!("{}/revisions/{revision_id}.json", config.registry));
        self.put_json(&revision, data.clone()).await?;
        self.put_json(&ObjectPath::from(format!("{}/current.json", config.registry)), data)
            .await?;

        Ok(PublishIdentity {
            endpoint,
            revision_id,
        })
    }
}
