//! Pipeline stages.
//!
//! Each stage is a single async entry point that takes the immutable
//! [`DeploymentContext`](crate::types::DeploymentContext), the outputs of the
//! stages before it, and one collaborator capability. It returns its typed
//! payload or a [`StageFailure`](crate::error::StageFailure). Stages know
//! nothing about retries, deadlines or each other; the orchestrator owns
//! those concerns.

pub mod build;
pub mod finalize;
pub mod provision;
pub mod publish;
pub mod sync;
pub mod validate;

pub use build::{BuildArtifact, BuildOutput, BuildRunner, BuildSpec, CommandBuildRunner};
pub use finalize::{CleanupPlan, FinalizeReport};
pub use publish::{PublishIdentity, PublishTarget, RegistryPublisher};
pub use sync::{ObjectStoreTransfer, StorageTransfer, SyncStats};
pub use validate::{DeploymentValidator, StaticValidator};
