//! Core types for shipyard-pipeline.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, StageFailure};
use crate::provisioner::SandboxHandle;
use crate::stage::{BuildArtifact, FinalizeReport, PublishIdentity, SyncStats};
use crate::state::PipelineState;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap an existing identifier.
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Get the ID as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Unique identifier for a deployment run.
    DeploymentId
);
string_id!(
    /// Unique identifier for a project.
    ProjectId
);
string_id!(
    /// Unique identifier for an organization (the quota scope).
    OrgId
);
string_id!(
    /// Identifier of the user who requested the deployment.
    UserId
);

impl DeploymentId {
    /// Generate a new unique deployment ID using ULID.
    #[must_use]
    pub fn generate() -> Self {
        Self(ulid::Ulid::new().to_string().to_lowercase())
    }
}

/// Where the project's source tree comes from.
///
/// Both variants point at a tree already materialized on local disk; fetching
/// it is not the pipeline's job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceRef {
    /// A git checkout at a specific commit.
    Git {
        /// Branch name.
        branch: String,
        /// Commit SHA.
        commit: String,
        /// Local checkout directory.
        checkout: PathBuf,
    },
    /// An uploaded archive, already unpacked.
    Upload {
        /// Opaque upload handle.
        handle: String,
        /// Directory the upload was unpacked into.
        path: PathBuf,
    },
}

impl SourceRef {
    /// Local root of the source tree.
    #[must_use]
    pub fn root(&self) -> &Path {
        match self {
            Self::Git { checkout, .. } => checkout,
            Self::Upload { path, .. } => path,
        }
    }

    /// Short human readable revision label.
    #[must_use]
    pub fn revision(&self) -> String {
        match self {
            Self::Git { branch, commit, .. } => {
                format!("{branch}@{}", &commit[..commit.len().min(8)])
            }
            Self::Upload { handle, .. } => format!("upload:{handle}"),
        }
    }
}

/// Immutable input for one deployment run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentContext {
    /// Correlation id for the run.
    pub deployment_id: DeploymentId,
    /// Project being deployed.
    pub project_id: ProjectId,
    /// Owning organization.
    pub org_id: OrgId,
    /// Requesting user.
    pub user_id: UserId,
    /// Target environment (e.g. "production", "preview-42").
    pub environment: String,
    /// Source tree to deploy.
    pub source: SourceRef,
    /// When the deployment was requested.
    pub requested_at: DateTime<Utc>,
}

impl DeploymentContext {
    /// Create a context with a freshly generated deployment id.
    #[must_use]
    pub fn new(
        project_id: ProjectId,
        org_id: OrgId,
        user_id: UserId,
        environment: impl Into<String>,
        source: SourceRef,
    ) -> Self {
        Self {
            deployment_id: DeploymentId::generate(),
            project_id,
            org_id,
            user_id,
            environment: environment.into(),
            source,
            requested_at: Utc::now(),
        }
    }
}

/// Infrastructure parameters resolved during validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentConfig {
    /// Namespace (resource group) the deployment lives in.
    pub namespace: String,
    /// Registry or container name the artifact is published to.
    pub registry: String,
    /// Connection endpoint of the target runtime.
    pub endpoint: String,
    /// Storage prefix files are synced under.
    pub storage_prefix: String,
}

/// A discrete unit of pipeline work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Permission checks and config resolution.
    Validate,
    /// Sandbox allocation.
    Provision,
    /// Source transfer.
    Sync,
    /// Build inside the sandbox.
    Build,
    /// Artifact publication.
    Publish,
    /// Resource release and final record.
    Finalize,
}

impl Stage {
    /// All stages in execution order.
    pub const ALL: [Self; 6] = [
        Self::Validate,
        Self::Provision,
        Self::Sync,
        Self::Build,
        Self::Publish,
        Self::Finalize,
    ];

    /// Get the stage name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Validate => "validate",
            Self::Provision => "provision",
            Self::Sync => "sync",
            Self::Build => "build",
            Self::Publish => "publish",
            Self::Finalize => "finalize",
        }
    }

    /// The pipeline state in which this stage executes.
    #[must_use]
    pub const fn state(&self) -> PipelineState {
        match self {
            Self::Validate => PipelineState::Validating,
            Self::Provision => PipelineState::Provisioning,
            Self::Sync => PipelineState::Syncing,
            Self::Build => PipelineState::Building,
            Self::Publish => PipelineState::Publishing,
            Self::Finalize => PipelineState::Finalizing,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Overall status of a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    /// Record created, no stage started.
    Pending,
    /// Some stage is executing.
    Running,
    /// Published and finalized.
    Succeeded,
    /// A stage failed or the deadline passed.
    Failed,
    /// Cancelled on request.
    Cancelled,
}

impl DeploymentStatus {
    /// Get the status name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Check whether no further stage can execute.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DeploymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("unknown deployment status: {s}")),
        }
    }
}

/// Tagged outcome of one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "value", rename_all = "snake_case")]
pub enum StepResult<T> {
    /// Stage produced its payload.
    Succeeded(T),
    /// Stage failed.
    Failed(StageFailure),
}

impl<T> StepResult<T> {
    /// Check whether the step succeeded.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded(_))
    }

    /// Get the failure, if any.
    #[must_use]
    pub const fn failure(&self) -> Option<&StageFailure> {
        match self {
            Self::Succeeded(_) => None,
            Self::Failed(f) => Some(f),
        }
    }
}

impl<T> From<Result<T, StageFailure>> for StepResult<T> {
    fn from(result: Result<T, StageFailure>) -> Self {
        match result {
            Ok(value) => Self::Succeeded(value),
            Err(failure) => Self::Failed(failure),
        }
    }
}

/// Payload of a successful stage, as stored in the record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepOutput {
    /// Resolved infrastructure parameters.
    Validated(DeploymentConfig),
    /// Allocated sandbox.
    Provisioned(SandboxHandle),
    /// Transfer statistics.
    Synced(SyncStats),
    /// Build artifact reference.
    Built(BuildArtifact),
    /// Public identity of the published revision.
    Published(PublishIdentity),
    /// Cleanup summary.
    Finalized(FinalizeReport),
}

/// One stage execution in a deployment's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepEntry {
    /// Stage that ran.
    pub stage: Stage,
    /// Attempts made, including the final one.
    pub attempts: u32,
    /// When the first attempt started.
    pub started_at: DateTime<Utc>,
    /// When the stage completed.
    pub finished_at: DateTime<Utc>,
    /// What the stage produced.
    pub result: StepResult<StepOutput>,
}

/// The cause recorded for a failed or cancelled deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureCause {
    /// Stage that was executing.
    pub stage: Stage,
    /// Error kind.
    pub kind: ErrorKind,
    /// Attempts made at that stage.
    pub attempts: u32,
    /// Underlying message.
    pub message: String,
}

impl From<&StageFailure> for FailureCause {
    fn from(failure: &StageFailure) -> Self {
        Self {
            stage: failure.stage,
            kind: failure.kind,
            attempts: failure.attempts,
            message: failure.message.clone(),
        }
    }
}

/// Persisted aggregate for a deployment run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    /// Immutable input.
    pub context: DeploymentContext,
    /// Current state machine position.
    pub state: PipelineState,
    /// Overall status.
    pub status: DeploymentStatus,
    /// Stage history in execution order.
    pub steps: Vec<StepEntry>,
    /// Cause of failure or cancellation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureCause>,
    /// Errors raised while releasing resources.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cleanup_errors: Vec<String>,
    /// Whether a quota slot is currently held by this run.
    pub quota_held: bool,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
    /// When the record was last updated.
    pub updated_at: DateTime<Utc>,
    /// When the record reached a terminal state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl DeploymentRecord {
    /// Create a new record in the pending state.
    #[must_use]
    pub fn new(context: DeploymentContext) -> Self {
        let now = Utc::now();
        Self {
            context,
            state: PipelineState::Pending,
            status: DeploymentStatus::Pending,
            steps: Vec::new(),
            failure: None,
            cleanup_errors: Vec::new(),
            quota_held: false,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    /// The deployment id.
    #[must_use]
    pub const fn id(&self) -> &DeploymentId {
        &self.context.deployment_id
    }

    /// Check whether the record is terminal.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Get the entry for a stage, if it ran.
    #[must_use]
    pub fn step(&self, stage: Stage) -> Option<&StepEntry> {
        self.steps.iter().find(|s| s.stage == stage)
    }

    /// Stages in the order they were recorded.
    #[must_use]
    pub fn stage_order(&self) -> Vec<Stage> {
        self.steps.iter().map(|s| s.stage).collect()
    }

    /// Published identity, if the deployment reached publish successfully.
    #[must_use]
    pub fn published(&self) -> Option<&PublishIdentity> {
        self.steps.iter().find_map(|s| match &s.result {
            StepResult::Succeeded(StepOutput::Published(identity)) => Some(identity),
            _ => None,
        })
    }
}
