//! Error types for shipyard-pipeline.
//!
//! Two layers exist. [`PipelineError`] is returned by the public API
//! (admission, lookups, persistence). [`StageFailure`] is the typed failure a
//! single stage produces; it is recorded in the deployment record rather than
//! returned to the caller.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{OrgId, Stage};

/// Result type alias using [`PipelineError`].
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Errors returned by the pipeline's public surface.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The organization already has the maximum number of deployments in flight.
    #[error("quota exceeded for organization {org}: {limit} deployments already in flight")]
    QuotaExceeded {
        /// Organization that was rejected.
        org: OrgId,
        /// Configured maximum.
        limit: u32,
    },

    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Deployment not found.
    #[error("deployment not found: {0}")]
    DeploymentNotFound(String),

    /// Deployment already reached a terminal state.
    #[error("deployment already finished: {0}")]
    DeploymentFinished(String),

    /// Deployment is unfinished but has no live run in this process.
    #[error("deployment is not running here: {0}")]
    NotRunning(String),

    /// Invalid state transition attempted.
    #[error("invalid state transition: cannot transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current state.
        from: &'static str,
        /// Attempted target state.
        to: &'static str,
    },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialisation error.
    #[error("serialisation error: {0}")]
    Serialisation(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Create an internal error.
    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a serialisation error.
    #[must_use]
    pub fn serialisation(msg: impl Into<String>) -> Self {
        Self::Serialisation(msg.into())
    }
}

impl From<figment::Error> for PipelineError {
    fn from(e: figment::Error) -> Self {
        Self::Config(e.to_string())
    }
}

/// Stage-scoped error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Admission rejected by the organization quota.
    QuotaExceeded,
    /// Permission or environment checks failed.
    ValidationError,
    /// Sandbox could not be allocated.
    ProvisionError,
    /// Source tree could not be read or transferred.
    SyncError,
    /// Build exited non-zero or could not run.
    BuildError,
    /// Artifact could not be published.
    PublishError,
    /// A stage call or the whole pipeline ran past its deadline.
    TimeoutError,
    /// Releasing resources failed during finalize.
    CleanupError,
    /// The run was cancelled on request.
    Cancelled,
    /// The run was found unfinished after a restart.
    Interrupted,
}

impl ErrorKind {
    /// Get the kind name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::QuotaExceeded => "quota_exceeded",
            Self::ValidationError => "validation_error",
            Self::ProvisionError => "provision_error",
            Self::SyncError => "sync_error",
            Self::BuildError => "build_error",
            Self::PublishError => "publish_error",
            Self::TimeoutError => "timeout_error",
            Self::CleanupError => "cleanup_error",
            Self::Cancelled => "cancelled",
            Self::Interrupted => "interrupted",
        }
    }

    /// The kind a failure of the given stage is reported under.
    #[must_use]
    pub const fn for_stage(stage: Stage) -> Self {
        match stage {
            Stage::Validate => Self::ValidationError,
            Stage::Provision => Self::ProvisionError,
            Stage::Sync => Self::SyncError,
            Stage::Build => Self::BuildError,
            Stage::Publish => Self::PublishError,
            Stage::Finalize => Self::CleanupError,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of a collaborator fault, used to decide retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultClass {
    /// Connection reset, DNS failure, interrupted transfer.
    Network,
    /// Infrastructure capacity or rate limit reached.
    Capacity,
    /// The call did not complete within its timeout.
    Timeout,
    /// Credentials or permissions were refused.
    Auth,
    /// The referenced resource does not exist.
    NotFound,
    /// The request itself is invalid; repeating it cannot succeed.
    Rejected,
}

impl FaultClass {
    /// Whether a failure of this class is worth another attempt.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Network | Self::Capacity | Self::Timeout)
    }

    /// Get the class name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Capacity => "capacity",
            Self::Timeout => "timeout",
            Self::Auth => "auth",
            Self::NotFound => "not_found",
            Self::Rejected => "rejected",
        }
    }
}

impl fmt::Display for FaultClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error reported by an external collaborator (provider, runner, store).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{class} fault: {message}")]
pub struct ProviderError {
    /// Fault classification.
    pub class: FaultClass,
    /// Human readable detail.
    pub message: String,
}

impl ProviderError {
    /// Create a provider error of the given class.
    #[must_use]
    pub fn new(class: FaultClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }

    /// Network fault.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(FaultClass::Network, message)
    }

    /// Capacity fault.
    #[must_use]
    pub fn capacity(message: impl Into<String>) -> Self {
        Self::new(FaultClass::Capacity, message)
    }

    /// Authentication or permission fault.
    #[must_use]
    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(FaultClass::Auth, message)
    }

    /// Missing resource.
    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(FaultClass::NotFound, message)
    }

    /// Permanently invalid request.
    #[must_use]
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(FaultClass::Rejected, message)
    }

    /// Whether the fault is transient.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        self.class.is_transient()
    }
}

/// A typed failure produced by one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{stage} failed ({kind}, {class}) after {attempts} attempt(s): {message}")]
pub struct StageFailure {
    /// Stage that raised the failure.
    pub stage: Stage,
    /// Error kind.
    pub kind: ErrorKind,
    /// Fault class of the underlying cause.
    pub class: FaultClass,
    /// Number of attempts made when the failure became final.
    pub attempts: u32,
    /// Underlying cause.
    pub message: String,
}

impl StageFailure {
    /// Build a failure for `stage` from a collaborator error.
    #[must_use]
    pub fn from_provider(stage: Stage, error: &ProviderError) -> Self {
        let kind = if error.class == FaultClass::Timeout {
            Self::timeout_kind(stage)
        } else {
            ErrorKind::for_stage(stage)
        };
        Self {
            stage,
            kind,
            class: error.class,
            attempts: 0,
            message: error.message.clone(),
        }
    }

    /// Build a failure with an explicit kind and class.
    #[must_use]
    pub fn new(stage: Stage, kind: ErrorKind, class: FaultClass, message: impl Into<String>) -> Self {
        Self {
            stage,
            kind,
            class,
            attempts: 0,
            message: message.into(),
        }
    }

    /// A stage call that exceeded its own timeout.
    #[must_use]
    pub fn timed_out(stage: Stage, limit: std::time::Duration) -> Self {
        Self::new(
            stage,
            Self::timeout_kind(stage),
            FaultClass::Timeout,
            format!("call exceeded {limit:?}"),
        )
    }

    // A build that times out is still a build failure.
    const fn timeout_kind(stage: Stage) -> ErrorKind {
        match stage {
            Stage::Build => ErrorKind::BuildError,
            _ => ErrorKind::TimeoutError,
        }
    }

    /// Set the attempt count.
    #[must_use]
    pub const fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Whether the orchestrator may try the stage again.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self.kind {
            ErrorKind::BuildError | ErrorKind::QuotaExceeded => false,
            _ => self.class.is_transient(),
        }
    }
}
