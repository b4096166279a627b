//! Deployment pipeline state machine.
//!
//! ```text
//! Pending ─▶ Validating ─▶ Provisioning ─▶ Syncing ─▶ Building ─▶ Publishing ─▶ Finalizing
//!               │               │             │           │            │            │
//!               └───────────────┴─────────────┴───────────┴────────────┴──▶ Finalizing
//!                                                                                   │
//!                                                          Succeeded ◀──┬───────────┘
//!                                                          Failed    ◀──┤
//!                                                          Cancelled ◀──┘
//! ```
//!
//! The forward path may not skip a stage. Any running state may jump to
//! `Finalizing` (failure, cancellation, deadline). Only `Finalizing` reaches a
//! terminal state, and terminal states have no outgoing transitions.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PipelineResult};
use crate::types::{DeploymentStatus, Stage};

/// Position of a deployment in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    /// Record created, waiting to start.
    Pending,
    /// Running the validate stage.
    Validating,
    /// Running the provision stage.
    Provisioning,
    /// Running the sync stage.
    Syncing,
    /// Running the build stage.
    Building,
    /// Running the publish stage.
    Publishing,
    /// Releasing resources.
    Finalizing,
    /// Completed successfully.
    Succeeded,
    /// Completed with a failure.
    Failed,
    /// Completed after cancellation.
    Cancelled,
}

impl PipelineState {
    /// Get the state name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Validating => "validating",
            Self::Provisioning => "provisioning",
            Self::Syncing => "syncing",
            Self::Building => "building",
            Self::Publishing => "publishing",
            Self::Finalizing => "finalizing",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Check if the state is terminal (cannot transition further).
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// The stage executing in this state, if any.
    #[must_use]
    pub const fn stage(&self) -> Option<Stage> {
        match self {
            Self::Validating => Some(Stage::Validate),
            Self::Provisioning => Some(Stage::Provision),
            Self::Syncing => Some(Stage::Sync),
            Self::Building => Some(Stage::Build),
            Self::Publishing => Some(Stage::Publish),
            Self::Finalizing => Some(Stage::Finalize),
            Self::Pending | Self::Succeeded | Self::Failed | Self::Cancelled => None,
        }
    }

    /// The next state on the success path.
    #[must_use]
    pub const fn next(&self) -> Option<Self> {
        match self {
            Self::Pending => Some(Self::Validating),
            Self::Validating => Some(Self::Provisioning),
            Self::Provisioning => Some(Self::Syncing),
            Self::Syncing => Some(Self::Building),
            Self::Building => Some(Self::Publishing),
            Self::Publishing => Some(Self::Finalizing),
            Self::Finalizing => Some(Self::Succeeded),
            Self::Succeeded | Self::Failed | Self::Cancelled => None,
        }
    }

    /// Overall status corresponding to this state.
    #[must_use]
    pub const fn status(&self) -> DeploymentStatus {
        match self {
            Self::Pending => DeploymentStatus::Pending,
            Self::Succeeded => DeploymentStatus::Succeeded,
            Self::Failed => DeploymentStatus::Failed,
            Self::Cancelled => DeploymentStatus::Cancelled,
            _ => DeploymentStatus::Running,
        }
    }

    /// Check whether moving from `self` to `to` is allowed.
    #[must_use]
    pub const fn can_advance_to(&self, to: Self) -> bool {
        match (*self, to) {
            (Self::Finalizing, Self::Succeeded | Self::Failed | Self::Cancelled) => true,
            (
                Self::Validating
                | Self::Provisioning
                | Self::Syncing
                | Self::Building
                | Self::Publishing,
                Self::Finalizing,
            ) => true,
            // Admission can be revoked before validation starts.
            (Self::Pending, Self::Finalizing) => true,
            (Self::Pending, Self::Validating)
            | (Self::Validating, Self::Provisioning)
            | (Self::Provisioning, Self::Syncing)
            | (Self::Syncing, Self::Building)
            | (Self::Building, Self::Publishing) => true,
            _ => false,
        }
    }

    /// Validate a transition, returning an error if it is not allowed.
    pub fn check_transition(&self, to: Self) -> PipelineResult<()> {
        if self.can_advance_to(to) {
            Ok(())
        } else {
            Err(PipelineError::InvalidStateTransition {
                from: self.as_str(),
                to: to.as_str(),
            })
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PipelineState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "validating" => Ok(Self::Validating),
            "provisioning" => Ok(Self::Provisioning),
            "syncing" => Ok(Self::Syncing),
            "building" => Ok(Self::Building),
            "publishing" => Ok(Self::Publishing),
            "finalizing" => Ok(Self::Finalizing),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("unknown pipeline state: {s}")),
        }
    }
}
