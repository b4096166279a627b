//! Shipyard deployment pipeline
//!
//! This crate is the orchestration core behind a Shipyard deployment. It takes
//! an admitted request through a fixed sequence of stages and keeps a
//! persisted, attributable record of every step.
//!
//! # Architecture
//!
//! - **Admission**: [`QuotaGuard`] caps in-flight deployments per organization
//!   with a single atomic check-and-increment
//! - **Stages**: validate, provision, sync, build, publish and finalize, each
//!   talking to one collaborator trait
//! - **Orchestration**: [`Orchestrator`] runs stages in order with per-stage
//!   retries, a global deadline and cancellation
//! - **Persistence**: [`DeploymentStore`] keeps the record and its transition
//!   history, in memory or in PostgreSQL
//!
//! # State Machine
//!
//! ```text
//! Pending ─▶ Validating ─▶ Provisioning ─▶ Syncing ─▶ Building ─▶ Publishing
//!                                                                    │
//!        any running state ──────────────────────────────▶ Finalizing ◀┘
//!                                                              │
//!                                      Succeeded / Failed / Cancelled
//! ```
//!
//! Transitions are checked at runtime by [`PipelineState::can_advance_to`] and
//! every one is persisted before the next stage starts.

#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]

pub mod config;
pub mod deployment;
pub mod error;
pub mod provisioner;
pub mod quota;
pub mod retry;
pub mod stage;
pub mod state;
pub mod store;
pub mod types;

// Re-export commonly used types at the crate root
pub use config::PipelineSettings;
pub use deployment::{Collaborators, Orchestrator, PipelineOptions};
pub use error::{ErrorKind, FaultClass, PipelineError, PipelineResult, ProviderError, StageFailure};
pub use provisioner::{SandboxHandle, SandboxProvider, SandboxSpec};
pub use quota::{MemoryQuotaStore, QuotaGuard, QuotaPermit, QuotaStore};
pub use retry::{RetryPolicy, StagePolicies};
pub use state::PipelineState;
pub use store::{DeploymentFilter, DeploymentStore, MemoryStore, PostgresStore, StateTransition};
pub use types::{
    DeploymentConfig, DeploymentContext, DeploymentId, DeploymentRecord, DeploymentStatus,
    FailureCause, OrgId, ProjectId, SourceRef, Stage, StepEntry, StepOutput, StepResult, UserId,
};
