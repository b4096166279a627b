//! Deployment storage backends.
//!
//! This module provides traits and implementations for persisting deployment
//! records and their state transition history. The primary implementation
//! uses PostgreSQL, but an in-memory implementation is provided for testing.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::{PostgresQuotaStore, PostgresStore};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PipelineResult;
use crate::state::PipelineState;
use crate::types::{DeploymentId, DeploymentRecord, DeploymentStatus, OrgId, ProjectId};

/// Filter criteria for listing deployments.
#[derive(Debug, Clone, Default)]
pub struct DeploymentFilter {
    /// Filter by organization ID.
    pub org_id: Option<OrgId>,
    /// Filter by project ID.
    pub project_id: Option<ProjectId>,
    /// Filter by environment name.
    pub environment: Option<String>,
    /// Filter by status.
    pub status: Option<DeploymentStatus>,
    /// Only records that have not reached a terminal status.
    pub unfinished: bool,
    /// Maximum number of results.
    pub limit: Option<u32>,
    /// Offset for pagination.
    pub offset: Option<u32>,
}

impl DeploymentFilter {
    /// Create a new empty filter.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            org_id: None,
            project_id: None,
            environment: None,
            status: None,
            unfinished: false,
            limit: None,
            offset: None,
        }
    }

    /// Filter by organization.
    #[must_use]
    pub fn with_org(mut self, org_id: OrgId) -> Self {
        self.org_id = Some(org_id);
        self
    }

    /// Filter by project ID.
    #[must_use]
    pub fn with_project(mut self, project_id: ProjectId) -> Self {
        self.project_id = Some(project_id);
        self
    }

    /// Filter by environment.
    #[must_use]
    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }

    /// Filter by status.
    #[must_use]
    pub const fn with_status(mut self, status: DeploymentStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Only records still pending or running.
    #[must_use]
    pub const fn unfinished(mut self) -> Self {
        self.unfinished = true;
        self
    }

    /// Set maximum results.
    #[must_use]
    pub const fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Set pagination offset.
    #[must_use]
    pub const fn with_offset(mut self, offset: u32) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Check whether a record matches the filter, ignoring pagination.
    #[must_use]
    pub fn matches(&self, record: &DeploymentRecord) -> bool {
        let ctx = &record.context;
        self.org_id.as_ref().map_or(true, |o| &ctx.org_id == o)
            && self.project_id.as_ref().map_or(true, |p| &ctx.project_id == p)
            && self.environment.as_ref().map_or(true, |e| &ctx.environment == e)
            && self.status.map_or(true, |s| record.status == s)
            && (!self.unfinished || !record.is_terminal())
    }
}

/// One persisted state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    /// Deployment that moved.
    pub deployment_id: DeploymentId,
    /// Previous state. `None` for the initial insert.
    pub from: Option<PipelineState>,
    /// New state.
    pub to: PipelineState,
    /// When the change was persisted.
    pub at: DateTime<Utc>,
}

/// Backend for storing deployment records.
///
/// Implementations must ensure that all operations are atomic and durable.
/// Every `insert` and every `save` that changes the state appends a
/// [`StateTransition`]; history is never rewritten.
#[async_trait]
pub trait DeploymentStore: Send + Sync {
    /// Insert a new deployment record.
    ///
    /// Returns an error if a deployment with the same ID already exists.
    async fn insert(&self, record: &DeploymentRecord) -> PipelineResult<()>;

    /// Replace a stored record with `record`.
    ///
    /// Fails with [`crate::PipelineError::DeploymentNotFound`] if the record
    /// does not exist and with [`crate::PipelineError::DeploymentFinished`]
    /// if the stored copy is already terminal.
    async fn save(&self, record: &DeploymentRecord) -> PipelineResult<()>;

    /// Get a deployment by ID.
    ///
    /// Returns `None` if the deployment does not exist.
    async fn get(&self, id: &DeploymentId) -> PipelineResult<Option<DeploymentRecord>>;

    /// List deployments matching the filter criteria.
    ///
    /// Results are ordered by `created_at` descending (newest first).
    async fn list(&self, filter: &DeploymentFilter) -> PipelineResult<Vec<DeploymentRecord>>;

    /// State history of a deployment, oldest first.
    async fn transitions(&self, id: &DeploymentId) -> PipelineResult<Vec<StateTransition>>;

    /// Delete a deployment record and its history.
    ///
    /// This is primarily for testing and cleanup. In production, deployments
    /// should typically be kept for audit purposes.
    async fn delete(&self, id: &DeploymentId) -> PipelineResult<()>;
}
