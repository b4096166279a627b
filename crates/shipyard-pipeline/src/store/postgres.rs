//! PostgreSQL deployment and quota stores.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;

use crate::config::DatabaseConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::quota::QuotaStore;
use crate::state::PipelineState;
use crate::types::{DeploymentId, DeploymentRecord, DeploymentStatus, OrgId};

use super::{DeploymentFilter, DeploymentStore, StateTransition};

/// PostgreSQL-backed deployment store.
///
/// The full record is kept as JSONB next to the columns used for filtering.
/// State changes are appended to `deployment_transitions`.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect to PostgreSQL and create a new store.
    ///
    /// The required tables are created if they don't exist.
    pub async fn new(url: &str) -> PipelineResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;

        Self::from_pool(pool).await
    }

    /// Connect using the database configuration section.
    pub async fn connect(config: &DatabaseConfig) -> PipelineResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect(&config.url)
            .await?;

        Self::from_pool(pool).await
    }

    /// Create a store from an existing connection pool.
    pub async fn from_pool(pool: PgPool) -> PipelineResult<Self> {
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    /// A quota store sharing this store's pool.
    pub async fn quota_store(&self) -> PipelineResult<PostgresQuotaStore> {
        PostgresQuotaStore::from_pool(self.pool.clone()).await
    }

    /// Ensure the required tables exist.
    async fn ensure_schema(&self) -> PipelineResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS deployments (
                id TEXT PRIMARY KEY,
                org_id TEXT NOT NULL,
                project_id TEXT NOT NULL,
                environment TEXT NOT NULL,
                state TEXT NOT NULL,
                status TEXT NOT NULL,
                record JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS deployment_transitions (
                seq BIGSERIAL PRIMARY KEY,
                deployment_id TEXT NOT NULL REFERENCES deployments(id) ON DELETE CASCADE,
                from_state TEXT,
                to_state TEXT NOT NULL,
                at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_deployments_org_status
            ON deployments (org_id, status)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_deployments_project_env
            ON deployments (project_id, environment)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_deployments_created_at
            ON deployments (created_at DESC)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_transitions_deployment
            ON deployment_transitions (deployment_id, seq)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Parse a row into a DeploymentRecord.
    fn row_to_record(row: &sqlx::postgres::PgRow) -> PipelineResult<DeploymentRecord> {
        let record: serde_json::Value = row.get("record");
        serde_json::from_value(record).map_err(|e| {
            PipelineError::Serialisation(format!("failed to deserialise deployment record: {e}"))
        })
    }

    fn record_json(record: &DeploymentRecord) -> PipelineResult<serde_json::Value> {
        serde_json::to_value(record).map_err(|e| {
            PipelineError::Serialisation(format!("failed to serialise deployment record: {e}"))
        })
    }
}

#[async_trait]
impl DeploymentStore for PostgresStore {
    async fn insert(&self, record: &DeploymentRecord) -> PipelineResult<()> {
        let json = Self::record_json(record)?;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO deployments (
                id, org_id, project_id, environment, state, status,
                record, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(record.id().as_str())
        .bind(record.context.org_id.as_str())
        .bind(record.context.project_id.as_str())
        .bind(&record.context.environment)
        .bind(record.state.as_str())
        .bind(record.status.as_str())
        .bind(&json)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO deployment_transitions (deployment_id, from_state, to_state)
            VALUES ($1, NULL, $2)
            "#,
        )
        .bind(record.id().as_str())
        .bind(record.state.as_str())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn save(&self, record: &DeploymentRecord) -> PipelineResult<()> {
        let json = Self::record_json(record)?;
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            r#"
            SELECT state, status FROM deployments WHERE id = $1 FOR UPDATE
            "#,
        )
        .bind(record.id().as_str())
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| PipelineError::DeploymentNotFound(record.id().to_string()))?;

        let stored_state: String = row.get("state");
        let stored_status: String = row.get("status");
        let stored_status: DeploymentStatus = stored_status.parse().map_err(|e| {
            PipelineError::Serialisation(format!("failed to parse status: {e}"))
        })?;
        if stored_status.is_terminal() {
            return Err(PipelineError::DeploymentFinished(record.id().to_string()));
        }

        sqlx::query(
            r#"
            UPDATE deployments
            SET state = $1, status = $2, record = $3, updated_at = $4
            WHERE id = $5
            "#,
        )
        .bind(record.state.as_str())
        .bind(record.status.as_str())
        .bind(&json)
        .bind(record.updated_at)
        .bind(record.id().as_str())
        .execute(&mut *tx)
        .await?;

        if stored_state != record.state.as_str() {
            sqlx::query(
                r#"
                INSERT INTO deployment_transitions (deployment_id, from_state, to_state)
                VALUES ($1, $2, $3)
                "#,
            )
            .bind(record.id().as_str())
            .bind(&stored_state)
            .bind(record.state.as_str())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get(&self, id: &DeploymentId) -> PipelineResult<Option<DeploymentRecord>> {
        let row = sqlx::query(
            r#"
            SELECT record FROM deployments WHERE id = $1
            "#,
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(r) => Ok(Some(Self::row_to_record(&r)?)),
            None => Ok(None),
        }
    }

    async fn list(&self, filter: &DeploymentFilter) -> PipelineResult<Vec<DeploymentRecord>> {
        let mut query = String::from(
            r#"
            SELECT record
            FROM deployments
            WHERE 1=1
            "#,
        );

        let mut params: Vec<String> = Vec::new();

        if let Some(ref org_id) = filter.org_id {
            params.push(org_id.as_str().to_owned());
            query.push_str(&format!(" AND org_id = ${}", params.len()));
        }

        if let Some(ref project_id) = filter.project_id {
            params.push(project_id.as_str().to_owned());
            query.push_str(&format!(" AND project_id = ${}", params.len()));
        }

        if let Some(ref environment) = filter.environment {
            params.push(environment.clone());
            query.push_str(&format!(" AND environment = ${}", params.len()));
        }

        if let Some(status) = filter.status {
            params.push(status.as_str().to_owned());
            query.push_str(&format!(" AND status = ${}", params.len()));
        }

        if filter.unfinished {
            query.push_str(" AND status IN ('pending', 'running')");
        }

        query.push_str(" ORDER BY created_at DESC");

        if let Some(limit) = filter.limit {
            query.push_str(&format!(" LIMIT {limit}"));
        }

        if let Some(offset) = filter.offset {
            query.push_str(&format!(" OFFSET {offset}"));
        }

        let mut sqlx_query = sqlx::query(&query);
        for param in &params {
            sqlx_query = sqlx_query.bind(param);
        }

        let rows = sqlx_query.fetch_all(&self.pool).await?;

        rows.iter().map(Self::row_to_record).collect()
    }

    async fn transitions(&self, id: &DeploymentId) -> PipelineResult<Vec<StateTransition>> {
        let rows = sqlx::query(
            r#"
            SELECT from_state, to_state, at
            FROM deployment_transitions
            WHERE deployment_id = $1
            ORDER BY seq
            "#,
        )
        .bind(id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let from: Option<String> = row.get("from_state");
                let to: String = row.get("to_state");
                let parse = |s: &str| {
                    s.parse::<PipelineState>().map_err(|e| {
                        PipelineError::Serialisation(format!("failed to parse state '{s}': {e}"))
                    })
                };
                Ok(StateTransition {
                    deployment_id: id.clone(),
                    from: from.as_deref().map(parse).transpose()?,
                    to: parse(&to)?,
                    at: row.get("at"),
                })
            })
            .collect()
    }

    async fn delete(&self, id: &DeploymentId) -> PipelineResult<()> {
        let result = sqlx::query(
            r#"
            DELETE FROM deployments WHERE id = $1
            "#,
        )
        .bind(id.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(PipelineError::DeploymentNotFound(id.to_string()));
        }

        Ok(())
    }
}

impl std::fmt::Debug for PostgresStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresStore").finish_non_exhaustive()
    }
}

/// PostgreSQL-backed quota ledger.
///
/// Admission is a single conditional upsert, so concurrent requests from
/// several orchestrator processes cannot overshoot the limit.
#[derive(Clone)]
pub struct PostgresQuotaStore {
    pool: PgPool,
}

impl PostgresQuotaStore {
    /// Create a quota store from an existing connection pool.
    pub async fn from_pool(pool: PgPool) -> PipelineResult<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS org_quota (
                org_id TEXT PRIMARY KEY,
                in_flight INTEGER NOT NULL DEFAULT 0 CHECK (in_flight >= 0)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl QuotaStore for PostgresQuotaStore {
    async fn increment_if_below(&self, org: &OrgId, max: u32) -> PipelineResult<bool> {
        if max == 0 {
            return Ok(false);
        }
        let max = i32::try_from(max).unwrap_or(i32::MAX);

        let row = sqlx::query(
            r#"
            INSERT INTO org_quota (org_id, in_flight)
            VALUES ($1, 1)
            ON CONFLICT (org_id) DO UPDATE
            SET in_flight = org_quota.in_flight + 1
            WHERE org_quota.in_flight < $2
            RETURNING in_flight
            "#,
        )
        .bind(org.as_str())
        .bind(max)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.is_some())
    }

    async fn decrement(&self, org: &OrgId) -> PipelineResult<()> {
        sqlx::query(
            r#"
            UPDATE org_quota
            SET in_flight = GREATEST(in_flight - 1, 0)
            WHERE org_id = $1
            "#,
        )
        .bind(org.as_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn current(&self, org: &OrgId) -> PipelineResult<u32> {
        let row = sqlx::query(
            r#"
            SELECT in_flight FROM org_quota WHERE org_id = $1
            "#,
        )
        .bind(org.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row
            .map(|r| r.get::<i32, _>("in_flight"))
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(0))
    }
}

impl std::fmt::Debug for PostgresQuotaStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresQuotaStore").finish_non_exhaustive()
    }
}
