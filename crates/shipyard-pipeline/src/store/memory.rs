//! In-memory deployment store for testing.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::{PipelineError, PipelineResult};
use crate::types::{DeploymentId, DeploymentRecord};

use super::{DeploymentFilter, DeploymentStore, StateTransition};

/// In-memory deployment store for testing.
///
/// This implementation is not suitable for production use as data is lost
/// when the process exits.
#[derive(Debug, Default)]
pub struct MemoryStore {
    deployments: RwLock<HashMap<String, DeploymentRecord>>,
    history: RwLock<HashMap<String, Vec<StateTransition>>>,
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn record_transition(&self, transition: StateTransition) -> PipelineResult<()> {
        let mut history = self
            .history
            .write()
            .map_err(|_| PipelineError::internal("lock poisoned"))?;
        history
            .entry(transition.deployment_id.as_str().to_owned())
            .or_default()
            .push(transition);
        Ok(())
    }
}

#[async_trait]
impl DeploymentStore for MemoryStore {
    async fn insert(&self, record: &DeploymentRecord) -> PipelineResult<()> {
        {
            let mut deployments = self
                .deployments
                .write()
                .map_err(|_| PipelineError::internal("lock poisoned"))?;

            let key = record.id().as_str().to_owned();
            if deployments.contains_key(&key) {
                return Err(PipelineError::internal(format!(
                    "deployment {key} already exists"
                )));
            }
            deployments.insert(key, record.clone());
        }

        self.record_transition(StateTransition {
            deployment_id: record.id().clone(),
            from: None,
            to: record.state,
            at: Utc::now(),
        })
    }

    async fn save(&self, record: &DeploymentRecord) -> PipelineResult<()> {
        let previous = {
            let mut deployments = self
                .deployments
                .write()
                .map_err(|_| PipelineError::internal("lock poisoned"))?;

            let stored = deployments
                .get_mut(record.id().as_str())
                .ok_or_else(|| PipelineError::DeploymentNotFound(record.id().to_string()))?;
            if stored.is_terminal() {
                return Err(PipelineError::DeploymentFinished(record.id().to_string()));
            }

            let previous = stored.state;
            *stored = record.clone();
            previous
        };

        if previous != record.state {
            self.record_transition(StateTransition {
                deployment_id: record.id().clone(),
                from: Some(previous),
                to: record.state,
                at: Utc::now(),
            })?;
        }
        Ok(())
    }

    async fn get(&self, id: &DeploymentId) -> PipelineResult<Option<DeploymentRecord>> {
        let deployments = self
            .deployments
            .read()
            .map_err(|_| PipelineError::internal("lock poisoned"))?;

        Ok(deployments.get(id.as_str()).cloned())
    }

    async fn list(&self, filter: &DeploymentFilter) -> PipelineResult<Vec<DeploymentRecord>> {
        let deployments = self
            .deployments
            .read()
            .map_err(|_| PipelineError::internal("lock poisoned"))?;

        let mut results: Vec<_> = deployments
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();

        results.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        #[allow(clippy::as_conversions)]
        let offset = filter.offset.unwrap_or(0) as usize;
        let results = results.into_iter().skip(offset);

        if let Some(limit) = filter.limit {
            #[allow(clippy::as_conversions)]
            Ok(results.take(limit as usize).collect())
        } else {
            Ok(results.collect())
        }
    }

    async fn transitions(&self, id: &DeploymentId) -> PipelineResult<Vec<StateTransition>> {
        let history = self
            .history
            .read()
            .map_err(|_| PipelineError::internal("lock poisoned"))?;

        Ok(history.get(id.as_str()).cloned().unwrap_or_default())
    }

    async fn delete(&self, id: &DeploymentId) -> PipelineResult<()> {
        let mut deployments = self
            .deployments
            .write()
            .map_err(|_| PipelineError::internal("lock poisoned"))?;

        if deployments.remove(id.as_str()).is_none() {
            return Err(PipelineError::DeploymentNotFound(id.to_string()));
        }
        drop(deployments);

        let mut history = self
            .history
            .write()
            .map_err(|_| PipelineError::internal("lock poisoned"))?;
        history.remove(id.as_str());

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::state::PipelineState;
    use crate::types::{
        DeploymentContext, DeploymentStatus, OrgId, ProjectId, SourceRef, UserId,
    };

    fn test_deployment(org: &str, environment: &str) -> DeploymentRecord {
        DeploymentRecord::new(DeploymentContext::new(
            ProjectId::new("test-project"),
            OrgId::new(org),
            UserId::new("u1"),
            environment,
            SourceRef::Git {
                branch: "main".to_owned(),
                commit: "abc123def456".to_owned(),
                checkout: PathBuf::from("/srv/checkouts/test-project"),
            },
        ))
    }

    #[tokio::test]
    async fn insert_and_get() {
        let store = MemoryStore::new();

        let record = test_deployment("o1", "production");
        let id = record.id().clone();

        store.insert(&record).await.expect("insert failed");

        let retrieved = store
            .get(&id)
            .await
            .expect("get failed")
            .expect("deployment not found");

        assert_eq!(retrieved.id(), &id);
        assert_eq!(retrieved.context.project_id.as_str(), "test-project");
        assert_eq!(retrieved.state, PipelineState::Pending);
    }

    #[tokio::test]
    async fn duplicate_insert_fails() {
        let store = MemoryStore::new();

        let record = test_deployment("o1", "production");

        store.insert(&record).await.expect("first insert failed");
        assert!(store.insert(&record).await.is_err());
    }

    #[tokio::test]
    async fn save_appends_transitions() {
        let store = MemoryStore::new();
        let mut record = test_deployment("o1", "production");
        let id = record.id().clone();
        store.insert(&record).await.expect("insert failed");

        record.state = PipelineState::Validating;
        record.status = DeploymentStatus::Running;
        store.save(&record).await.expect("save failed");
        // Same state again: no new transition.
        store.save(&record).await.expect("save failed");

        record.state = PipelineState::Finalizing;
        store.save(&record).await.expect("save failed");

        let history = store.transitions(&id).await.expect("transitions failed");
        let path: Vec<_> = history.iter().map(|t| (t.from, t.to)).collect();
        assert_eq!(
            path,
            vec![
                (None, PipelineState::Pending),
                (Some(PipelineState::Pending), PipelineState::Validating),
                (Some(PipelineState::Validating), PipelineState::Finalizing),
            ]
        );
    }

    #[tokio::test]
    async fn terminal_records_are_immutable() {
        let store = MemoryStore::new();
        let mut record = test_deployment("o1", "production");
        store.insert(&record).await.expect("insert failed");

        record.state = PipelineState::Failed;
        record.status = DeploymentStatus::Failed;
        store.save(&record).await.expect("save failed");

        record.cleanup_errors.push("late".to_owned());
        let result = store.save(&record).await;
        assert!(matches!(result, Err(PipelineError::DeploymentFinished(_))));
    }

    #[tokio::test]
    async fn save_nonexistent_fails() {
        let store = MemoryStore::new();
        let result = store.save(&test_deployment("o1", "production")).await;
        assert!(matches!(result, Err(PipelineError::DeploymentNotFound(_))));
    }

    #[tokio::test]
    async fn list_with_filters() {
        let store = MemoryStore::new();

        let staging = test_deployment("o1", "staging");
        let staging_id = staging.id().clone();
        let mut finished = test_deployment("o2", "production");
        finished.status = DeploymentStatus::Succeeded;
        finished.state = PipelineState::Succeeded;

        store.insert(&staging).await.expect("insert failed");
        store.insert(&finished).await.expect("insert failed");

        let all = store
            .list(&DeploymentFilter::new().with_project(ProjectId::new("test-project")))
            .await
            .expect("list failed");
        assert_eq!(all.len(), 2);

        let by_env = store
            .list(&DeploymentFilter::new().with_environment("staging"))
            .await
            .expect("list failed");
        assert_eq!(by_env.len(), 1);
        assert_eq!(by_env[0].id(), &staging_id);

        let by_org = store
            .list(&DeploymentFilter::new().with_org(OrgId::new("o2")))
            .await
            .expect("list failed");
        assert_eq!(by_org.len(), 1);

        let unfinished = store
            .list(&DeploymentFilter::new().unfinished())
            .await
            .expect("list failed");
        assert_eq!(unfinished.len(), 1);
        assert_eq!(unfinished[0].id(), &staging_id);
    }

    #[tokio::test]
    async fn list_pagination() {
        let store = MemoryStore::new();

        for i in 0..5 {
            let record = test_deployment("o1", &format!("env-{i}"));
            store.insert(&record).await.expect("insert failed");
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let page1 = store
            .list(&DeploymentFilter::new().with_limit(2))
            .await
            .expect("list failed");
        assert_eq!(page1.len(), 2);
        assert_eq!(page1[0].context.environment, "env-4");

        let page3 = store
            .list(&DeploymentFilter::new().with_limit(2).with_offset(4))
            .await
            .expect("list failed");
        assert_eq!(page3.len(), 1);
        assert_eq!(page3[0].context.environment, "env-0");
    }

    #[tokio::test]
    async fn delete_removes_history() {
        let store = MemoryStore::new();
        let record = test_deployment("o1", "production");
        let id = record.id().clone();
        store.insert(&record).await.expect("insert failed");

        store.delete(&id).await.expect("delete failed");
        assert!(store.get(&id).await.expect("get failed").is_none());
        assert!(store.transitions(&id).await.expect("transitions failed").is_empty());
        assert!(store.delete(&id).await.is_err());
    }
}
