//! Single writer for a run's deployment record.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;

use crate::error::{PipelineError, PipelineResult};
use crate::state::PipelineState;
use crate::store::DeploymentStore;
use crate::types::{DeploymentRecord, FailureCause, StepEntry};

/// Owns the record of one run.
///
/// Every mutation is checked against the state machine, persisted, then
/// published on the run's status feed. Nothing else writes the record while
/// the run is alive.
pub(crate) struct RecordWriter {
    record: DeploymentRecord,
    store: Arc<dyn DeploymentStore>,
    feed: watch::Sender<DeploymentRecord>,
}

impl RecordWriter {
    pub(crate) fn new(
        record: DeploymentRecord,
        store: Arc<dyn DeploymentStore>,
        feed: watch::Sender<DeploymentRecord>,
    ) -> Self {
        Self {
            record,
            store,
            feed,
        }
    }

    pub(crate) const fn record(&self) -> &DeploymentRecord {
        &self.record
    }

    /// Move to `to` and persist.
    pub(crate) async fn advance(&mut self, to: PipelineState) -> PipelineResult<()> {
        self.ensure_open()?;
        self.record.state.check_transition(to)?;

        let now = Utc::now();
        self.record.state = to;
        self.record.status = to.status();
        self.record.updated_at = now;
        if to.is_terminal() {
            self.record.finished_at = Some(now);
        }
        self.persist().await
    }

    /// Append a stage entry and persist.
    pub(crate) async fn append_step(&mut self, entry: StepEntry) -> PipelineResult<()> {
        self.ensure_open()?;
        self.record.steps.push(entry);
        self.record.updated_at = Utc::now();
        self.persist().await
    }

    /// Append the finalize entry together with whether the quota slot is
    /// still held, so a crash after this point sees the cleanup done.
    pub(crate) async fn append_finalize(
        &mut self,
        entry: StepEntry,
        quota_held: bool,
    ) -> PipelineResult<()> {
        self.ensure_open()?;
        self.record.steps.push(entry);
        self.record.quota_held = quota_held;
        self.record.updated_at = Utc::now();
        self.persist().await
    }

    /// Record the outcome and move to the terminal state `to`.
    pub(crate) async fn finish(
        &mut self,
        to: PipelineState,
        failure: Option<FailureCause>,
        cleanup_errors: Vec<String>,
        quota_held: bool,
    ) -> PipelineResult<()> {
        self.ensure_open()?;
        if !to.is_terminal() {
            return Err(PipelineError::InvalidStateTransition {
                from: self.record.state.as_str(),
                to: to.as_str(),
            });
        }
        self.record.failure = failure;
        self.record.cleanup_errors = cleanup_errors;
        self.record.quota_held = quota_held;
        self.advance(to).await
    }

    fn ensure_open(&self) -> PipelineResult<()> {
        if self.record.is_terminal() {
            return Err(PipelineError::DeploymentFinished(self.record.id().to_string()));
        }
        Ok(())
    }

    // The feed always carries the in-memory copy, even when the save failed.
    async fn persist(&self) -> PipelineResult<()> {
        let saved = self.store.save(&self.record).await;
        self.feed.send_replace(self.record.clone());
        saved
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::error::ErrorKind;
    use crate::store::MemoryStore;
    use crate::types::{
        DeploymentContext, DeploymentStatus, OrgId, ProjectId, SourceRef, Stage, StepOutput,
        StepResult, UserId,
    };

    async fn writer() -> (RecordWriter, Arc<MemoryStore>, watch::Receiver<DeploymentRecord>) {
        let record = DeploymentRecord::new(DeploymentContext::new(
            ProjectId::new("p1"),
            OrgId::new("o1"),
            UserId::new("u1"),
            "production",
            SourceRef::Upload {
                handle: "up-1".to_owned(),
                path: PathBuf::from("/tmp/up-1"),
            },
        ));
        let store = Arc::new(MemoryStore::new());
        store.insert(&record).await.unwrap();
        let (tx, rx) = watch::channel(record.clone());
        (RecordWriter::new(record, store.clone(), tx), store, rx)
    }

    #[tokio::test]
    async fn advance_persists_and_publishes() {
        let (mut writer, store, rx) = writer().await;
        writer.advance(PipelineState::Validating).await.unwrap();

        let stored = store.get(writer.record().id()).await.unwrap().unwrap();
        assert_eq!(stored.state, PipelineState::Validating);
        assert_eq!(stored.status, DeploymentStatus::Running);
        assert_eq!(rx.borrow().state, PipelineState::Validating);
    }

    #[tokio::test]
    async fn skipping_a_stage_is_refused() {
        let (mut writer, _, _) = writer().await;
        let result = writer.advance(PipelineState::Building).await;
        assert!(matches!(
            result,
            Err(PipelineError::InvalidStateTransition { .. })
        ));
        assert_eq!(writer.record().state, PipelineState::Pending);
    }

    #[tokio::test]
    async fn finalize_entry_and_quota_flag_persist_together() {
        let (mut writer, store, _) = writer().await;
        writer.advance(PipelineState::Finalizing).await.unwrap();
        let now = Utc::now();
        writer
            .append_finalize(
                StepEntry {
                    stage: Stage::Finalize,
                    attempts: 1,
                    started_at: now,
                    finished_at: now,
                    result: StepResult::Succeeded(StepOutput::Finalized(Default::default())),
                },
                false,
            )
            .await
            .unwrap();

        let stored = store.get(writer.record().id()).await.unwrap().unwrap();
        assert!(!stored.quota_held);
        assert!(stored.step(Stage::Finalize).is_some());
        assert_eq!(stored.state, PipelineState::Finalizing);
    }

    #[tokio::test]
    async fn finished_record_rejects_changes() {
        let (mut writer, store, rx) = writer().await;
        writer.advance(PipelineState::Finalizing).await.unwrap();
        writer
            .finish(
                PipelineState::Cancelled,
                Some(FailureCause {
                    stage: Stage::Validate,
                    kind: ErrorKind::Cancelled,
                    attempts: 0,
                    message: "cancelled".to_owned(),
                }),
                Vec::new(),
                false,
            )
            .await
            .unwrap();

        assert!(rx.borrow().is_terminal());
        assert!(rx.borrow().finished_at.is_some());

        let now = Utc::now();
        let late = writer
            .append_step(StepEntry {
                stage: Stage::Finalize,
                attempts: 1,
                started_at: now,
                finished_at: now,
                result: StepResult::Succeeded(StepOutput::Finalized(Default::default())),
            })
            .await;
        assert!(matches!(late, Err(PipelineError::DeploymentFinished(_))));

        let history = store.transitions(writer.record().id()).await.unwrap();
        assert_eq!(history.len(), 3);
    }
}
