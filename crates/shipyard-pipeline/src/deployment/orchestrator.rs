//! Deployment orchestrator.
//!
//! Each admitted deployment runs as its own Tokio task. The task owns the
//! record through a [`RecordWriter`], walks the stages in order, retries
//! transient failures under the stage's [`RetryPolicy`](crate::retry::RetryPolicy),
//! and always ends in finalize. Callers observe progress through the store or
//! the run's `watch` feed.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::record::RecordWriter;
use crate::config::{PipelineSettings, StoreType};
use crate::error::{ErrorKind, FaultClass, PipelineError, PipelineResult, StageFailure};
use crate::provisioner::{DirectorySandboxProvider, SandboxHandle, SandboxProvider, SandboxSpec};
use crate::quota::{QuotaGuard, QuotaPermit, QuotaStore};
use crate::retry::StagePolicies;
use crate::stage::build::{self, BuildRunner, BuildSpec, CommandBuildRunner};
use crate::stage::finalize::{self, CleanupPlan};
use crate::stage::provision;
use crate::stage::publish::{self, PublishIdentity, PublishTarget, RegistryPublisher};
use crate::stage::sync::{self, ObjectStoreTransfer, StorageTransfer};
use crate::stage::validate::{self, DeploymentValidator, StaticValidator};
use crate::state::PipelineState;
use crate::store::{DeploymentFilter, DeploymentStore, PostgresStore};
use crate::types::{
    DeploymentContext, DeploymentId, DeploymentRecord, FailureCause, OrgId, Stage, StepEntry,
    StepOutput, StepResult,
};

/// Run-wide tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineOptions {
    /// Retry policy of every stage.
    pub policies: StagePolicies,
    /// Wall-clock budget for one run, finalize excluded.
    pub deadline: Duration,
    /// Build log lines kept in the artifact.
    pub log_tail_lines: usize,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            policies: StagePolicies::default(),
            deadline: Duration::from_secs(1800),
            log_tail_lines: 50,
        }
    }
}

impl PipelineOptions {
    /// Options taken from loaded settings.
    #[must_use]
    pub fn from_settings(settings: &PipelineSettings) -> Self {
        Self {
            policies: settings.pipeline.stages,
            deadline: settings.pipeline.deadline(),
            log_tail_lines: settings.build.log_tail_lines,
        }
    }
}

/// External capabilities the pipeline drives.
#[derive(Clone)]
pub struct Collaborators {
    /// Record persistence.
    pub store: Arc<dyn DeploymentStore>,
    /// Sandbox allocation.
    pub provider: Arc<dyn SandboxProvider>,
    /// Source upload and partial-state removal.
    pub transfer: Arc<dyn StorageTransfer>,
    /// Permission checks and config resolution.
    pub validator: Arc<dyn DeploymentValidator>,
    /// Build execution.
    pub runner: Arc<dyn BuildRunner>,
    /// Artifact publication.
    pub publisher: Arc<dyn PublishTarget>,
}

impl Collaborators {
    /// Build the shipped implementations from settings.
    ///
    /// Sandboxes are local directories, sources go to the configured object
    /// store, builds run the configured shell command and revisions are
    /// recorded in the publish registry.
    pub fn from_settings(
        settings: &PipelineSettings,
        store: Arc<dyn DeploymentStore>,
    ) -> PipelineResult<Self> {
        let sync_store = settings.storage.object_store()?;
        let registry = settings.publish.registry.object_store()?;

        let mut runner = CommandBuildRunner::from_config(&settings.build);
        if settings.storage.store_type == StoreType::Local {
            runner = runner.with_source_root(settings.storage.path.clone());
        }

        Ok(Self {
            store,
            provider: Arc::new(DirectorySandboxProvider::from_config(&settings.sandbox)),
            transfer: Arc::new(ObjectStoreTransfer::new(sync_store)),
            validator: Arc::new(StaticValidator::new(
                &settings.validation,
                settings.publish.base_domain.clone(),
            )),
            runner: Arc::new(runner),
            publisher: Arc::new(RegistryPublisher::new(
                registry,
                settings.publish.base_domain.clone(),
            )),
        })
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

struct RunHandle {
    cancel: CancellationToken,
    feed: watch::Receiver<DeploymentRecord>,
}

struct Inner {
    quota: QuotaGuard,
    collaborators: Collaborators,
    options: PipelineOptions,
    runs: DashMap<DeploymentId, RunHandle>,
}

/// Entry point for starting and observing deployments.
///
/// Cheap to clone; clones share the same runs.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// Create an orchestrator.
    #[must_use]
    pub fn new(quota: QuotaGuard, collaborators: Collaborators, options: PipelineOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                quota,
                collaborators,
                options,
                runs: DashMap::new(),
            }),
        }
    }

    /// Create an orchestrator with the shipped collaborators.
    pub fn from_settings(
        settings: &PipelineSettings,
        store: Arc<dyn DeploymentStore>,
        quota_store: Arc<dyn QuotaStore>,
    ) -> PipelineResult<Self> {
        let quota = QuotaGuard::from_config(quota_store, &settings.quota);
        let collaborators = Collaborators::from_settings(settings, store)?;
        Ok(Self::new(
            quota,
            collaborators,
            PipelineOptions::from_settings(settings),
        ))
    }

    /// Create an orchestrator backed by PostgreSQL for records and quota.
    pub async fn connect(settings: &PipelineSettings) -> PipelineResult<Self> {
        let store = PostgresStore::connect(&settings.database).await?;
        let quota_store = store.quota_store().await?;
        Self::from_settings(settings, Arc::new(store), Arc::new(quota_store))
    }

    /// Admit a deployment and start its run.
    ///
    /// Returns [`PipelineError::QuotaExceeded`] without creating a record
    /// when the organization is at its limit.
    pub async fn start_deployment(&self, context: DeploymentContext) -> PipelineResult<DeploymentId> {
        let permit = self.inner.quota.try_admit(&context.org_id).await?;

        let mut record = DeploymentRecord::new(context);
        record.quota_held = true;
        if let Err(e) = self.inner.collaborators.store.insert(&record).await {
            if let Err(release) = permit.release().await {
                warn!(error = %release, "quota release after failed insert failed");
            }
            return Err(e);
        }

        let id = record.id().clone();
        let (tx, rx) = watch::channel(record.clone());
        let cancel = CancellationToken::new();
        self.inner.runs.insert(
            id.clone(),
            RunHandle {
                cancel: cancel.clone(),
                feed: rx,
            },
        );

        info!(
            deployment_id = %id,
            project = %record.context.project_id,
            org = %record.context.org_id,
            environment = %record.context.environment,
            "deployment admitted"
        );

        let span = info_span!("deployment", deployment_id = %id);
        let writer = RecordWriter::new(record, Arc::clone(&self.inner.collaborators.store), tx);
        let inner = Arc::clone(&self.inner);
        let run_id = id.clone();
        tokio::spawn(
            async move {
                inner.run(writer, permit, cancel).await;
                inner.runs.remove(&run_id);
            }
            .instrument(span),
        );

        Ok(id)
    }

    /// Latest persisted record.
    pub async fn get_status(&self, id: &DeploymentId) -> PipelineResult<DeploymentRecord> {
        self.inner
            .collaborators
            .store
            .get(id)
            .await?
            .ok_or_else(|| PipelineError::DeploymentNotFound(id.to_string()))
    }

    /// Request cancellation of a running deployment.
    ///
    /// No new attempt or stage starts afterwards. A call already in flight
    /// finishes or times out on its own, then finalize runs.
    pub async fn cancel(&self, id: &DeploymentId) -> PipelineResult<()> {
        let live = self
            .inner
            .runs
            .get(id)
            .map(|h| (h.cancel.clone(), h.feed.borrow().is_terminal()));

        match live {
            Some((_, true)) => Err(PipelineError::DeploymentFinished(id.to_string())),
            Some((token, false)) => {
                token.cancel();
                info!(deployment_id = %id, "cancellation requested");
                Ok(())
            }
            None => match self.inner.collaborators.store.get(id).await? {
                None => Err(PipelineError::DeploymentNotFound(id.to_string())),
                Some(record) if record.is_terminal() => {
                    Err(PipelineError::DeploymentFinished(id.to_string()))
                }
                Some(_) => Err(PipelineError::NotRunning(id.to_string())),
            },
        }
    }

    /// Status feed of a deployment.
    ///
    /// For a run that is no longer live the receiver holds the stored record
    /// and never changes.
    pub async fn subscribe(
        &self,
        id: &DeploymentId,
    ) -> PipelineResult<watch::Receiver<DeploymentRecord>> {
        let live = self.inner.runs.get(id).map(|h| h.feed.clone());
        if let Some(feed) = live {
            return Ok(feed);
        }
        let record = self.get_status(id).await?;
        let (_tx, rx) = watch::channel(record);
        Ok(rx)
    }

    /// Wait until the deployment is terminal and return its record.
    pub async fn wait(&self, id: &DeploymentId) -> PipelineResult<DeploymentRecord> {
        let live = self.inner.runs.get(id).map(|h| h.feed.clone());
        if let Some(mut feed) = live {
            let terminal = feed
                .wait_for(DeploymentRecord::is_terminal)
                .await
                .map(|r| DeploymentRecord::clone(&r))
                .ok();
            if let Some(record) = terminal {
                return Ok(record);
            }
        }
        self.get_status(id).await
    }

    /// List stored deployments.
    pub async fn list(&self, filter: &DeploymentFilter) -> PipelineResult<Vec<DeploymentRecord>> {
        self.inner.collaborators.store.list(filter).await
    }

    /// Whether this process is running the deployment.
    #[must_use]
    pub fn is_running(&self, id: &DeploymentId) -> bool {
        self.inner.runs.contains_key(id)
    }

    /// Current in-flight count for an organization.
    pub async fn in_flight(&self, org: &OrgId) -> PipelineResult<u32> {
        self.inner.quota.in_flight(org).await
    }

    /// Close out records left unfinished by a previous process.
    ///
    /// Each one is cleaned up from what its record shows, its quota slot is
    /// returned and it is marked failed with [`ErrorKind::Interrupted`].
    /// Call once at startup, before new deployments are started.
    pub async fn recover_interrupted(&self) -> PipelineResult<Vec<DeploymentId>> {
        let stale = self
            .inner
            .collaborators
            .store
            .list(&DeploymentFilter::new().unfinished())
            .await?;

        let mut recovered = Vec::new();
        for record in stale {
            if self.inner.runs.contains_key(record.id()) {
                continue;
            }
            let id = record.id().clone();
            self.inner.recover(record).await?;
            recovered.push(id);
        }

        if !recovered.is_empty() {
            info!(count = recovered.len(), "interrupted deployments recovered");
        }
        Ok(recovered)
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("quota", &self.inner.quota)
            .field("options", &self.inner.options)
            .field("runs", &self.inner.runs.len())
            .finish_non_exhaustive()
    }
}

/// How the stage sequence ended.
enum RunOutcome {
    Published(PublishIdentity),
    Failed(StageFailure),
    Cancelled { stage: Stage, attempts: u32 },
}

/// Result of executing one stage under its retry policy.
enum Attempted<T> {
    Done { value: T, attempts: u32 },
    Failed(StageFailure),
    Cancelled { attempts: u32 },
}

/// What the run acquired that finalize may need to release.
#[derive(Default)]
struct Progress {
    sandbox: Option<SandboxHandle>,
    storage_prefix: Option<String>,
}

fn persistence_failure(stage: Stage, error: &PipelineError) -> RunOutcome {
    error!(stage = %stage, error = %error, "failed to persist deployment record");
    RunOutcome::Failed(StageFailure::new(
        stage,
        ErrorKind::for_stage(stage),
        FaultClass::Network,
        format!("record could not be persisted: {error}"),
    ))
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl Inner {
    async fn run(&self, mut writer: RecordWriter, permit: QuotaPermit, cancel: CancellationToken) {
        let deadline_at = Instant::now() + self.options.deadline;
        let mut progress = Progress::default();

        let outcome = match self
            .stages(&mut writer, &mut progress, &cancel, deadline_at)
            .await
        {
            Ok(identity) => RunOutcome::Published(identity),
            Err(outcome) => outcome,
        };

        self.finish(writer, progress, permit, outcome).await;
    }

    async fn stages(
        &self,
        writer: &mut RecordWriter,
        progress: &mut Progress,
        cancel: &CancellationToken,
        deadline_at: Instant,
    ) -> Result<PublishIdentity, RunOutcome> {
        let context = writer.record().context.clone();
        let ctx = &context;
        let c = &self.collaborators;

        let validator = &*c.validator;
        let config = self
            .step(
                writer,
                Stage::Validate,
                cancel,
                deadline_at,
                move || validate::validate(validator, ctx),
                StepOutput::Validated,
            )
            .await?;
        progress.storage_prefix = Some(config.storage_prefix.clone());

        let provider = &*c.provider;
        let spec = SandboxSpec::for_deployment(ctx, &config.namespace);
        let spec = &spec;
        // A lost or abandoned create may still have allocated the sandbox.
        progress.sandbox = Some(spec.handle());
        let sandbox = self
            .step(
                writer,
                Stage::Provision,
                cancel,
                deadline_at,
                move || provision::provision(provider, spec),
                StepOutput::Provisioned,
            )
            .await?;
        progress.sandbox = Some(sandbox.clone());

        let transfer = &*c.transfer;
        let root = ctx.source.root();
        let prefix = config.storage_prefix.as_str();
        self.step(
            writer,
            Stage::Sync,
            cancel,
            deadline_at,
            move || sync::sync(transfer, root, prefix),
            StepOutput::Synced,
        )
        .await?;

        let runner = &*c.runner;
        let build_spec = BuildSpec {
            source_prefix: config.storage_prefix.clone(),
            revision: ctx.source.revision(),
            env: vec![
                ("SHIPYARD_DEPLOYMENT_ID".to_owned(), ctx.deployment_id.to_string()),
                ("SHIPYARD_ENVIRONMENT".to_owned(), ctx.environment.clone()),
            ],
        };
        let build_spec = &build_spec;
        let sandbox = &sandbox;
        let tail_lines = self.options.log_tail_lines;
        let artifact = self
            .step(
                writer,
                Stage::Build,
                cancel,
                deadline_at,
                move || build::build(runner, sandbox, build_spec, tail_lines),
                StepOutput::Built,
            )
            .await?;

        let publisher = &*c.publisher;
        let artifact = &artifact;
        let config = &config;
        self.step(
            writer,
            Stage::Publish,
            cancel,
            deadline_at,
            move || publish::publish(publisher, artifact, config),
            StepOutput::Published,
        )
        .await
    }

    /// Enter `stage`, execute it and record the entry.
    async fn step<T, F, Fut>(
        &self,
        writer: &mut RecordWriter,
        stage: Stage,
        cancel: &CancellationToken,
        deadline_at: Instant,
        op: F,
        wrap: fn(T) -> StepOutput,
    ) -> Result<T, RunOutcome>
    where
        T: Clone,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StageFailure>>,
    {
        if cancel.is_cancelled() {
            return Err(RunOutcome::Cancelled { stage, attempts: 0 });
        }
        if Instant::now() >= deadline_at {
            return Err(RunOutcome::Failed(self.deadline_failure(stage, 0)));
        }

        writer
            .advance(stage.state())
            .await
            .map_err(|e| persistence_failure(stage, &e))?;

        let started_at = Utc::now();
        let attempted = self.execute(stage, cancel, deadline_at, op).await;
        let finished_at = Utc::now();

        match attempted {
            Attempted::Done { value, attempts } => {
                info!(stage = %stage, attempts, "stage succeeded");
                writer
                    .append_step(StepEntry {
                        stage,
                        attempts,
                        started_at,
                        finished_at,
                        result: StepResult::Succeeded(wrap(value.clone())),
                    })
                    .await
                    .map_err(|e| persistence_failure(stage, &e))?;
                Ok(value)
            }
            Attempted::Failed(failure) => {
                let entry = StepEntry {
                    stage,
                    attempts: failure.attempts,
                    started_at,
                    finished_at,
                    result: StepResult::Failed(failure.clone()),
                };
                if let Err(e) = writer.append_step(entry).await {
                    error!(stage = %stage, error = %e, "failed to persist stage failure");
                }
                Err(RunOutcome::Failed(failure))
            }
            Attempted::Cancelled { attempts } => Err(RunOutcome::Cancelled { stage, attempts }),
        }
    }

    /// Attempt `op` until it succeeds, fails for good, is cancelled or runs
    /// into the deadline.
    async fn execute<T, F, Fut>(
        &self,
        stage: Stage,
        cancel: &CancellationToken,
        deadline_at: Instant,
        mut op: F,
    ) -> Attempted<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StageFailure>>,
    {
        let policy = self.options.policies.for_stage(stage);
        let max_attempts = policy.attempts();
        let mut attempt = 0;

        loop {
            if cancel.is_cancelled() {
                return Attempted::Cancelled { attempts: attempt };
            }
            let now = Instant::now();
            if now >= deadline_at {
                return Attempted::Failed(self.deadline_failure(stage, attempt));
            }

            attempt += 1;
            let limit = policy.timeout.min(deadline_at - now);
            debug!(stage = %stage, attempt, timeout_ms = millis(limit), "starting attempt");

            let failure = match tokio::time::timeout(limit, op()).await {
                Ok(Ok(value)) => {
                    return Attempted::Done {
                        value,
                        attempts: attempt,
                    }
                }
                Ok(Err(failure)) => failure,
                Err(_) if Instant::now() >= deadline_at => {
                    return Attempted::Failed(self.deadline_failure(stage, attempt));
                }
                Err(_) => StageFailure::timed_out(stage, policy.timeout),
            }
            .with_attempts(attempt);

            if !failure.is_retryable() {
                warn!(
                    stage = %stage,
                    attempt,
                    kind = %failure.kind,
                    class = %failure.class,
                    error = %failure.message,
                    "stage failed, not retryable"
                );
                return Attempted::Failed(failure);
            }
            if attempt >= max_attempts {
                warn!(
                    stage = %stage,
                    attempt,
                    kind = %failure.kind,
                    error = %failure.message,
                    "stage failed, retries exhausted"
                );
                return Attempted::Failed(failure);
            }

            let delay = policy.delay_after(attempt);
            warn!(
                stage = %stage,
                attempt,
                max_attempts,
                delay_ms = millis(delay),
                error = %failure.message,
                "stage attempt failed, backing off"
            );

            tokio::select! {
                biased;
                () = cancel.cancelled() => return Attempted::Cancelled { attempts: attempt },
                () = tokio::time::sleep_until(deadline_at) => {
                    return Attempted::Failed(self.deadline_failure(stage, attempt));
                }
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn deadline_failure(&self, stage: Stage, attempts: u32) -> StageFailure {
        StageFailure::new(
            stage,
            ErrorKind::TimeoutError,
            FaultClass::Timeout,
            format!("deployment deadline of {:?} exceeded", self.options.deadline),
        )
        .with_attempts(attempts)
    }

    async fn finish(
        &self,
        mut writer: RecordWriter,
        progress: Progress,
        permit: QuotaPermit,
        outcome: RunOutcome,
    ) {
        let id = writer.record().id().clone();
        let reached = writer.record().state;
        if let Err(e) = writer.advance(PipelineState::Finalizing).await {
            error!(deployment_id = %id, error = %e, "failed to persist finalizing state");
        }

        let succeeded = matches!(outcome, RunOutcome::Published(_));
        let discard_prefix = if !succeeded && reached >= PipelineState::Syncing {
            progress.storage_prefix
        } else {
            None
        };
        let plan = CleanupPlan {
            sandbox: progress.sandbox,
            discard_prefix,
            permit: Some(permit),
        };

        let c = &self.collaborators;
        let policy = self.options.policies.for_stage(Stage::Finalize);
        let started_at = Utc::now();
        let (report, leftover) = finalize::finalize(&*c.provider, &*c.transfer, plan, &policy).await;
        let quota_held = leftover.is_some();
        if quota_held {
            warn!(deployment_id = %id, "quota release deferred to the runtime");
        }
        drop(leftover);

        let cleanup_errors = report.cleanup_errors.clone();
        let entry = StepEntry {
            stage: Stage::Finalize,
            attempts: 1,
            started_at,
            finished_at: Utc::now(),
            result: StepResult::Succeeded(StepOutput::Finalized(report)),
        };
        if let Err(e) = writer.append_finalize(entry, quota_held).await {
            error!(deployment_id = %id, error = %e, "failed to persist finalize step");
        }

        let (to, failure) = match outcome {
            RunOutcome::Published(identity) => {
                info!(
                    deployment_id = %id,
                    endpoint = %identity.endpoint,
                    revision_id = %identity.revision_id,
                    "deployment succeeded"
                );
                (PipelineState::Succeeded, None)
            }
            RunOutcome::Failed(failure) => {
                error!(
                    deployment_id = %id,
                    stage = %failure.stage,
                    kind = %failure.kind,
                    attempts = failure.attempts,
                    error = %failure.message,
                    "deployment failed"
                );
                (PipelineState::Failed, Some(FailureCause::from(&failure)))
            }
            RunOutcome::Cancelled { stage, attempts } => {
                info!(deployment_id = %id, stage = %stage, "deployment cancelled");
                (
                    PipelineState::Cancelled,
                    Some(FailureCause {
                        stage,
                        kind: ErrorKind::Cancelled,
                        attempts,
                        message: "cancelled on request".to_owned(),
                    }),
                )
            }
        };

        if let Err(e) = writer.finish(to, failure, cleanup_errors, quota_held).await {
            error!(deployment_id = %id, error = %e, "failed to persist final record");
        }
    }

    async fn recover(&self, record: DeploymentRecord) -> PipelineResult<()> {
        let interrupted_in = record.state;
        let stage = interrupted_in.stage().unwrap_or(Stage::Validate);
        let attempts = record.step(stage).map_or(0, |s| s.attempts);
        let org = record.context.org_id.clone();

        let sandbox = record.steps.iter().find_map(|s| match &s.result {
            StepResult::Succeeded(StepOutput::Provisioned(handle)) => Some(handle.clone()),
            _ => None,
        });
        let discard_prefix = if interrupted_in >= PipelineState::Syncing {
            record.steps.iter().find_map(|s| match &s.result {
                StepResult::Succeeded(StepOutput::Validated(config)) => {
                    Some(config.storage_prefix.clone())
                }
                _ => None,
            })
        } else {
            None
        };

        // Finalize already ran before the crash; only the quota may be owed.
        let finalized = record.steps.iter().find_map(|s| match &s.result {
            StepResult::Succeeded(StepOutput::Finalized(report)) if s.stage == Stage::Finalize => {
                Some(report.clone())
            }
            _ => None,
        });

        let c = &self.collaborators;
        let (tx, _rx) = watch::channel(record.clone());
        let mut writer = RecordWriter::new(record, Arc::clone(&c.store), tx);
        if interrupted_in != PipelineState::Finalizing {
            writer.advance(PipelineState::Finalizing).await?;
        }

        let mut quota_held = writer.record().quota_held;
        let cleanup_errors = match finalized {
            Some(report) => {
                let mut cleanup_errors = report.cleanup_errors;
                if quota_held && !report.quota_released {
                    match self.release_orphaned(&org).await {
                        Ok(()) => quota_held = false,
                        Err(message) => cleanup_errors.push(message),
                    }
                }
                cleanup_errors
            }
            None => {
                let plan = CleanupPlan {
                    sandbox,
                    discard_prefix,
                    permit: None,
                };
                let policy = self.options.policies.for_stage(Stage::Finalize);
                let started_at = Utc::now();
                let (mut report, _) =
                    finalize::finalize(&*c.provider, &*c.transfer, plan, &policy).await;

                if quota_held {
                    match self.release_orphaned(&org).await {
                        Ok(()) => {
                            quota_held = false;
                            report.quota_released = true;
                        }
                        Err(message) => report.cleanup_errors.push(message),
                    }
                }

                let cleanup_errors = report.cleanup_errors.clone();
                let entry = StepEntry {
                    stage: Stage::Finalize,
                    attempts: 1,
                    started_at,
                    finished_at: Utc::now(),
                    result: StepResult::Succeeded(StepOutput::Finalized(report)),
                };
                writer.append_finalize(entry, quota_held).await?;
                cleanup_errors
            }
        };

        writer
            .finish(
                PipelineState::Failed,
                Some(FailureCause {
                    stage,
                    kind: ErrorKind::Interrupted,
                    attempts,
                    message: format!("run interrupted while {interrupted_in}"),
                }),
                cleanup_errors,
                quota_held,
            )
            .await?;

        warn!(
            deployment_id = %writer.record().id(),
            state = %interrupted_in,
            "interrupted deployment marked failed"
        );
        Ok(())
    }

    async fn release_orphaned(&self, org: &OrgId) -> Result<(), String> {
        self.quota.release_orphaned(org).await.map_err(|e| {
            warn!(org = %org, error = %e, "failed to release orphaned quota slot");
            format!("{}: release quota failed: {e}", ErrorKind::CleanupError)
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::path::Path;

    use async_trait::async_trait;
    use object_store::memory::InMemory;
    use object_store::ObjectStore;

    use super::*;
    use crate::config::ValidationConfig;
    use crate::error::ProviderError;
    use crate::provisioner::MockSandboxProvider;
    use crate::quota::MemoryQuotaStore;
    use crate::stage::build::BuildOutput;
    use crate::store::MemoryStore;
    use crate::types::{DeploymentStatus, ProjectId, SourceRef, UserId};

    struct Builds {
        exit_code: i32,
    }

    #[async_trait]
    impl BuildRunner for Builds {
        async fn build(
            &self,
            _sandbox: &SandboxHandle,
            spec: &BuildSpec,
        ) -> Result<BuildOutput, ProviderError> {
            Ok(BuildOutput {
                exit_code: self.exit_code,
                logs: vec![format!("building {}", spec.revision), "done".to_owned()],
            })
        }
    }

    struct Harness {
        orchestrator: Orchestrator,
        store: Arc<MemoryStore>,
        provider: Arc<MockSandboxProvider>,
        objects: Arc<InMemory>,
    }

    fn harness(exit_code: i32, limit: u32) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(MockSandboxProvider::new());
        let objects = Arc::new(InMemory::new());
        let collaborators = Collaborators {
            store: store.clone(),
            provider: provider.clone(),
            transfer: Arc::new(ObjectStoreTransfer::new(objects.clone())),
            validator: Arc::new(StaticValidator::new(&ValidationConfig::default(), "shipyard.test")),
            runner: Arc::new(Builds { exit_code }),
            publisher: Arc::new(RegistryPublisher::new(objects.clone(), "shipyard.test")),
        };
        let quota = QuotaGuard::new(Arc::new(MemoryQuotaStore::new()), limit);
        Harness {
            orchestrator: Orchestrator::new(quota, collaborators, PipelineOptions::default()),
            store,
            provider,
            objects,
        }
    }

    fn source(root: &Path) -> DeploymentContext {
        std::fs::create_dir_all(root.join("src")).unwrap();
        std::fs::write(root.join("src/index.js"), "console.log(1);\n").unwrap();
        DeploymentContext::new(
            ProjectId::new("p1"),
            OrgId::new("o1"),
            UserId::new("u1"),
            "production",
            SourceRef::Git {
                branch: "main".to_owned(),
                commit: "0123456789abcdef".to_owned(),
                checkout: root.to_path_buf(),
            },
        )
    }

    #[tokio::test]
    async fn successful_run_reaches_succeeded() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(0, 10);
        let id = h.orchestrator.start_deployment(source(dir.path())).await.unwrap();

        let record = h.orchestrator.wait(&id).await.unwrap();
        assert_eq!(record.status, DeploymentStatus::Succeeded);
        assert_eq!(record.stage_order(), Stage::ALL.to_vec());
        assert!(record.failure.is_none());
        assert!(!record.quota_held);
        assert_eq!(
            record.published().unwrap().endpoint,
            "https://o1-p1-production.shipyard.test"
        );

        assert_eq!(h.provider.live_count(), 0);
        assert_eq!(h.orchestrator.in_flight(&OrgId::new("o1")).await.unwrap(), 0);

        let stored = h.store.get(&id).await.unwrap().unwrap();
        assert_eq!(stored, record);
        let history = h.store.transitions(&id).await.unwrap();
        assert_eq!(history.last().unwrap().to, PipelineState::Succeeded);
    }

    #[tokio::test]
    async fn build_failure_discards_synced_files() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(2, 10);
        let id = h.orchestrator.start_deployment(source(dir.path())).await.unwrap();

        let record = h.orchestrator.wait(&id).await.unwrap();
        assert_eq!(record.status, DeploymentStatus::Failed);
        let failure = record.failure.as_ref().unwrap();
        assert_eq!(failure.stage, Stage::Build);
        assert_eq!(failure.kind, ErrorKind::BuildError);
        assert_eq!(failure.attempts, 1);

        let prefix = object_store::path::Path::from(format!("deployments/p1/{id}"));
        let left = h.objects.list_with_delimiter(Some(&prefix)).await.unwrap();
        assert!(left.objects.is_empty() && left.common_prefixes.is_empty());
        assert_eq!(h.provider.live_count(), 0);
    }

    #[tokio::test]
    async fn quota_rejection_creates_no_record() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(0, 0);
        let result = h.orchestrator.start_deployment(source(dir.path())).await;
        assert!(matches!(result, Err(PipelineError::QuotaExceeded { .. })));
        assert!(h.store.list(&DeploymentFilter::new()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_deployment_lookups_fail() {
        let h = harness(0, 10);
        let id = DeploymentId::new("nope");
        assert!(matches!(
            h.orchestrator.get_status(&id).await,
            Err(PipelineError::DeploymentNotFound(_))
        ));
        assert!(matches!(
            h.orchestrator.cancel(&id).await,
            Err(PipelineError::DeploymentNotFound(_))
        ));
    }

    #[tokio::test]
    async fn cancelling_a_finished_run_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(0, 10);
        let id = h.orchestrator.start_deployment(source(dir.path())).await.unwrap();
        h.orchestrator.wait(&id).await.unwrap();

        // The run task may still be unregistering itself.
        let result = h.orchestrator.cancel(&id).await;
        assert!(matches!(result, Err(PipelineError::DeploymentFinished(_))));
    }

    #[tokio::test]
    async fn recover_marks_orphans_interrupted_and_frees_quota() {
        let h = harness(0, 1);
        let quota = &h.orchestrator.inner.quota;
        let org = OrgId::new("o1");
        // Slot taken by a run from a previous process.
        let permit = quota.try_admit(&org).await.unwrap();
        std::mem::forget(permit);

        let dir = tempfile::tempdir().unwrap();
        let mut orphan = DeploymentRecord::new(source(dir.path()));
        orphan.quota_held = true;
        h.store.insert(&orphan).await.unwrap();
        orphan.state = PipelineState::Validating;
        orphan.status = DeploymentStatus::Running;
        h.store.save(&orphan).await.unwrap();

        let recovered = h.orchestrator.recover_interrupted().await.unwrap();
        assert_eq!(recovered, vec![orphan.id().clone()]);

        let record = h.orchestrator.get_status(orphan.id()).await.unwrap();
        assert_eq!(record.status, DeploymentStatus::Failed);
        let failure = record.failure.unwrap();
        assert_eq!(failure.kind, ErrorKind::Interrupted);
        assert_eq!(failure.stage, Stage::Validate);
        assert!(!record.quota_held);
        assert_eq!(h.orchestrator.in_flight(&org).await.unwrap(), 0);

        assert!(h.orchestrator.recover_interrupted().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn recover_after_finalize_does_not_release_twice() {
        let h = harness(0, 2);
        let quota = &h.orchestrator.inner.quota;
        let org = OrgId::new("o1");
        // Slot of an unrelated run that is still alive.
        let live = quota.try_admit(&org).await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let mut orphan = DeploymentRecord::new(source(dir.path()));
        h.store.insert(&orphan).await.unwrap();
        let now = Utc::now();
        orphan.state = PipelineState::Finalizing;
        orphan.status = DeploymentStatus::Running;
        orphan.quota_held = true;
        orphan.steps.push(StepEntry {
            stage: Stage::Finalize,
            attempts: 1,
            started_at: now,
            finished_at: now,
            result: StepResult::Succeeded(StepOutput::Finalized(finalize::FinalizeReport {
                quota_released: true,
                ..finalize::FinalizeReport::default()
            })),
        });
        h.store.save(&orphan).await.unwrap();

        h.orchestrator.recover_interrupted().await.unwrap();

        let record = h.orchestrator.get_status(orphan.id()).await.unwrap();
        assert_eq!(record.status, DeploymentStatus::Failed);
        assert_eq!(record.failure.unwrap().kind, ErrorKind::Interrupted);
        assert!(!record.quota_held);
        let finalized = record
            .steps
            .iter()
            .filter(|s| s.stage == Stage::Finalize)
            .count();
        assert_eq!(finalized, 1);
        assert_eq!(h.orchestrator.in_flight(&org).await.unwrap(), 1);
        assert!(h.provider.destroyed().is_empty());

        live.release().await.unwrap();
        assert_eq!(h.orchestrator.in_flight(&org).await.unwrap(), 0);
    }
}
