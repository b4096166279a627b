//! Common test utilities for pipeline integration tests.
//!
//! Every collaborator is a fake driven by a [`Script`]: a queue of steps
//! played one per call, falling back to a fixed step once the queue is empty.

#![allow(dead_code)]

pub mod fixtures;

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use shipyard_pipeline::provisioner::{DirectorySandboxProvider, MockSandboxProvider};
use shipyard_pipeline::retry::RetryPolicyConfig;
use shipyard_pipeline::stage::{
    BuildArtifact, BuildOutput, BuildRunner, BuildSpec, DeploymentValidator, PublishIdentity,
    PublishTarget, StorageTransfer,
};
use shipyard_pipeline::{
    Collaborators, DeploymentConfig, DeploymentContext, MemoryQuotaStore, MemoryStore,
    Orchestrator, OrgId, PipelineOptions, PipelineResult, ProviderError, QuotaGuard, QuotaStore,
    SandboxHandle, SandboxProvider, SandboxSpec, Stage, StagePolicies,
};

/// One scripted call outcome.
#[derive(Debug, Clone)]
pub enum Step {
    /// Succeed immediately.
    Pass,
    /// Fail with the given error.
    Fail(ProviderError),
    /// Sleep, then succeed.
    Hang(Duration),
}

/// Call script shared by the fakes.
#[derive(Debug, Default)]
pub struct Script {
    queue: Mutex<VecDeque<Step>>,
    fallback: Mutex<Option<Step>>,
    calls: AtomicU32,
}

impl Script {
    /// Queue a step for the next unscripted call.
    pub fn then(&self, step: Step) -> &Self {
        self.queue.lock().unwrap().push_back(step);
        self
    }

    /// Step played once the queue is empty.
    pub fn always(&self, step: Step) {
        *self.fallback.lock().unwrap() = Some(step);
    }

    /// Calls made so far.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    async fn play(&self) -> Result<(), ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = {
            let queued = self.queue.lock().unwrap().pop_front();
            queued.or_else(|| self.fallback.lock().unwrap().clone())
        };
        match step {
            None | Some(Step::Pass) => Ok(()),
            Some(Step::Fail(e)) => Err(e),
            Some(Step::Hang(d)) => {
                tokio::time::sleep(d).await;
                Ok(())
            }
        }
    }
}

/// Sandbox provider with scripted faults in front of the mock provider.
#[derive(Debug, Default)]
pub struct FaultyProvider {
    pub create: Script,
    pub destroy: Script,
    inner: MockSandboxProvider,
}

impl FaultyProvider {
    pub fn created(&self) -> Vec<String> {
        self.inner.created()
    }

    pub fn destroyed(&self) -> Vec<String> {
        self.inner.destroyed()
    }

    pub fn live_count(&self) -> usize {
        self.inner.live_count()
    }
}

#[async_trait]
impl SandboxProvider for FaultyProvider {
    async fn create(&self, spec: &SandboxSpec) -> Result<SandboxHandle, ProviderError> {
        self.create.play().await?;
        self.inner.create(spec).await
    }

    async fn destroy(&self, handle: &SandboxHandle) -> Result<(), ProviderError> {
        self.destroy.play().await?;
        self.inner.destroy(handle).await
    }
}

/// Directory provider whose create responses can be lost after the sandbox
/// was allocated.
#[derive(Debug)]
pub struct LossyProvider {
    pub after_create: Script,
    pub inner: DirectorySandboxProvider,
}

impl LossyProvider {
    pub fn new(work_dir: &Path) -> Self {
        Self {
            after_create: Script::default(),
            inner: DirectorySandboxProvider::new(work_dir, 4),
        }
    }

    pub fn live_count(&self) -> usize {
        self.inner.live_count()
    }
}

#[async_trait]
impl SandboxProvider for LossyProvider {
    async fn create(&self, spec: &SandboxSpec) -> Result<SandboxHandle, ProviderError> {
        let handle = self.inner.create(spec).await?;
        self.after_create.play().await?;
        Ok(handle)
    }

    async fn destroy(&self, handle: &SandboxHandle) -> Result<(), ProviderError> {
        self.inner.destroy(handle).await
    }
}

/// Storage transfer that records uploads instead of storing them.
#[derive(Debug, Default)]
pub struct FakeTransfer {
    pub upload: Script,
    pub discard: Script,
    uploaded: Mutex<Vec<(String, String, String)>>,
    discarded: Mutex<Vec<String>>,
}

impl FakeTransfer {
    /// Relative paths uploaded so far.
    pub fn uploaded_paths(&self) -> Vec<String> {
        self.uploaded
            .lock()
            .unwrap()
            .iter()
            .map(|(_, path, _)| path.clone())
            .collect()
    }

    /// Content type recorded for `path`.
    pub fn content_type(&self, path: &str) -> Option<String> {
        self.uploaded
            .lock()
            .unwrap()
            .iter()
            .find(|(_, p, _)| p == path)
            .map(|(_, _, ct)| ct.clone())
    }

    /// Prefixes discarded so far.
    pub fn discarded(&self) -> Vec<String> {
        self.discarded.lock().unwrap().clone()
    }
}

#[async_trait]
impl StorageTransfer for FakeTransfer {
    async fn upload(
        &self,
        prefix: &str,
        relative_path: &str,
        _body: Bytes,
        _size_hint: u64,
        content_type: &str,
    ) -> Result<(), ProviderError> {
        self.upload.play().await?;
        self.uploaded.lock().unwrap().push((
            prefix.to_owned(),
            relative_path.to_owned(),
            content_type.to_owned(),
        ));
        Ok(())
    }

    async fn discard(&self, prefix: &str) -> Result<u64, ProviderError> {
        self.discard.play().await?;
        let mut uploaded = self.uploaded.lock().unwrap();
        let before = uploaded.len();
        uploaded.retain(|(p, _, _)| p != prefix);
        let removed = u64::try_from(before - uploaded.len()).unwrap();
        drop(uploaded);
        self.discarded.lock().unwrap().push(prefix.to_owned());
        Ok(removed)
    }
}

/// Validator that approves everything its script lets through.
#[derive(Debug, Default)]
pub struct FakeValidator {
    pub authorize: Script,
    pub resolve: Script,
}

#[async_trait]
impl DeploymentValidator for FakeValidator {
    async fn authorize(&self, _context: &DeploymentContext) -> Result<(), ProviderError> {
        self.authorize.play().await
    }

    async fn resolve_config(
        &self,
        context: &DeploymentContext,
    ) -> Result<DeploymentConfig, ProviderError> {
        self.resolve.play().await?;
        let namespace = format!(
            "{}-{}-{}",
            context.org_id, context.project_id, context.environment
        );
        Ok(DeploymentConfig {
            registry: format!("{namespace}/{}", context.project_id),
            endpoint: format!("https://{namespace}.shipyard.test"),
            storage_prefix: format!(
                "deployments/{}/{}",
                context.project_id, context.deployment_id
            ),
            namespace,
        })
    }
}

/// Build runner with a scripted fault plan and a configurable exit code.
#[derive(Debug, Default)]
pub struct FakeRunner {
    pub script: Script,
    exit_code: AtomicI32,
}

impl FakeRunner {
    pub fn set_exit_code(&self, code: i32) {
        self.exit_code.store(code, Ordering::SeqCst);
    }
}

#[async_trait]
impl BuildRunner for FakeRunner {
    async fn build(
        &self,
        _sandbox: &SandboxHandle,
        spec: &BuildSpec,
    ) -> Result<BuildOutput, ProviderError> {
        self.script.play().await?;
        Ok(BuildOutput {
            exit_code: self.exit_code.load(Ordering::SeqCst),
            logs: vec![format!("building {}", spec.revision), "done".to_owned()],
        })
    }
}

/// Publish target that hands out sequential revision ids.
#[derive(Debug, Default)]
pub struct FakePublisher {
    pub script: Script,
    published: AtomicU32,
}

impl FakePublisher {
    pub fn published(&self) -> u32 {
        self.published.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PublishTarget for FakePublisher {
    async fn publish(
        &self,
        _artifact: &BuildArtifact,
        config: &DeploymentConfig,
    ) -> Result<PublishIdentity, ProviderError> {
        self.script.play().await?;
        let n = self.published.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(PublishIdentity {
            endpoint: config.endpoint.clone(),
            revision_id: format!("rev-{n}"),
        })
    }
}

/// Quota store that counts successful increments and every decrement.
#[derive(Debug, Default)]
pub struct CountingQuotaStore {
    inner: MemoryQuotaStore,
    increments: AtomicU32,
    decrements: AtomicU32,
}

impl CountingQuotaStore {
    pub fn increments(&self) -> u32 {
        self.increments.load(Ordering::SeqCst)
    }

    pub fn decrements(&self) -> u32 {
        self.decrements.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QuotaStore for CountingQuotaStore {
    async fn increment_if_below(&self, org: &OrgId, max: u32) -> PipelineResult<bool> {
        let admitted = self.inner.increment_if_below(org, max).await?;
        if admitted {
            self.increments.fetch_add(1, Ordering::SeqCst);
        }
        Ok(admitted)
    }

    async fn decrement(&self, org: &OrgId) -> PipelineResult<()> {
        self.decrements.fetch_add(1, Ordering::SeqCst);
        self.inner.decrement(org).await
    }

    async fn current(&self, org: &OrgId) -> PipelineResult<u32> {
        self.inner.current(org).await
    }
}

/// Retry settings used by the harness unless a test overrides them.
pub fn fast_policy(max_attempts: u32) -> RetryPolicyConfig {
    RetryPolicyConfig {
        max_attempts,
        base_delay_ms: 10,
        max_delay_ms: 100,
        timeout_secs: 30,
    }
}

/// Complete test pipeline with all fakes wired together.
pub struct TestHarness {
    pub store: Arc<MemoryStore>,
    pub quota_store: Arc<CountingQuotaStore>,
    pub provider: Arc<FaultyProvider>,
    pub transfer: Arc<FakeTransfer>,
    pub validator: Arc<FakeValidator>,
    pub runner: Arc<FakeRunner>,
    pub publisher: Arc<FakePublisher>,
    pub options: PipelineOptions,
    pub limit: u32,
    sandboxes: Option<Arc<dyn SandboxProvider>>,
}

impl TestHarness {
    /// Harness with fast retries, a 10 minute deadline and a quota of 10.
    pub fn new() -> Self {
        let policies = StagePolicies::default()
            .with(Stage::Validate, fast_policy(2))
            .with(Stage::Provision, fast_policy(3))
            .with(Stage::Sync, fast_policy(3))
            .with(Stage::Build, fast_policy(1))
            .with(Stage::Publish, fast_policy(3))
            .with(Stage::Finalize, fast_policy(2));

        Self {
            store: Arc::new(MemoryStore::new()),
            quota_store: Arc::new(CountingQuotaStore::default()),
            provider: Arc::new(FaultyProvider::default()),
            transfer: Arc::new(FakeTransfer::default()),
            validator: Arc::new(FakeValidator::default()),
            runner: Arc::new(FakeRunner::default()),
            publisher: Arc::new(FakePublisher::default()),
            options: PipelineOptions {
                policies,
                deadline: Duration::from_secs(600),
                log_tail_lines: 10,
            },
            limit: 10,
            sandboxes: None,
        }
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.options.deadline = deadline;
        self
    }

    pub fn with_policy(mut self, stage: Stage, policy: RetryPolicyConfig) -> Self {
        self.options.policies = self.options.policies.with(stage, policy);
        self
    }

    /// Use `provider` for sandboxes instead of [`FaultyProvider`].
    pub fn with_provider(mut self, provider: Arc<dyn SandboxProvider>) -> Self {
        self.sandboxes = Some(provider);
        self
    }

    /// Build an orchestrator over the harness fakes.
    pub fn orchestrator(&self) -> Orchestrator {
        let provider: Arc<dyn SandboxProvider> = match &self.sandboxes {
            Some(provider) => Arc::clone(provider),
            None => self.provider.clone(),
        };
        Orchestrator::new(
            QuotaGuard::new(self.quota_store.clone(), self.limit),
            Collaborators {
                store: self.store.clone(),
                provider,
                transfer: self.transfer.clone(),
                validator: self.validator.clone(),
                runner: self.runner.clone(),
                publisher: self.publisher.clone(),
            },
            self.options,
        )
    }

    pub async fn in_flight(&self, org: &str) -> u32 {
        self.quota_store.current(&OrgId::new(org)).await.unwrap()
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Write a small deployable tree at `root`.
pub fn write_file(root: &Path, relative: &str, contents: &str) {
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, contents).unwrap();
}
