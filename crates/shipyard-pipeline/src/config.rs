//! Configuration for shipyard-pipeline.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use object_store::ObjectStore;
use serde::Deserialize;

use crate::error::{PipelineError, PipelineResult};
use crate::retry::StagePolicies;

/// Top-level configuration for the deployment pipeline.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct PipelineSettings {
    /// Per-organization admission limits.
    #[serde(default)]
    pub quota: QuotaConfig,

    /// Deadline and retry behaviour.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Sandbox provisioning.
    #[serde(default)]
    pub sandbox: SandboxConfig,

    /// Storage that source files are synced into.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Publish target.
    #[serde(default)]
    pub publish: PublishConfig,

    /// Build command.
    #[serde(default)]
    pub build: BuildConfig,

    /// Validation rules.
    #[serde(default)]
    pub validation: ValidationConfig,
}

impl PipelineSettings {
    /// Load configuration from the default sources.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default values
    /// 2. `shipyard.toml` in the current directory (if present)
    /// 3. Environment variables with `SHIPYARD_` prefix
    pub fn load() -> PipelineResult<Self> {
        Self::from_file("shipyard.toml")
    }

    /// Load configuration from a specific TOML file.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> PipelineResult<Self> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("SHIPYARD_").split("__"))
            .extract()
            .map_err(PipelineError::from)
    }
}

/// Per-organization admission limits.
#[derive(Debug, Clone, Deserialize)]
pub struct QuotaConfig {
    /// Default number of deployments an organization may have in flight.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: u32,

    /// Per-organization overrides, keyed by organization id.
    #[serde(default)]
    pub overrides: HashMap<String, u32>,
}

const fn default_max_in_flight() -> u32 {
    10
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            max_in_flight: default_max_in_flight(),
            overrides: HashMap::new(),
        }
    }
}

/// Deadline and per-stage retry configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Wall-clock budget for a whole run, in seconds.
    #[serde(default = "default_deadline_secs")]
    pub deadline_secs: u64,

    /// Retry policy for each stage.
    #[serde(default)]
    pub stages: StagePolicies,
}

const fn default_deadline_secs() -> u64 {
    1800 // 30 minutes
}

impl PipelineConfig {
    /// The global deadline as a duration.
    #[must_use]
    pub const fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            deadline_secs: default_deadline_secs(),
            stages: StagePolicies::default(),
        }
    }
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL.
    #[serde(default = "default_database_url")]
    pub url: String,

    /// Maximum number of connections in the pool.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections in the pool.
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection timeout in seconds.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_database_url() -> String {
    "postgres://localhost/shipyard".to_owned()
}

const fn default_max_connections() -> u32 {
    10
}

const fn default_min_connections() -> u32 {
    1
}

const fn default_connect_timeout_secs() -> u64 {
    5
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

/// Sandbox provisioning configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SandboxConfig {
    /// Directory under which per-deployment sandboxes are created.
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    /// Maximum number of sandboxes alive at once.
    #[serde(default = "default_max_sandboxes")]
    pub max_sandboxes: usize,
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("/var/lib/shipyard/sandboxes")
}

const fn default_max_sandboxes() -> usize {
    16
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
            max_sandboxes: default_max_sandboxes(),
        }
    }
}

/// Backend for an object store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreType {
    /// Local filesystem rooted at `path`.
    #[default]
    Local,

    /// In-memory store, for tests.
    Memory,
}

/// Object storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Backend type.
    #[serde(default)]
    pub store_type: StoreType,

    /// Root directory for the local backend.
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("/var/lib/shipyard/storage")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            store_type: StoreType::default(),
            path: default_storage_path(),
        }
    }
}

impl StorageConfig {
    /// Create the configured object store.
    pub fn object_store(&self) -> PipelineResult<Arc<dyn ObjectStore>> {
        match self.store_type {
            StoreType::Local => {
                std::fs::create_dir_all(&self.path).map_err(|e| {
                    PipelineError::Config(format!(
                        "failed to create storage directory {}: {e}",
                        self.path.display()
                    ))
                })?;
                let store = object_store::local::LocalFileSystem::new_with_prefix(&self.path)
                    .map_err(|e| {
                        PipelineError::Config(format!("failed to create local store: {e}"))
                    })?;
                Ok(Arc::new(store))
            }
            StoreType::Memory => Ok(Arc::new(object_store::memory::InMemory::new())),
        }
    }
}

/// Publish target configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PublishConfig {
    /// Domain published endpoints live under.
    #[serde(default = "default_base_domain")]
    pub base_domain: String,

    /// Registry storage that revision manifests are written to.
    #[serde(default = "default_registry")]
    pub registry: StorageConfig,
}

fn default_base_domain() -> String {
    "shipyard.app".to_owned()
}

fn default_registry() -> StorageConfig {
    StorageConfig {
        store_type: StoreType::Local,
        path: PathBuf::from("/var/lib/shipyard/registry"),
    }
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            base_domain: default_base_domain(),
            registry: default_registry(),
        }
    }
}

/// Build configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BuildConfig {
    /// Shell command run inside the sandbox.
    #[serde(default = "default_build_command")]
    pub command: String,

    /// Number of trailing log lines kept on the artifact.
    #[serde(default = "default_log_tail_lines")]
    pub log_tail_lines: usize,
}

fn default_build_command() -> String {
    "npm run build".to_owned()
}

const fn default_log_tail_lines() -> usize {
    50
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            command: default_build_command(),
            log_tail_lines: default_log_tail_lines(),
        }
    }
}

/// Validation rules.
#[derive(Debug, Clone, Deserialize)]
pub struct ValidationConfig {
    /// Environments deployments may target. A trailing `*` matches any suffix.
    #[serde(default = "default_environments")]
    pub environments: Vec<String>,

    /// Template for the namespace. `{org}`, `{project}` and `{environment}`
    /// are substituted.
    #[serde(default = "default_namespace_template")]
    pub namespace_template: String,

    /// Organizations allowed to deploy. Empty allows every organization.
    #[serde(default)]
    pub allowed_orgs: Vec<String>,
}

fn default_environments() -> Vec<String> {
    vec![
        "production".to_owned(),
        "staging".to_owned(),
        "preview-*".to_owned(),
    ]
}

fn default_namespace_template() -> String {
    "{org}-{project}-{environment}".to_owned()
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            environments: default_environments(),
            namespace_template: default_namespace_template(),
            allowed_orgs: Vec::new(),
        }
    }
}
