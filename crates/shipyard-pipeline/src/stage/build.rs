//! Build stage: run the project's build inside its sandbox.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use crate::config::BuildConfig;
use crate::error::{ErrorKind, FaultClass, ProviderError, StageFailure};
use crate::provisioner::SandboxHandle;
use crate::types::Stage;

/// What to build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildSpec {
    /// Storage prefix the source was synced under.
    pub source_prefix: String,
    /// Revision label of the source.
    pub revision: String,
    /// Extra environment for the build.
    pub env: Vec<(String, String)>,
}

/// Raw result of a build invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOutput {
    /// Process exit code. `-1` when the process was killed by a signal.
    pub exit_code: i32,
    /// Combined log lines, stdout first.
    pub logs: Vec<String>,
}

/// Reference to a successfully built artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildArtifact {
    /// Sandbox the artifact lives in.
    pub sandbox_id: String,
    /// Artifact location, understood by the publish target.
    pub artifact_ref: String,
    /// Last lines of build output.
    pub log_tail: Vec<String>,
}

/// Capability that executes builds.
#[async_trait]
pub trait BuildRunner: Send + Sync {
    /// Run the build for `spec` inside `sandbox`.
    ///
    /// A build that ran and exited non-zero is an `Ok` with that exit code.
    /// `Err` means the build could not be run at all.
    async fn build(
        &self,
        sandbox: &SandboxHandle,
        spec: &BuildSpec,
    ) -> Result<BuildOutput, ProviderError>;
}

fn tail(logs: &[String], lines: usize) -> Vec<String> {
    logs[logs.len().saturating_sub(lines)..].to_vec()
}

/// Run the build stage.
///
/// Every failure here is reported as [`ErrorKind::BuildError`].
#[instrument(skip_all, fields(sandbox_id = %sandbox.id, revision = %spec.revision))]
pub async fn build(
    runner: &dyn BuildRunner,
    sandbox: &SandboxHandle,
    spec: &BuildSpec,
    tail_lines: usize,
) -> Result<BuildArtifact, StageFailure> {
    let output = runner
        .build(sandbox, spec)
        .await
        .map_err(|e| StageFailure::from_provider(Stage::Build, &e))?;

    if output.exit_code != 0 {
        let last = output.logs.last().map_or("", String::as_str);
        warn!(exit_code = output.exit_code, last_line = last, "build failed");
        return Err(StageFailure::new(
            Stage::Build,
            ErrorKind::BuildError,
            FaultClass::Rejected,
            format!("build exited with code {}: {last}", output.exit_code),
        ));
    }

    info!(log_lines = output.logs.len(), "build succeeded");
    Ok(BuildArtifact {
        sandbox_id: sandbox.id.clone(),
        artifact_ref: format!("{}/{}", sandbox.id, spec.source_prefix),
        log_tail: tail(&output.logs, tail_lines),
    })
}

/// Runs a shell command in the sandbox working directory.
///
/// The child is killed if the build future is dropped, which is how stage
/// timeouts stop a hung build.
#[derive(Debug, Clone)]
pub struct CommandBuildRunner {
    command: String,
    source_root: Option<PathBuf>,
}

impl CommandBuildRunner {
    /// Create a runner for `command`, executed with `sh -c`.
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            source_root: None,
        }
    }

    /// Create a runner from configuration.
    #[must_use]
    pub fn from_config(config: &BuildConfig) -> Self {
        Self::new(config.command.clone())
    }

    /// Copy synced sources from `root/{source_prefix}` into the sandbox
    /// before each build.
    ///
    /// `root` is the directory backing a local sync store.
    #[must_use]
    pub fn with_source_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.source_root = Some(root.into());
        self
    }
}

fn copy_tree(from: &Path, to: &Path) -> std::io::Result<u64> {
    let mut copied = 0;
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let meta = std::fs::symlink_metadata(entry.path())?;
        let target = to.join(entry.file_name());
        if meta.is_dir() {
            copied += copy_tree(&entry.path(), &target)?;
        } else if meta.is_file() {
            std::fs::copy(entry.path(), &target)?;
            copied += 1;
        }
    }
    Ok(copied)
}

#[async_trait]
impl BuildRunner for CommandBuildRunner {
    async fn build(
        &self,
        sandbox: &SandboxHandle,
        spec: &BuildSpec,
    ) -> Result<BuildOutput, ProviderError> {
        let workdir = sandbox.workdir.as_ref().ok_or_else(|| {
            ProviderError::rejected(format!("sandbox {} has no working directory", sandbox.id))
        })?;

        if let Some(root) = &self.source_root {
            let from = root.join(&spec.source_prefix);
            let to = workdir.clone();
            let copied = tokio::task::spawn_blocking(move || copy_tree(&from, &to))
                .await
                .map_err(|e| ProviderError::rejected(format!("source staging aborted: {e}")))?
                .map_err(|e| ProviderError::rejected(format!("failed to stage sources: {e}")))?;
            debug!(files = copied, "sources staged into sandbox");
        }

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&self.command)
            .current_dir(workdir)
            .env("SHIPYARD_SOURCE_PREFIX", &spec.source_prefix)
            .env("SHIPYARD_REVISION", &spec.revision)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(command = %self.command, workdir = %workdir.display(), "spawning build");
        let mut child = cmd
            .spawn()
            .map_err(|e| ProviderError::rejected(format!("failed to spawn build: {e}")))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let stdout_task = tokio::spawn(async move {
            let mut lines = Vec::new();
            if let Some(stdout) = stdout {
                let mut reader = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    lines.push(line);
                }
            }
            lines
        });

        let stderr_task = tokio::spawn(async move {
            let mut lines = Vec::new();
            if let Some(stderr) = stderr {
                let mut reader = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    lines.push(line);
                }
            }
            lines
        });

        let status = child
            .wait()
            .await
            .map_err(|e| ProviderError::network(format!("failed to wait for build: {e}")))?;

        let mut logs = stdout_task.await.unwrap_or_default();
        logs.extend(stderr_task.await.unwrap_or_default());

        Ok(BuildOutput {
            exit_code: status.code().unwrap_or(-1),
            logs,
        })
    }
}
