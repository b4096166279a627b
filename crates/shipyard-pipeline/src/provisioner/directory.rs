//! Sandboxes backed by isolated working directories.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{SandboxHandle, SandboxProvider, SandboxSpec};
use crate::config::SandboxConfig;
use crate::error::ProviderError;

type LiveMap = HashMap<String, Slot>;

#[derive(Debug)]
enum Slot {
    /// Counted against capacity while the directory is being created.
    Reserved,
    Ready(PathBuf),
}

/// Capacity slot taken by an in-progress `create`.
///
/// Dropped without [`Reservation::commit`] (an error, or the create future
/// being dropped by a timeout) it gives the slot back.
struct Reservation<'a> {
    live: &'a Mutex<LiveMap>,
    id: String,
    committed: bool,
}

impl Reservation<'_> {
    fn commit(mut self, path: PathBuf) -> Result<(), ProviderError> {
        let mut live = self
            .live
            .lock()
            .map_err(|_| ProviderError::rejected("lock poisoned"))?;
        live.insert(self.id.clone(), Slot::Ready(path));
        self.committed = true;
        Ok(())
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if let Ok(mut live) = self.live.lock() {
            if matches!(live.get(&self.id), Some(Slot::Reserved)) {
                live.remove(&self.id);
            }
        }
    }
}

enum Reserve<'a> {
    Fresh(Reservation<'a>),
    Live(PathBuf),
}

/// Provider that gives each deployment its own directory under `work_dir`.
///
/// The number of live sandboxes is bounded by `max_sandboxes`; requests over
/// the bound fail with a capacity fault so the orchestrator can back off.
#[derive(Debug)]
pub struct DirectorySandboxProvider {
    work_dir: PathBuf,
    max_sandboxes: usize,
    live: Mutex<LiveMap>,
}

impl DirectorySandboxProvider {
    /// Create a provider rooted at `work_dir`.
    #[must_use]
    pub fn new(work_dir: impl Into<PathBuf>, max_sandboxes: usize) -> Self {
        Self {
            work_dir: work_dir.into(),
            max_sandboxes,
            live: Mutex::new(HashMap::new()),
        }
    }

    /// Create a provider from configuration.
    #[must_use]
    pub fn from_config(config: &SandboxConfig) -> Self {
        Self::new(config.work_dir.clone(), config.max_sandboxes)
    }

    /// Number of sandboxes currently alive or being created.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live.lock().map(|l| l.len()).unwrap_or_default()
    }

    /// Root directory sandboxes are created under.
    #[must_use]
    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    fn live(&self) -> Result<MutexGuard<'_, LiveMap>, ProviderError> {
        self.live
            .lock()
            .map_err(|_| ProviderError::rejected("lock poisoned"))
    }

    fn reserve(&self, id: &str) -> Result<Reserve<'_>, ProviderError> {
        let mut live = self.live()?;
        match live.get(id) {
            Some(Slot::Ready(path)) => return Ok(Reserve::Live(path.clone())),
            Some(Slot::Reserved) => {
                return Err(ProviderError::rejected(format!(
                    "sandbox is already being created: {id}"
                )))
            }
            None => {}
        }
        if live.len() >= self.max_sandboxes {
            return Err(ProviderError::capacity(format!(
                "sandbox capacity reached ({} live)",
                self.max_sandboxes
            )));
        }
        live.insert(id.to_owned(), Slot::Reserved);
        Ok(Reserve::Fresh(Reservation {
            live: &self.live,
            id: id.to_owned(),
            committed: false,
        }))
    }

    // Directory a sandbox id maps to, if the id is a single plain name.
    fn directory_for(&self, id: &str) -> Option<PathBuf> {
        let mut components = Path::new(id).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => Some(self.work_dir.join(id)),
            _ => None,
        }
    }
}

#[async_trait]
impl SandboxProvider for DirectorySandboxProvider {
    async fn create(&self, spec: &SandboxSpec) -> Result<SandboxHandle, ProviderError> {
        let id = spec.sandbox_id();
        let path = self
            .directory_for(&id)
            .ok_or_else(|| ProviderError::rejected(format!("invalid sandbox id: {id}")))?;

        let reservation = match self.reserve(&id)? {
            Reserve::Live(existing) => {
                debug!(sandbox_id = %id, "sandbox already live");
                return Ok(SandboxHandle {
                    id,
                    deployment_id: spec.deployment_id.clone(),
                    workdir: Some(existing),
                });
            }
            Reserve::Fresh(reservation) => reservation,
        };

        if let Err(e) = tokio::fs::create_dir_all(&path).await {
            return Err(ProviderError::capacity(format!(
                "failed to create sandbox directory {}: {e}",
                path.display()
            )));
        }
        reservation.commit(path.clone())?;

        info!(
            sandbox_id = %id,
            deployment_id = %spec.deployment_id,
            path = %path.display(),
            "sandbox created"
        );

        Ok(SandboxHandle {
            id,
            deployment_id: spec.deployment_id.clone(),
            workdir: Some(path),
        })
    }

    async fn destroy(&self, handle: &SandboxHandle) -> Result<(), ProviderError> {
        let removed = self.live()?.remove(&handle.id);
        // An untracked id may still have a directory left by an interrupted create.
        let path = match removed {
            Some(Slot::Ready(path)) => path,
            Some(Slot::Reserved) | None => match self.directory_for(&handle.id) {
                Some(path) => path,
                None => return Ok(()),
            },
        };

        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => {
                info!(sandbox_id = %handle.id, "sandbox destroyed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(sandbox_id = %handle.id, "sandbox already destroyed");
                Ok(())
            }
            Err(e) => {
                warn!(sandbox_id = %handle.id, error = %e, "failed to remove sandbox directory");
                // Keep tracking it so a retry can try again.
                self.live()?.insert(handle.id.clone(), Slot::Ready(path));
                Err(ProviderError::network(format!(
                    "failed to remove sandbox {}: {e}",
                    handle.id
                )))
            }
        }
    }
}
