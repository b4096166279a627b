//! Sync stage: copy the source tree into deployment-scoped storage.
//!
//! The walk skips a fixed deny-list of directory and file names plus any
//! dot-prefixed entry, and never follows symlinks. Files are uploaded one at
//! a time under `{prefix}/{relative/path}`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use object_store::path::Path as ObjectPath;
use object_store::{Attribute, Attributes, ObjectStore, PutOptions};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::error::{ErrorKind, FaultClass, ProviderError, StageFailure};
use crate::types::Stage;

/// Names never transferred, wherever they appear in the tree.
pub const EXCLUDED_NAMES: &[&str] = &[
    "node_modules",
    ".git",
    ".next",
    ".turbo",
    ".cache",
    ".vercel",
    "dist",
    "build",
    "out",
    "coverage",
    "target",
    ".env",
    ".env.local",
];

/// Fallback content type for unknown extensions.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Destination for synced files.
#[async_trait]
pub trait StorageTransfer: Send + Sync {
    /// Upload one file under `prefix`.
    async fn upload(
        &self,
        prefix: &str,
        relative_path: &str,
        body: Bytes,
        size_hint: u64,
        content_type: &str,
    ) -> Result<(), ProviderError>;

    /// Remove everything stored under `prefix`.
    ///
    /// Used to clean up partial uploads after a failed run.
    async fn discard(&self, prefix: &str) -> Result<u64, ProviderError>;
}

/// Result of a successful sync.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStats {
    /// Storage prefix the files were uploaded under.
    pub prefix: String,
    /// Number of files transferred.
    pub files: u64,
    /// Total bytes transferred.
    pub bytes: u64,
}

/// A file selected for transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    /// Absolute path on disk.
    pub path: PathBuf,
    /// Path relative to the source root, `/` separated.
    pub relative: String,
    /// Size reported by the filesystem during the walk.
    pub size: u64,
}

/// Whether an entry name is excluded from sync.
#[must_use]
pub fn is_excluded(name: &str) -> bool {
    name.starts_with('.') || EXCLUDED_NAMES.contains(&name)
}

/// Content type for a path, derived from its extension.
#[must_use]
pub fn content_type_for(path: &str) -> &'static str {
    let ext = path
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" | "mjs" | "cjs" => "application/javascript",
        "ts" | "tsx" | "jsx" => "application/typescript",
        "json" | "map" => "application/json",
        "txt" | "md" => "text/plain",
        "xml" => "application/xml",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "ico" => "image/x-icon",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "wasm" => "application/wasm",
        "toml" => "application/toml",
        "yaml" | "yml" => "application/yaml",
        _ => DEFAULT_CONTENT_TYPE,
    }
}

/// Enumerate the files under `root` that should be transferred.
///
/// Entries come back sorted by relative path.
pub fn collect_files(root: &Path) -> std::io::Result<Vec<SourceFile>> {
    let mut files = Vec::new();
    walk(root, root, &mut files)?;
    files.sort_by(|a, b| a.relative.cmp(&b.relative));
    Ok(files)
}

fn walk(root: &Path, dir: &Path, files: &mut Vec<SourceFile>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            debug!(path = %entry.path().display(), "skipping non utf-8 name");
            continue;
        };
        if is_excluded(name) {
            continue;
        }

        // symlink_metadata does not follow links.
        let meta = std::fs::symlink_metadata(entry.path())?;
        let path = entry.path();
        if meta.is_dir() {
            walk(root, &path, files)?;
        } else if meta.is_file() {
            let relative = path
                .strip_prefix(root)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            files.push(SourceFile {
                path,
                relative,
                size: meta.len(),
            });
        }
    }
    Ok(())
}

fn unreadable(root: &Path, error: &std::io::Error) -> StageFailure {
    StageFailure::new(
        Stage::Sync,
        ErrorKind::SyncError,
        FaultClass::Rejected,
        format!("source unreadable at {}: {error}", root.display()),
    )
}

/// Run the sync stage.
#[instrument(skip_all, fields(root = %root.display(), prefix = %prefix))]
pub async fn sync(
    transfer: &dyn StorageTransfer,
    root: &Path,
    prefix: &str,
) -> Result<SyncStats, StageFailure> {
    let walk_root = root.to_path_buf();
    let files = tokio::task::spawn_blocking(move || collect_files(&walk_root))
        .await
        .map_err(|e| {
            StageFailure::new(
                Stage::Sync,
                ErrorKind::SyncError,
                FaultClass::Rejected,
                format!("source walk aborted: {e}"),
            )
        })?
        .map_err(|e| unreadable(root, &e))?;

    let mut stats = SyncStats {
        prefix: prefix.to_owned(),
        ..SyncStats::default()
    };

    for file in files {
        let body = tokio::fs::read(&file.path)
            .await
            .map_err(|e| unreadable(&file.path, &e))?;
        let size = u64::try_from(body.len()).unwrap_or(file.size);
        let content_type = content_type_for(&file.relative);

        debug!(path = %file.relative, size, content_type, "uploading file");
        transfer
            .upload(prefix, &file.relative, Bytes::from(body), size, content_type)
            .await
            .map_err(|e| {
                let mut failure = StageFailure::from_provider(Stage::Sync, &e);
                failure.message = format!("upload of {} failed: {}", file.relative, e.message);
                failure
            })?;

        stats.files += 1;
        stats.bytes += size;
    }

    info!(prefix, files = stats.files, bytes = stats.bytes, "source synced");
    Ok(stats)
}

/// [`StorageTransfer`] backed by an object store.
pub struct ObjectStoreTransfer {
    store: Arc<dyn ObjectStore>,
    content_type_attributes: bool,
}

impl ObjectStoreTransfer {
    /// Create a transfer writing into `store`.
    #[must_use]
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            content_type_attributes: false,
        }
    }

    /// Attach the content type to each object as an attribute.
    ///
    /// The local filesystem backend does not support attributes.
    #[must_use]
    pub const fn with_content_type_attributes(mut self, enabled: bool) -> Self {
        self.content_type_attributes = enabled;
        self
    }

    /// The underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }
}

impl std::fmt::Debug for ObjectStoreTransfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStoreTransfer")
            .field("store", &self.store.to_string())
            .field("content_type_attributes", &self.content_type_attributes)
            .finish()
    }
}

/// Map an object store error onto a fault class.
pub(crate) fn classify(error: &object_store::Error) -> FaultClass {
    match error {
        object_store::Error::NotFound { .. } => FaultClass::NotFound,
        object_store::Error::InvalidPath { .. }
        | object_store::Error::NotSupported { .. }
        | object_store::Error::NotImplemented
        | object_store::Error::AlreadyExists { .. }
        | object_store::Error::Precondition { .. } => FaultClass::Rejected,
        _ => FaultClass::Network,
    }
}

fn store_error(context: &str, error: &object_store::Error) -> ProviderError {
    ProviderError::new(classify(error), format!("{context}: {error}"))
}

#[async_trait]
impl StorageTransfer for ObjectStoreTransfer {
    async fn upload(
        &self,
        prefix: &str,
        relative_path: &str,
        body: Bytes,
        _size_hint: u64,
        content_type: &str,
    ) -> Result<(), ProviderError> {
        let location = ObjectPath::from(format!("{prefix}/{relative_path}"));
        let mut options = PutOptions::default();
        if self.content_type_attributes {
            let mut attributes = Attributes::new();
            attributes.insert(Attribute::ContentType, content_type.to_owned().into());
            options.attributes = attributes;
        }

        self.store
            .put_opts(&location, body.into(), options)
            .await
            .map_err(|e| store_error(&format!("failed to upload {location}"), &e))?;
        Ok(())
    }

    async fn discard(&self, prefix: &str) -> Result<u64, ProviderError> {
        if prefix.trim_matches('/').is_empty() {
            return Err(ProviderError::rejected("refusing to discard the store root"));
        }
        let prefix_path = ObjectPath::from(prefix);
        let mut locations = Vec::new();
        let mut stream = self.store.list(Some(&prefix_path));
        while let Some(result) = stream.next().await {
            let meta = result.map_err(|e| store_error("failed to list partial uploads", &e))?;
            locations.push(meta.location);
        }
        drop(stream);

        let mut removed = 0;
        for location in locations {
            match self.store.delete(&location).await {
                Ok(()) | Err(object_store::Error::NotFound { .. }) => removed += 1,
                Err(e) => return Err(store_error(&format!("failed to delete {location}"), &e)),
            }
        }
        debug!(prefix, removed, "discarded partial uploads");
        Ok(removed)
    }
}
