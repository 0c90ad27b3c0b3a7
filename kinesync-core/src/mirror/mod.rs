//! Scoped local materialisation of a remote subtree.
//!
//! A [`LocalMirror`] downloads every object below a remote folder into a fresh
//! scratch directory, lets a producer write into it, and pushes new or changed
//! files back one object at a time. [`LocalMirror::scope`] guarantees the final
//! upload pass runs on every exit path, including panics.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::Mutex;
use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::config::WatchConfig;
use crate::error::{Result, SyncError};
use crate::index::{ObjectStoreIndex, join};
use crate::store::content_tag;

pub mod watch;

pub use watch::{DirectoryWatcher, NotifyWatcher, PollingWatcher, WatchHandle, watcher_for};

/// How a [`LocalMirror`] is laid out and watched.
#[derive(Clone, Debug)]
pub struct MirrorOptions {
    /// Parent for the scratch directory; system temp dir when `None`.
    pub scratch_dir: Option<PathBuf>,
    /// Allow uploads below remote folders that do not exist yet.
    pub create_folders: bool,
    /// Close-write detection used while the mirror is open.
    pub watch: WatchConfig,
}

impl Default for MirrorOptions {
    fn default() -> Self {
        Self {
            scratch_dir: None,
            create_folders: true,
            watch: WatchConfig::default(),
        }
    }
}

/// Keys pushed by [`LocalMirror::close`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CloseSummary {
    /// Remote keys written, in upload order.
    pub uploaded: Vec<String>,
}

/// A remote subtree materialised into a scratch directory. Files changed
/// locally are written back by [`LocalMirror::upload_file`] or at close.
pub struct LocalMirror {
    index: Arc<ObjectStoreIndex>,
    remote_root: String,
    options: MirrorOptions,
    dir: TempDir,
    /// Content tag last known to match the remote copy, keyed by relative path.
    synced: Mutex<HashMap<PathBuf, String>>,
}

impl fmt::Debug for LocalMirror {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalMirror")
            .field("remote_root", &self.remote_root)
            .field("local", &self.dir.path())
            .field("tracked", &self.synced.lock().len())
            .finish()
    }
}

impl LocalMirror {
    /// Download the subtree rooted at `remote_root` into a new scratch dir.
    pub async fn open(
        index: Arc<ObjectStoreIndex>,
        remote_root: &str,
        options: MirrorOptions,
    ) -> Result<Self> {
        let remote_root = remote_root.trim_matches('/').to_string();
        if !index.exists(&remote_root) {
            return Err(SyncError::NotFound(remote_root));
        }

        let mut builder = tempfile::Builder::new();
        builder.prefix("kinesync-");
        let dir = match &options.scratch_dir {
            Some(parent) => {
                tokio::fs::create_dir_all(parent).await?;
                builder.tempdir_in(parent)?
            }
            None => builder.tempdir()?,
        };

        let mut synced = HashMap::new();
        for (key, _) in index.children(&remote_root) {
            let Some(relative) = relative_key(&remote_root, &key) else {
                continue;
            };
            let body = index.get_bytes(&key).await?;
            let local = dir.path().join(relative);
            if let Some(parent) = local.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            synced.insert(PathBuf::from(relative), content_tag(&body));
            tokio::fs::write(&local, body).await?;
        }

        info!(
            remote = %remote_root,
            local = %dir.path().display(),
            files = synced.len(),
            "materialised remote subtree"
        );

        Ok(Self {
            index,
            remote_root,
            options,
            dir,
            synced: Mutex::new(synced),
        })
    }

    /// Open a mirror, run `body` against it and always run [`Self::close`].
    ///
    /// A panic inside `body` is caught, the mirror is closed, and the panic
    /// resumes. When both `body` and the close fail, `body`'s error wins.
    pub async fn scope<F, Fut, T>(
        index: Arc<ObjectStoreIndex>,
        remote_root: &str,
        options: MirrorOptions,
        body: F,
    ) -> Result<T>
    where
        F: FnOnce(Arc<LocalMirror>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mirror = Arc::new(Self::open(index, remote_root, options).await?);
        let outcome = AssertUnwindSafe(body(Arc::clone(&mirror)))
            .catch_unwind()
            .await;
        let closed = mirror.close().await;

        match outcome {
            Err(panic) => {
                if let Err(err) = closed {
                    warn!(remote = %mirror.remote_root, error = %err, "upload on unwind failed");
                }
                std::panic::resume_unwind(panic)
            }
            Ok(Err(err)) => {
                if let Err(close_err) = closed {
                    warn!(remote = %mirror.remote_root, error = %close_err, "upload after failure failed");
                }
                Err(err)
            }
            Ok(Ok(value)) => closed.map(|_| value),
        }
    }

    /// Scratch directory holding the subtree.
    pub fn local_path(&self) -> &Path {
        self.dir.path()
    }

    /// Remote key the subtree was read from.
    pub fn remote_root(&self) -> &str {
        &self.remote_root
    }

    /// Watch settings this mirror was opened with.
    pub fn watch_config(&self) -> &WatchConfig {
        &self.options.watch
    }

    /// Resolve `segments` below the remote root to a key.
    ///
    /// Every segment but the last must be an existing folder unless
    /// `create_if_not_exists` is set; folders come into being implicitly when
    /// the first object below them is written.
    pub fn ensure_child(&self, segments: &[&str], create_if_not_exists: bool) -> Result<String> {
        let Some((leaf, parents)) = segments.split_last() else {
            return Err(SyncError::Internal("empty child path".into()));
        };

        let snapshot = self.index.snapshot();
        let mut path = self.remote_root.clone();
        for segment in parents.iter().chain(std::iter::once(leaf)) {
            if segment.is_empty() || segment.contains('/') {
                return Err(SyncError::Internal(format!(
                    "invalid path segment {segment:?} below {}",
                    self.remote_root
                )));
            }
        }

        for segment in parents {
            path = join(&path, segment);
            match snapshot.node(&path) {
                Some(node) if node.is_file() => {
                    return Err(SyncError::Internal(format!("{path} is a file, not a folder")));
                }
                Some(_) => {}
                None if create_if_not_exists => debug!(folder = %path, "creating remote folder"),
                None => return Err(SyncError::NotFound(path)),
            }
        }
        Ok(join(&path, leaf))
    }

    /// Upload one local file below the mirror to its remote counterpart.
    ///
    /// Returns `false` when the remote copy already has the same contents.
    pub async fn upload_file(&self, local_path: &Path) -> Result<bool> {
        let relative = self.relative_path(local_path)?;
        let body = tokio::fs::read(self.dir.path().join(&relative)).await?;
        let tag = content_tag(&body);
        if self.synced.lock().get(&relative) == Some(&tag) {
            return Ok(false);
        }

        let segments = relative
            .components()
            .map(|component| match component {
                Component::Normal(part) => part.to_str().ok_or_else(|| {
                    SyncError::Internal(format!("non UTF-8 path {}", relative.display()))
                }),
                _ => Err(SyncError::Internal(format!(
                    "unexpected path component in {}",
                    relative.display()
                ))),
            })
            .collect::<Result<Vec<_>>>()?;
        let key = self.ensure_child(&segments, self.options.create_folders)?;

        self.index.upload_bytes(&key, body).await?;
        self.synced.lock().insert(relative, tag);
        info!(key = %key, "uploaded mirrored file");
        Ok(true)
    }

    /// Upload every file created or modified since materialisation that has
    /// not already been pushed with identical contents.
    pub async fn close(&self) -> Result<CloseSummary> {
        let root = self.dir.path().to_path_buf();
        let files = tokio::task::spawn_blocking(move || walk_files(&root))
            .await
            .map_err(|err| SyncError::Internal(format!("mirror walk task failed: {err}")))??;

        let mut summary = CloseSummary::default();
        let mut first_error = None;
        for file in files {
            match self.upload_file(&file).await {
                Ok(true) => summary
                    .uploaded
                    .push(self.key_for(&file).unwrap_or_else(|| file.display().to_string())),
                Ok(false) => {}
                Err(err) => {
                    warn!(file = %file.display(), error = %err, "failed to upload mirrored file");
                    first_error.get_or_insert(err);
                }
            }
        }

        debug!(remote = %self.remote_root, uploaded = summary.uploaded.len(), "mirror closed");
        match first_error {
            Some(err) => Err(err),
            None => Ok(summary),
        }
    }

    fn relative_path(&self, local_path: &Path) -> Result<PathBuf> {
        let relative = if local_path.is_absolute() {
            local_path.strip_prefix(self.dir.path()).map_err(|_| {
                SyncError::Internal(format!(
                    "{} is outside the mirror at {}",
                    local_path.display(),
                    self.dir.path().display()
                ))
            })?
        } else {
            local_path
        };
        if relative
            .components()
            .any(|component| !matches!(component, Component::Normal(_)))
        {
            return Err(SyncError::Internal(format!(
                "{} escapes the mirror",
                local_path.display()
            )));
        }
        Ok(relative.to_path_buf())
    }

    fn key_for(&self, local_path: &Path) -> Option<String> {
        let relative = self.relative_path(local_path).ok()?;
        let relative = relative.to_str()?.replace(std::path::MAIN_SEPARATOR, "/");
        Some(join(&self.remote_root, &relative))
    }
}

fn relative_key<'a>(root: &str, key: &'a str) -> Option<&'a str> {
    if root.is_empty() {
        return Some(key);
    }
    key.strip_prefix(root)?.strip_prefix('/')
}

/// Every regular file below `root`, in no particular order.
pub(crate) fn walk_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                files.push(entry.path());
            }
        }
    }
    Ok(files)
}
