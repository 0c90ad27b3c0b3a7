use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::task::spawn_blocking;

use super::{ListPage, ObjectEntry, ObjectStore, paginate};
use crate::error::{Result, SyncError};

const TMP_SUFFIX: &str = ".kinesync-tmp";

/// Store backed by a local directory tree, one file per key.
///
/// Puts are written to a sibling temp file and renamed into place so readers
/// never observe a partially written object.
#[derive(Clone, Debug)]
pub struct FsObjectStore {
    root: PathBuf,
    page_size: usize,
}

impl FsObjectStore {
    /// Store rooted at `root`, listing at most `page_size` keys per page.
    pub fn new(root: impl Into<PathBuf>, page_size: usize) -> Self {
        Self {
            root: root.into(),
            page_size: page_size.max(1),
        }
    }

    /// Directory holding the objects.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Deepest directory whose subtree holds every key starting with
    /// `prefix`: everything before the prefix's last `/`.
    fn listing_base(&self, prefix: &str) -> Result<PathBuf> {
        let folder = prefix.rsplit_once('/').map_or("", |(folder, _)| folder);
        self.resolve(folder)
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        let mut path = self.root.clone();
        for component in Path::new(key.trim_end_matches('/')).components() {
            match component {
                Component::Normal(segment) => path.push(segment),
                Component::CurDir => {}
                _ => {
                    return Err(SyncError::Internal(format!(
                        "key escapes store root: {key}"
                    )));
                }
            }
        }
        Ok(path)
    }
}

fn blocking_err(err: tokio::task::JoinError) -> SyncError {
    SyncError::Internal(format!("blocking store task failed: {err}"))
}

fn collect_entries(root: &Path, dir: &Path, out: &mut Vec<ObjectEntry>) -> io::Result<()> {
    let mut children = 0usize;
    for item in fs::read_dir(dir)? {
        let item = item?;
        let path = item.path();
        let name = item.file_name();
        if name.to_string_lossy().ends_with(TMP_SUFFIX) {
            continue;
        }
        children += 1;
        let meta = item.metadata()?;
        if meta.is_dir() {
            collect_entries(root, &path, out)?;
        } else {
            out.push(entry_for(root, &path, &meta, false));
        }
    }

    if children == 0 && dir != root {
        let meta = fs::metadata(dir)?;
        out.push(entry_for(root, dir, &meta, true));
    }
    Ok(())
}

fn entry_for(root: &Path, path: &Path, meta: &fs::Metadata, folder: bool) -> ObjectEntry {
    let rel = path.strip_prefix(root).unwrap_or(path);
    let mut key = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/");
    if folder {
        key.push('/');
    }

    let modified: DateTime<Utc> = meta
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());
    let size = if folder { 0 } else { meta.len() };
    let nanos = modified.timestamp_nanos_opt().unwrap_or_default();

    ObjectEntry {
        key,
        size,
        e_tag: format!("{nanos:x}-{size:x}"),
        last_modified: modified,
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn list(&self, prefix: &str, continuation: Option<&str>) -> Result<ListPage> {
        let root = self.root.clone();
        let base = self.listing_base(prefix)?;
        let mut entries = spawn_blocking(move || -> io::Result<Vec<ObjectEntry>> {
            let mut out = Vec::new();
            if base.is_dir() {
                collect_entries(&root, &base, &mut out)?;
            }
            Ok(out)
        })
        .await
        .map_err(blocking_err)??;

        entries.retain(|entry| entry.key.starts_with(prefix));
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        paginate(entries, continuation, self.page_size)
    }

    async fn get_object(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.resolve(key)?;
        match tokio::fs::read(&path).await {
            Ok(body) => Ok(body),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(SyncError::NotFound(key.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn put_object(&self, key: &str, body: Vec<u8>) -> Result<()> {
        let path = self.resolve(key)?;
        if key.ends_with('/') {
            tokio::fs::create_dir_all(&path).await?;
            return Ok(());
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut tmp = path.clone().into_os_string();
        tmp.push(TMP_SUFFIX);
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        let path = self.resolve(key)?;
        let outcome = if key.ends_with('/') {
            tokio::fs::remove_dir(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        match outcome {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
