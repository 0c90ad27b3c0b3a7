//! In-memory mirror of a remote key space.
//!
//! Refreshes page through prefix listings with the store's continuation token,
//! merge the result into a fresh [`IndexSnapshot`] and swap it in atomically.
//! The generation counter only moves forward, so a coordinator never observes
//! an older snapshot after a newer refresh has completed.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};
use crate::pubsub::PubSubBus;
use crate::store::ObjectStore;

pub mod node;

pub use node::{IndexNode, IndexSnapshot, ObjectMetadata, join};

/// Outcome of one [`ObjectStoreIndex::refresh`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    /// Generation of the snapshot that was swapped in.
    pub generation: u64,
    /// Listing pages fetched.
    pub pages: usize,
    /// Entries seen across all pages.
    pub listed: usize,
    /// Keys added or whose metadata changed.
    pub updated: Vec<String>,
    /// Keys under the prefix that disappeared.
    pub removed: Vec<String>,
}

impl RefreshSummary {
    /// True when the refresh found nothing new.
    pub fn is_unchanged(&self) -> bool {
        self.updated.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug)]
enum Change {
    Updated(String, ObjectMetadata),
    Removed(String),
}

struct ChangeFeed {
    bus: Arc<PubSubBus>,
    topic_prefix: String,
}

/// Hierarchical view of an [`ObjectStore`], refreshed per prefix.
///
/// Reads are served from the current snapshot. Writes go to the store and
/// then refresh exactly the written key.
pub struct ObjectStoreIndex {
    store: Arc<dyn ObjectStore>,
    snapshot: RwLock<Arc<IndexSnapshot>>,
    writer: Mutex<()>,
    feed: Option<ChangeFeed>,
}

impl fmt::Debug for ObjectStoreIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snapshot = self.snapshot();
        f.debug_struct("ObjectStoreIndex")
            .field("generation", &snapshot.generation())
            .field("files", &snapshot.files().len())
            .field("publishes_changes", &self.feed.is_some())
            .finish()
    }
}

impl ObjectStoreIndex {
    /// Empty index over `store`; nothing is listed until the first refresh.
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            snapshot: RwLock::new(Arc::new(IndexSnapshot::default())),
            writer: Mutex::new(()),
            feed: None,
        }
    }

    /// Publish `<prefix>/update/<key>` and `<prefix>/delete/<key>` after swaps.
    /// Publish `{prefix}/update/<key>` and `{prefix}/delete/<key>` after
    /// every swap.
    pub fn with_change_feed(mut self, bus: Arc<PubSubBus>, topic_prefix: impl Into<String>) -> Self {
        self.feed = Some(ChangeFeed {
            bus,
            topic_prefix: topic_prefix.into(),
        });
        self
    }

    /// Underlying store.
    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Current snapshot; stays valid and unchanged while later refreshes run.
    pub fn snapshot(&self) -> Arc<IndexSnapshot> {
        Arc::clone(&self.snapshot.read())
    }

    /// Generation of the current snapshot.
    pub fn generation(&self) -> u64 {
        self.snapshot.read().generation()
    }

    /// List everything under `prefix` and merge it into a new snapshot,
    /// replacing whatever the previous snapshot held under that prefix.
    pub async fn refresh(&self, prefix: &str) -> Result<RefreshSummary> {
        let _writer = self.writer.lock().await;

        let mut listed = Vec::new();
        let mut pages = 0usize;
        let mut token: Option<String> = None;
        loop {
            let store = &self.store;
            let page = self
                .with_retry("list", || store.list(prefix, token.as_deref()))
                .await?;
            pages += 1;
            listed.extend(page.entries);

            match page.next_token {
                Some(next) if page.is_truncated => {
                    if token.as_deref() == Some(next.as_str()) {
                        return Err(SyncError::Internal(format!(
                            "store repeated continuation token while listing {prefix}"
                        )));
                    }
                    token = Some(next);
                }
                _ => break,
            }
        }

        let current = self.snapshot();
        let mut files: BTreeMap<String, ObjectMetadata> = current
            .files()
            .iter()
            .filter(|(key, _)| !key.starts_with(prefix))
            .map(|(key, meta)| (key.clone(), meta.clone()))
            .collect();
        let mut folders: BTreeSet<String> = current
            .folders()
            .iter()
            .filter(|folder| !format!("{folder}/").starts_with(prefix))
            .cloned()
            .collect();

        let listed_count = listed.len();
        for entry in &listed {
            if entry.key.ends_with('/') {
                folders.insert(node::normalize(&entry.key).to_string());
            } else {
                files.insert(entry.key.clone(), ObjectMetadata::from(entry));
            }
        }

        let mut changes = Vec::new();
        for (key, meta) in files.iter().filter(|(key, _)| key.starts_with(prefix)) {
            if current.files().get(key) != Some(meta) {
                changes.push(Change::Updated(key.clone(), meta.clone()));
            }
        }
        for key in current.files().keys().filter(|key| key.starts_with(prefix)) {
            if !files.contains_key(key) {
                changes.push(Change::Removed(key.clone()));
            }
        }

        let generation = current.generation() + 1;
        let next = IndexSnapshot::build(generation, files, folders);
        *self.snapshot.write() = Arc::new(next);
        drop(_writer);

        let mut summary = RefreshSummary {
            generation,
            pages,
            listed: listed_count,
            ..RefreshSummary::default()
        };
        for change in &changes {
            match change {
                Change::Updated(key, _) => summary.updated.push(key.clone()),
                Change::Removed(key) => summary.removed.push(key.clone()),
            }
        }

        debug!(
            prefix,
            generation,
            pages,
            listed = listed_count,
            updated = summary.updated.len(),
            removed = summary.removed.len(),
            "index refreshed"
        );
        self.notify(changes);
        Ok(summary)
    }

    /// Names one segment below `folder`, without listing the subtree.
    pub fn list_immediate_children(&self, folder: &str) -> Vec<String> {
        self.snapshot().immediate_children(folder)
    }

    /// Metadata of a file; [`SyncError::NotFound`] when the index lacks it.
    pub fn get_metadata(&self, path: &str) -> Result<ObjectMetadata> {
        self.snapshot()
            .metadata(path)
            .cloned()
            .ok_or_else(|| SyncError::NotFound(path.to_string()))
    }

    /// True for indexed files and folders.
    pub fn exists(&self, path: &str) -> bool {
        self.snapshot().exists(path)
    }

    /// Every file below `folder` with its metadata.
    pub fn children(&self, folder: &str) -> Vec<(String, ObjectMetadata)> {
        let snapshot = self.snapshot();
        let Some(node) = snapshot.node(folder) else {
            return Vec::new();
        };
        node.files()
            .into_iter()
            .filter_map(|file| file.metadata.clone().map(|meta| (file.path.clone(), meta)))
            .collect()
    }

    /// Fetch an object, retrying once after a credential refresh.
    pub async fn get_bytes(&self, key: &str) -> Result<Vec<u8>> {
        let store = &self.store;
        self.with_retry("get", || store.get_object(key)).await
    }

    /// Fetch an object as UTF-8 text.
    pub async fn get_text(&self, key: &str) -> Result<String> {
        let bytes = self.get_bytes(key).await?;
        String::from_utf8(bytes)
            .map_err(|err| SyncError::Internal(format!("{key} is not valid UTF-8: {err}")))
    }

    /// Fetch and decode a JSON object.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let bytes = self.get_bytes(key).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Whole-object put followed by a targeted refresh of that key.
    pub async fn upload_bytes(&self, key: &str, body: Vec<u8>) -> Result<()> {
        let store = &self.store;
        self.with_retry("put", || store.put_object(key, body.clone()))
            .await?;
        self.refresh(key).await?;
        Ok(())
    }

    /// [`ObjectStoreIndex::upload_bytes`] for text.
    pub async fn upload_text(&self, key: &str, text: &str) -> Result<()> {
        self.upload_bytes(key, text.as_bytes().to_vec()).await
    }

    /// Upload `value` as pretty-printed JSON.
    pub async fn upload_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        self.upload_bytes(key, serde_json::to_vec_pretty(value)?).await
    }

    /// Remote delete plus local removal. Absent paths are a no-op.
    pub async fn delete(&self, key: &str) -> Result<()> {
        let store = &self.store;
        self.with_retry("delete", || store.delete_object(key)).await?;

        let existed = self.remove_local(|candidate| candidate == key).await;
        if !existed.is_empty() {
            info!(key, "deleted object");
        }
        self.notify(existed.into_iter().map(Change::Removed).collect());
        Ok(())
    }

    /// Delete every object under `folder`.
    ///
    /// Works from a fresh remote listing, so retrying after a partial run (or
    /// racing another worker doing the same) converges on an empty folder.
    pub async fn delete_prefix(&self, folder: &str) -> Result<usize> {
        let prefix = format!("{}/", node::normalize(folder));
        self.refresh(&prefix).await?;

        let snapshot = self.snapshot();
        let doomed: Vec<String> = snapshot
            .files()
            .keys()
            .filter(|key| key.starts_with(&prefix))
            .cloned()
            .chain(
                snapshot
                    .folders()
                    .iter()
                    .filter(|f| format!("{f}/").starts_with(&prefix))
                    .map(|f| format!("{f}/")),
            )
            .collect();

        let store = &self.store;
        for key in &doomed {
            self.with_retry("delete", || store.delete_object(key)).await?;
        }

        let removed = self.remove_local(|candidate| candidate.starts_with(&prefix)).await;
        info!(folder = %prefix, deleted = doomed.len(), "deleted prefix");
        self.notify(removed.into_iter().map(Change::Removed).collect());
        Ok(doomed.len())
    }

    async fn remove_local<F>(&self, doomed: F) -> Vec<String>
    where
        F: Fn(&str) -> bool,
    {
        let _writer = self.writer.lock().await;
        let current = self.snapshot();

        let removed: Vec<String> = current
            .files()
            .keys()
            .filter(|key| doomed(key))
            .cloned()
            .collect();
        let folders: BTreeSet<String> = current
            .folders()
            .iter()
            .filter(|folder| !doomed(&format!("{folder}/")))
            .cloned()
            .collect();
        if removed.is_empty() && folders.len() == current.folders().len() {
            return removed;
        }

        let files = current
            .files()
            .iter()
            .filter(|(key, _)| !doomed(key))
            .map(|(key, meta)| (key.clone(), meta.clone()))
            .collect();
        let next = IndexSnapshot::build(current.generation() + 1, files, folders);
        *self.snapshot.write() = Arc::new(next);
        removed
    }

    /// Run a store call, retrying exactly once after a credential refresh when
    /// it fails transiently.
    async fn with_retry<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match call().await {
            Err(SyncError::TransientStore(reason)) => {
                warn!(operation, %reason, "transient store failure; refreshing credentials and retrying");
                self.store.refresh_credentials().await?;
                call().await
            }
            other => other,
        }
    }

    fn notify(&self, changes: Vec<Change>) {
        let Some(feed) = &self.feed else {
            return;
        };

        for change in changes {
            let (topic, payload) = match change {
                Change::Updated(key, meta) => (
                    join(&join(&feed.topic_prefix, "update"), &key),
                    json!({
                        "key": key,
                        "size": meta.size,
                        "e_tag": meta.e_tag,
                        "last_modified": meta.last_modified,
                    }),
                ),
                Change::Removed(key) => (
                    join(&join(&feed.topic_prefix, "delete"), &key),
                    json!({ "key": key }),
                ),
            };
            if let Err(err) = feed.bus.publish(&topic, payload) {
                warn!(topic = %topic, error = %err, "skipping change notification");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryObjectStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn seeded(page_size: usize) -> Arc<MemoryObjectStore> {
        let store = Arc::new(MemoryObjectStore::new(page_size));
        store.insert("data/s1/_subject.json", r#"{"state":"pending"}"#);
        store.insert("data/s1/trials/t1/markers.trc", "x");
        store.insert("data/s2/_subject.json", "{}");
        store.insert("other/file", "y");
        store
    }

    #[tokio::test]
    async fn refresh_follows_continuation_tokens() -> Result<()> {
        let store = seeded(1);
        let index = ObjectStoreIndex::new(store.clone());

        let summary = index.refresh("data/").await?;
        assert_eq!(summary.listed, 3);
        assert_eq!(summary.pages, 3);
        assert!(index.exists("data/s1/trials/t1/markers.trc"));
        assert!(!index.exists("other/file"));
        Ok(())
    }

    #[tokio::test]
    async fn refresh_is_idempotent_on_unchanged_store() -> Result<()> {
        let index = ObjectStoreIndex::new(seeded(2));
        index.refresh("").await?;
        let first = index.snapshot();

        let summary = index.refresh("").await?;
        let second = index.snapshot();

        assert!(summary.is_unchanged());
        assert!(first.same_contents(&second));
        assert!(second.generation() > first.generation());
        Ok(())
    }

    #[tokio::test]
    async fn refresh_drops_stale_entries_under_prefix_only() -> Result<()> {
        let store = seeded(10);
        let index = ObjectStoreIndex::new(store.clone());
        index.refresh("").await?;

        store.delete_object("data/s2/_subject.json").await?;
        store.insert("other/file", "changed");
        let summary = index.refresh("data/").await?;

        assert_eq!(summary.removed, vec!["data/s2/_subject.json".to_string()]);
        assert!(!index.exists("data/s2"));
        // Outside the refreshed prefix the old metadata is kept.
        assert_eq!(index.get_metadata("other/file")?.size, 1);
        Ok(())
    }

    #[tokio::test]
    async fn old_snapshot_stays_readable_during_refresh() -> Result<()> {
        let store = seeded(10);
        let index = ObjectStoreIndex::new(store.clone());
        index.refresh("").await?;
        let held = index.snapshot();

        store.insert("data/s3/_subject.json", "{}");
        index.refresh("").await?;

        assert!(!held.exists("data/s3"));
        assert!(index.exists("data/s3"));
        Ok(())
    }

    #[tokio::test]
    async fn immediate_children_and_metadata_lookups() -> Result<()> {
        let index = ObjectStoreIndex::new(seeded(10));
        index.refresh("").await?;

        assert_eq!(index.list_immediate_children("data"), vec!["s1", "s2"]);
        assert_eq!(
            index.list_immediate_children("data/s1"),
            vec!["_subject.json", "trials"]
        );
        let err = index.get_metadata("data/nope.json").unwrap_err();
        assert!(err.is_not_found());
        Ok(())
    }

    #[tokio::test]
    async fn delete_is_idempotent() -> Result<()> {
        let store = seeded(10);
        let index = ObjectStoreIndex::new(store.clone());
        index.refresh("").await?;

        index.delete("data/s2/_subject.json").await?;
        index.delete("data/s2/_subject.json").await?;
        index.delete("never/existed").await?;

        assert!(!store.contains("data/s2/_subject.json"));
        assert!(index.get_metadata("data/s2/_subject.json").is_err());
        Ok(())
    }

    #[tokio::test]
    async fn delete_prefix_clears_subtree() -> Result<()> {
        let store = seeded(10);
        let index = ObjectStoreIndex::new(store.clone());
        index.refresh("").await?;

        let deleted = index.delete_prefix("data/s1").await?;
        assert_eq!(deleted, 2);
        assert_eq!(index.delete_prefix("data/s1").await?, 0);
        assert!(!index.exists("data/s1"));
        assert!(store.contains("data/s2/_subject.json"));
        Ok(())
    }

    #[tokio::test]
    async fn transient_failure_retries_once_after_credential_refresh() -> Result<()> {
        let store = seeded(10);
        let index = ObjectStoreIndex::new(store.clone());

        store.fail_next(1);
        index.refresh("").await?;
        assert_eq!(store.credential_refreshes(), 1);

        store.fail_next(2);
        let err = index.get_bytes("data/s1/_subject.json").await.unwrap_err();
        assert!(matches!(err, SyncError::TransientStore(_)));
        assert_eq!(store.credential_refreshes(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn uploads_and_deletes_are_published() -> Result<()> {
        let bus = Arc::new(PubSubBus::loopback());
        bus.connect()?;
        let updates = Arc::new(AtomicUsize::new(0));
        let deletes = Arc::new(AtomicUsize::new(0));
        {
            let updates = Arc::clone(&updates);
            bus.subscribe("index/update/data/#", move |_| {
                updates.fetch_add(1, Ordering::SeqCst);
            })?;
            let deletes = Arc::clone(&deletes);
            bus.subscribe("index/delete/#", move |_| {
                deletes.fetch_add(1, Ordering::SeqCst);
            })?;
        }

        let index = ObjectStoreIndex::new(seeded(10)).with_change_feed(bus, "index");
        index.refresh("").await?;
        assert_eq!(updates.load(Ordering::SeqCst), 3);

        index.upload_text("data/s1/log.txt", "hello").await?;
        assert_eq!(updates.load(Ordering::SeqCst), 4);
        assert_eq!(index.get_text("data/s1/log.txt").await?, "hello");

        index.delete("data/s1/log.txt").await?;
        assert_eq!(deletes.load(Ordering::SeqCst), 1);

        // Unchanged refresh publishes nothing.
        index.refresh("").await?;
        assert_eq!(updates.load(Ordering::SeqCst), 4);
        Ok(())
    }
}
