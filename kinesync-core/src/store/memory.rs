use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

use super::{ListPage, ObjectEntry, ObjectStore, content_tag, paginate};
use crate::error::{Result, SyncError};

struct StoredObject {
    body: Vec<u8>,
    entry: ObjectEntry,
}

struct MemoryState {
    objects: BTreeMap<String, StoredObject>,
    last_stamp: DateTime<Utc>,
}

/// Ordered in-memory store with real pagination semantics.
///
/// Timestamps are strictly increasing across writes so "newer than" checks
/// never tie, and transient failures can be injected to exercise retries.
pub struct MemoryObjectStore {
    page_size: usize,
    state: Mutex<MemoryState>,
    failures_pending: AtomicUsize,
    credential_refreshes: AtomicUsize,
    list_calls: AtomicUsize,
}

impl fmt::Debug for MemoryObjectStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryObjectStore")
            .field("page_size", &self.page_size)
            .field("object_count", &self.state.lock().objects.len())
            .field("failures_pending", &self.failures_pending.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::new(1_000)
    }
}

impl MemoryObjectStore {
    /// Empty store serving `page_size` keys per page.
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size: page_size.max(1),
            state: Mutex::new(MemoryState {
                objects: BTreeMap::new(),
                last_stamp: DateTime::<Utc>::MIN_UTC,
            }),
            failures_pending: AtomicUsize::new(0),
            credential_refreshes: AtomicUsize::new(0),
            list_calls: AtomicUsize::new(0),
        }
    }

    /// Make the next `count` calls fail with [`SyncError::TransientStore`].
    pub fn fail_next(&self, count: usize) {
        self.failures_pending.store(count, Ordering::SeqCst);
    }

    /// Number of `refresh_credentials` calls.
    pub fn credential_refreshes(&self) -> usize {
        self.credential_refreshes.load(Ordering::SeqCst)
    }

    /// Number of `list` calls served, i.e. pages fetched.
    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    /// Every stored key in order.
    pub fn keys(&self) -> Vec<String> {
        self.state.lock().objects.keys().cloned().collect()
    }

    /// True when `key` is stored.
    pub fn contains(&self, key: &str) -> bool {
        self.state.lock().objects.contains_key(key)
    }

    /// Seed an object without going through the async API.
    pub fn insert(&self, key: &str, body: impl Into<Vec<u8>>) {
        let mut state = self.state.lock();
        Self::write(&mut state, key, body.into());
    }

    fn write(state: &mut MemoryState, key: &str, body: Vec<u8>) {
        let now = Utc::now();
        let stamp = if now > state.last_stamp {
            now
        } else {
            state.last_stamp + Duration::microseconds(1)
        };
        state.last_stamp = stamp;

        let entry = ObjectEntry {
            key: key.to_string(),
            size: body.len() as u64,
            e_tag: content_tag(&body),
            last_modified: stamp,
        };
        state
            .objects
            .insert(key.to_string(), StoredObject { body, entry });
    }

    fn check_injected_failure(&self) -> Result<()> {
        let outcome =
            self.failures_pending
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |pending| {
                    pending.checked_sub(1)
                });
        match outcome {
            Ok(_) => Err(SyncError::TransientStore(
                "injected transient failure".into(),
            )),
            Err(_) => Ok(()),
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn list(&self, prefix: &str, continuation: Option<&str>) -> Result<ListPage> {
        self.check_injected_failure()?;
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock();
        let entries = state
            .objects
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(_, object)| object.entry.clone());
        paginate(entries, continuation, self.page_size)
    }

    async fn get_object(&self, key: &str) -> Result<Vec<u8>> {
        self.check_injected_failure()?;
        self.state
            .lock()
            .objects
            .get(key)
            .map(|object| object.body.clone())
            .ok_or_else(|| SyncError::NotFound(key.to_string()))
    }

    async fn put_object(&self, key: &str, body: Vec<u8>) -> Result<()> {
        self.check_injected_failure()?;
        let mut state = self.state.lock();
        Self::write(&mut state, key, body);
        Ok(())
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        self.check_injected_failure()?;
        self.state.lock().objects.remove(key);
        Ok(())
    }

    async fn refresh_credentials(&self) -> Result<()> {
        self.credential_refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
