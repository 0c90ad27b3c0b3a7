//! Object store collaborator.
//!
//! The index only ever talks to the store through [`ObjectStore`]: paginated
//! prefix listings plus whole-object get/put/delete. Keys are `/`-delimited and
//! a trailing `/` marks a folder placeholder by convention only.

use std::fmt;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Result, SyncError};

pub mod fs;
pub mod memory;

pub use fs::FsObjectStore;
pub use memory::MemoryObjectStore;

/// One object as reported by a listing page.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectEntry {
    /// Full key; a trailing `/` marks a folder placeholder.
    pub key: String,
    /// Size in bytes.
    pub size: u64,
    /// Content tag, changes whenever the body does.
    pub e_tag: String,
    /// Last write time.
    pub last_modified: DateTime<Utc>,
}

/// A single page of a prefix listing.
#[derive(Clone, Debug, Default)]
pub struct ListPage {
    /// Entries in key order.
    pub entries: Vec<ObjectEntry>,
    /// Opaque cursor for the next page; only meaningful when `is_truncated`.
    pub next_token: Option<String>,
    /// More entries follow this page.
    pub is_truncated: bool,
}

/// Flat key/value object store with paginated prefix listings.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// One page of keys starting with `prefix`, after `continuation`.
    async fn list(&self, prefix: &str, continuation: Option<&str>) -> Result<ListPage>;

    /// Whole body of `key`; [`SyncError::NotFound`] when absent.
    async fn get_object(&self, key: &str) -> Result<Vec<u8>>;

    /// Create or replace `key`.
    async fn put_object(&self, key: &str, body: Vec<u8>) -> Result<()>;

    /// Deleting a missing key is not an error.
    async fn delete_object(&self, key: &str) -> Result<()>;

    /// Called once before retrying a call that failed with
    /// [`SyncError::TransientStore`].
    async fn refresh_credentials(&self) -> Result<()> {
        Ok(())
    }
}

impl fmt::Debug for dyn ObjectStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("dyn ObjectStore")
    }
}

pub(crate) fn encode_token(last_key: &str) -> String {
    URL_SAFE_NO_PAD.encode(last_key.as_bytes())
}

pub(crate) fn decode_token(token: &str) -> Result<String> {
    let raw = URL_SAFE_NO_PAD
        .decode(token)
        .map_err(|err| SyncError::Internal(format!("invalid continuation token: {err}")))?;
    String::from_utf8(raw)
        .map_err(|err| SyncError::Internal(format!("invalid continuation token: {err}")))
}

pub(crate) fn content_tag(body: &[u8]) -> String {
    let digest = Sha256::digest(body);
    hex::encode(&digest[..16])
}

/// Cut a sorted key sequence into one page starting after `continuation`.
pub(crate) fn paginate<I>(
    entries: I,
    continuation: Option<&str>,
    page_size: usize,
) -> Result<ListPage>
where
    I: IntoIterator<Item = ObjectEntry>,
{
    let after = continuation.map(decode_token).transpose()?;
    let page_size = page_size.max(1);

    let mut remaining = entries
        .into_iter()
        .filter(|entry| after.as_deref().is_none_or(|after| entry.key.as_str() > after))
        .peekable();

    let mut page = Vec::with_capacity(page_size);
    while page.len() < page_size {
        match remaining.next() {
            Some(entry) => page.push(entry),
            None => break,
        }
    }

    let is_truncated = remaining.peek().is_some();
    let next_token = if is_truncated {
        page.last().map(|entry| encode_token(&entry.key))
    } else {
        None
    };

    Ok(ListPage {
        entries: page,
        next_token,
        is_truncated,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: &str) -> ObjectEntry {
        ObjectEntry {
            key: key.to_string(),
            size: 1,
            e_tag: "x".into(),
            last_modified: Utc::now(),
        }
    }

    #[test]
    fn paginate_resumes_after_token() {
        let keys = ["a", "b", "c", "d", "e"];
        let first = paginate(keys.iter().map(|k| entry(k)), None, 2).unwrap();
        assert!(first.is_truncated);
        assert_eq!(first.entries.len(), 2);

        let token = first.next_token.clone().unwrap();
        let second = paginate(keys.iter().map(|k| entry(k)), Some(&token), 2).unwrap();
        assert_eq!(
            second.entries.iter().map(|e| e.key.as_str()).collect::<Vec<_>>(),
            vec!["c", "d"]
        );

        let token = second.next_token.unwrap();
        let last = paginate(keys.iter().map(|k| entry(k)), Some(&token), 2).unwrap();
        assert!(!last.is_truncated);
        assert!(last.next_token.is_none());
        assert_eq!(last.entries.len(), 1);
    }

    #[test]
    fn rejects_garbage_tokens() {
        let err = paginate(Vec::new(), Some("!!not-base64!!"), 10).unwrap_err();
        assert!(matches!(err, SyncError::Internal(_)));
    }
}
