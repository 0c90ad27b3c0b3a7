use tracing::info;

use crate::error::Result;
use crate::index::ObjectStoreIndex;

/// Engine stdout accumulated for the subject's `log.txt`.
///
/// Bytes are kept exactly as the engine printed them; only the console echo
/// is lossily decoded. Objects are replaced whole, so every flush re-uploads
/// the full log.
#[derive(Debug)]
pub(crate) struct LogSink {
    key: String,
    bytes: Vec<u8>,
    lines: usize,
    dirty: bool,
}

impl LogSink {
    pub(crate) fn new(key: String) -> Self {
        Self {
            key,
            bytes: Vec::new(),
            lines: 0,
            dirty: false,
        }
    }

    /// Record one line and echo it to the console.
    pub(crate) fn push(&mut self, line: &[u8]) {
        info!(target: "kinesync::engine", "{}", String::from_utf8_lossy(line));
        self.bytes.extend_from_slice(line);
        self.bytes.push(b'\n');
        self.lines += 1;
        self.dirty = true;
    }

    pub(crate) fn lines(&self) -> usize {
        self.lines
    }

    pub(crate) async fn flush(&mut self, index: &ObjectStoreIndex) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        index.upload_bytes(&self.key, self.bytes.clone()).await?;
        self.dirty = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::store::{MemoryObjectStore, ObjectStore};

    #[tokio::test]
    async fn persists_bytes_verbatim() -> Result<()> {
        let store = Arc::new(MemoryObjectStore::new(10));
        let index = ObjectStoreIndex::new(store.clone());
        let mut log = LogSink::new("s1/log.txt".into());

        log.flush(&index).await?;
        assert!(!store.contains("s1/log.txt"));

        log.push(b"before");
        log.push(b"\xff\xfe");
        log.flush(&index).await?;
        assert_eq!(store.get_object("s1/log.txt").await?, b"before\n\xff\xfe\n");
        assert_eq!(log.lines(), 2);
        Ok(())
    }
}
