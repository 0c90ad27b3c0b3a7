//! Close-write detection below a mirrored directory.
//!
//! Both implementations hand out a [`WatchHandle`] yielding paths whose
//! producer has finished writing. Files already present when the watch starts
//! are never reported. Dropping the handle stops the watch; calling
//! [`DirectoryWatcher::watch`] again starts a fresh one.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use notify::event::{AccessKind, AccessMode};
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::{WatchConfig, WatchStrategy};
use crate::error::{Result, SyncError};

const CHANNEL_CAPACITY: usize = 1_024;

/// Reports files below a directory once their writer has finished with them.
pub trait DirectoryWatcher: Send + Sync + fmt::Debug {
    /// Start watching `root` recursively. Must be called inside a Tokio runtime.
    fn watch(&self, root: &Path) -> Result<WatchHandle>;
}

enum WatchGuard {
    Native(RecommendedWatcher),
    Poller(JoinHandle<()>),
}

impl Drop for WatchGuard {
    fn drop(&mut self) {
        if let WatchGuard::Poller(task) = self {
            task.abort();
        }
    }
}

/// Live watch; dropping it stops the watch.
pub struct WatchHandle {
    ready: mpsc::Receiver<PathBuf>,
    guard: WatchGuard,
}

impl fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.guard {
            WatchGuard::Native(_) => "native",
            WatchGuard::Poller(_) => "polling",
        };
        f.debug_struct("WatchHandle")
            .field("kind", &kind)
            .field("queued", &self.ready.len())
            .finish()
    }
}

impl WatchHandle {
    /// Next finished file. `None` once the watch has shut down.
    pub async fn next(&mut self) -> Option<PathBuf> {
        self.ready.recv().await
    }

    /// Everything already reported without waiting.
    pub fn drain_ready(&mut self) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        while let Ok(path) = self.ready.try_recv() {
            paths.push(path);
        }
        paths
    }
}

/// OS notifications via `notify`; reports `Close(Write)` access events, which
/// inotify delivers once the writer closes the file.
#[derive(Clone, Copy, Debug, Default)]
pub struct NotifyWatcher;

impl DirectoryWatcher for NotifyWatcher {
    fn watch(&self, root: &Path) -> Result<WatchHandle> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let root_display = root.display().to_string();

        let mut watcher = RecommendedWatcher::new(
            move |res: std::result::Result<Event, notify::Error>| match res {
                Ok(event) => {
                    if !matches!(event.kind, EventKind::Access(AccessKind::Close(AccessMode::Write))) {
                        return;
                    }
                    for path in event.paths {
                        if let Err(err) = tx.blocking_send(path) {
                            debug!(root = %root_display, error = %err, "watch receiver gone");
                            return;
                        }
                    }
                }
                Err(err) => warn!(root = %root_display, error = %err, "native watch error"),
            },
            NotifyConfig::default(),
        )
        .map_err(|err| {
            SyncError::Watch(format!("failed to create watcher for {}: {err}", root.display()))
        })?;

        watcher
            .watch(root, RecursiveMode::Recursive)
            .map_err(|err| SyncError::Watch(format!("failed to watch {}: {err}", root.display())))?;

        Ok(WatchHandle {
            ready: rx,
            guard: WatchGuard::Native(watcher),
        })
    }
}

/// Portable fallback: a file is reported once its size and mtime are the same
/// on two consecutive polls.
#[derive(Clone, Copy, Debug)]
pub struct PollingWatcher {
    interval: Duration,
}

impl PollingWatcher {
    /// Poll every `interval`, at least once per millisecond.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval: interval.max(Duration::from_millis(1)),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Stamp {
    len: u64,
    modified: Option<SystemTime>,
}

#[derive(Debug)]
struct Observed {
    stamp: Stamp,
    reported: bool,
}

fn scan(root: &Path) -> Result<HashMap<PathBuf, Stamp>> {
    let mut stamps = HashMap::new();
    for path in super::walk_files(root)? {
        // Files can vanish between listing and stat.
        let Ok(meta) = std::fs::metadata(&path) else {
            continue;
        };
        stamps.insert(
            path,
            Stamp {
                len: meta.len(),
                modified: meta.modified().ok(),
            },
        );
    }
    Ok(stamps)
}

impl DirectoryWatcher for PollingWatcher {
    fn watch(&self, root: &Path) -> Result<WatchHandle> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let root = root.to_path_buf();
        let mut seen: HashMap<PathBuf, Observed> = scan(&root)?
            .into_iter()
            .map(|(path, stamp)| {
                (
                    path,
                    Observed {
                        stamp,
                        reported: true,
                    },
                )
            })
            .collect();
        let interval = self.interval;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let scan_root = root.clone();
                let current = match tokio::task::spawn_blocking(move || scan(&scan_root)).await {
                    Ok(Ok(current)) => current,
                    Ok(Err(err)) => {
                        warn!(root = %root.display(), error = %err, "poll scan failed");
                        continue;
                    }
                    Err(err) => {
                        warn!(root = %root.display(), error = %err, "poll scan task failed");
                        continue;
                    }
                };

                seen.retain(|path, _| current.contains_key(path));
                let mut ready = Vec::new();
                for (path, stamp) in current {
                    match seen.get_mut(&path) {
                        Some(observed) if observed.stamp == stamp => {
                            if !observed.reported {
                                observed.reported = true;
                                ready.push(path);
                            }
                        }
                        Some(observed) => {
                            observed.stamp = stamp;
                            observed.reported = false;
                        }
                        None => {
                            seen.insert(
                                path,
                                Observed {
                                    stamp,
                                    reported: false,
                                },
                            );
                        }
                    }
                }

                for path in ready {
                    if tx.send(path).await.is_err() {
                        return;
                    }
                }
            }
        });

        Ok(WatchHandle {
            ready: rx,
            guard: WatchGuard::Poller(task),
        })
    }
}

/// Pick the watcher for a strategy. `Auto` uses native notifications on Linux,
/// where inotify reports close-write, and polling everywhere else.
pub fn watcher_for(config: &WatchConfig) -> Arc<dyn DirectoryWatcher> {
    let native = match config.strategy {
        WatchStrategy::Native => true,
        WatchStrategy::Poll => false,
        WatchStrategy::Auto => cfg!(target_os = "linux"),
    };
    if native {
        Arc::new(NotifyWatcher)
    } else {
        Arc::new(PollingWatcher::new(config.poll_interval()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    #[tokio::test]
    async fn polling_reports_new_files_once_stable() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("existing.trc"), "old").unwrap();

        let mut handle = PollingWatcher::new(Duration::from_millis(20))
            .watch(dir.path())
            .unwrap();
        std::fs::write(dir.path().join("result.json"), "{}").unwrap();

        let path = timeout(Duration::from_secs(5), handle.next())
            .await
            .expect("file reported")
            .unwrap();
        assert_eq!(path.file_name().unwrap(), "result.json");

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(handle.drain_ready().is_empty());
    }

    #[tokio::test]
    async fn polling_reports_rewrites_again() {
        let dir = tempfile::tempdir().unwrap();
        let mut handle = PollingWatcher::new(Duration::from_millis(20))
            .watch(dir.path())
            .unwrap();

        let file = dir.path().join("log.txt");
        std::fs::write(&file, "a").unwrap();
        timeout(Duration::from_secs(5), handle.next()).await.unwrap();

        std::fs::write(&file, "abc").unwrap();
        let again = timeout(Duration::from_secs(5), handle.next()).await.unwrap();
        assert_eq!(again.as_deref(), Some(file.as_path()));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn native_reports_close_write() {
        let dir = tempfile::tempdir().unwrap();
        let mut handle = NotifyWatcher.watch(dir.path()).unwrap();

        let nested = dir.path().join("out");
        std::fs::create_dir(&nested).unwrap();
        // Give inotify a moment to pick up the new directory.
        tokio::time::sleep(Duration::from_millis(100)).await;
        std::fs::write(nested.join("model.osim"), "model").unwrap();

        let path = timeout(Duration::from_secs(5), handle.next())
            .await
            .expect("close-write reported")
            .unwrap();
        assert_eq!(path.file_name().unwrap(), "model.osim");
    }

    #[test]
    fn strategy_selection() {
        let poll = WatchConfig {
            strategy: WatchStrategy::Poll,
            ..WatchConfig::default()
        };
        assert!(format!("{:?}", watcher_for(&poll)).contains("PollingWatcher"));

        let native = WatchConfig {
            strategy: WatchStrategy::Native,
            ..WatchConfig::default()
        };
        assert!(format!("{:?}", watcher_for(&native)).contains("NotifyWatcher"));
    }
}
