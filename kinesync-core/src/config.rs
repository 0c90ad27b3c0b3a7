use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Global knobs for a single worker process.
///
/// All fields carry defaults so a deployment can supply a partial payload and
/// pick up the rest from here.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SyncConfig {
    /// Which slice of the store is mirrored and scanned for subjects.
    pub index: IndexConfig,
    /// Local filesystem store settings.
    pub store: StoreConfig,
    /// Pub/sub heartbeat and change topic settings.
    pub bus: BusConfig,
    /// Directory watch strategy used while the engine runs.
    pub watch: WatchConfig,
    /// External engine invocation.
    pub engine: EngineConfig,
    /// Candidate selection and reclaim policy.
    pub coordinator: CoordinatorConfig,
}

/// Index scope and change notifications.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Prefix under which subjects are discovered, e.g. `protected/`.
    pub dataset_prefix: String,
    /// Publish `update/<key>` and `delete/<key>` notifications after each swap.
    pub publish_changes: bool,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            dataset_prefix: String::new(),
            publish_changes: true,
        }
    }
}

/// Object store location and listing page size.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Root directory for the filesystem-backed store.
    pub root: Option<PathBuf>,
    /// Maximum entries returned per listing page.
    pub page_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: None,
            page_size: 1_000,
        }
    }
}

/// Heartbeat cadence and change topic naming.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Cadence for publishing liveness heartbeats from the run loop.
    pub heartbeat_interval_ms: u64,
    /// Leading segment for index change notifications.
    pub change_topic_prefix: String,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 10_000,
            change_topic_prefix: "index".to_string(),
        }
    }
}

impl BusConfig {
    /// Heartbeat cadence, never zero.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }
}

/// How close-write events are detected below a mirrored directory.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchStrategy {
    /// Native notifications where they report close-write, polling elsewhere.
    #[default]
    Auto,
    /// Always use `notify`.
    Native,
    /// Always poll size and mtime.
    Poll,
}

/// Tuning controls for the mirror's directory watch.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Detection mechanism.
    pub strategy: WatchStrategy,
    /// Polling cadence in milliseconds for the polling fallback.
    pub poll_interval_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            strategy: WatchStrategy::Auto,
            poll_interval_ms: Self::default_poll_interval_ms(),
        }
    }
}

impl WatchConfig {
    const fn default_poll_interval_ms() -> u64 {
        250
    }

    /// Polling cadence, never zero.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// How the external engine is launched and supervised.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Executable invoked with the materialized subject path.
    pub program: String,
    /// Extra arguments placed before the subject path.
    pub args: Vec<String>,
    /// Optional `--output-name` forwarded to the engine.
    pub output_name: Option<String>,
    /// Optional `--href` reference URL forwarded to the engine.
    pub reference_url: Option<String>,
    /// Kill the engine after this many seconds. `None` waits forever.
    pub timeout_secs: Option<u64>,
    /// How often buffered stdout is pushed to the remote log object.
    pub log_flush_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            program: "engine".to_string(),
            args: Vec::new(),
            output_name: None,
            reference_url: None,
            timeout_secs: None,
            log_flush_interval_ms: 5_000,
        }
    }
}

impl EngineConfig {
    /// Wall-clock limit for one run.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    /// Periodic log upload cadence, never zero.
    pub fn log_flush_interval(&self) -> Duration {
        Duration::from_millis(self.log_flush_interval_ms.max(1))
    }
}

/// Candidate ordering among eligible subjects.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// Every eligible subject is equally likely.
    #[default]
    Uniform,
    /// Weight by how long the newest unprocessed input has been waiting.
    WeightedByStaleness,
}

/// When a `processing` record left by another worker may be taken over.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReclaimPolicy {
    /// Any `processing` unit that still lacks output is fair game.
    Immediate,
    /// Skip `processing` records younger than this many seconds.
    AfterSecs(u64),
}

impl Default for ReclaimPolicy {
    fn default() -> Self {
        ReclaimPolicy::AfterSecs(3_600)
    }
}

/// Run loop cadence, worker identity and claiming policy.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Identity stamped into status records. Generated when empty.
    pub worker_id: String,
    /// Sleep between passes that found nothing to do or whose engine failed.
    pub poll_interval_ms: u64,
    /// Parent directory for local mirrors; system temp dir when unset.
    pub scratch_dir: Option<PathBuf>,
    /// Ordering of eligible subjects.
    pub selection: SelectionStrategy,
    /// Whether other workers' `processing` records may be taken over.
    pub reclaim: ReclaimPolicy,
    /// Fixed RNG seed, only useful for reproducing a selection order.
    pub rng_seed: Option<u64>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            worker_id: String::new(),
            poll_interval_ms: 30_000,
            scratch_dir: None,
            selection: SelectionStrategy::Uniform,
            reclaim: ReclaimPolicy::default(),
            rng_seed: None,
        }
    }
}

impl CoordinatorConfig {
    /// Back-off between passes.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
