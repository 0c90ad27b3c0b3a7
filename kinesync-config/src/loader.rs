use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, anyhow};
use kinesync_core::config::SyncConfig;
use serde::{Deserialize, Serialize};

use crate::validation::{self, ConfigWarning, ConfigWarnings};

/// Files tried, in order, when neither a path nor an environment source is set.
const DEFAULT_CONFIG_LOCATIONS: &[&str] =
    &["kinesync.toml", "kinesync.json", "config/kinesync.toml"];

/// Path to a TOML or JSON config file.
pub const CONFIG_PATH_VAR: &str = "KINESYNC_CONFIG_PATH";
/// Whole configuration as inline JSON.
pub const CONFIG_JSON_VAR: &str = "KINESYNC_CONFIG_JSON";
/// Overrides `coordinator.worker_id`.
pub const WORKER_ID_VAR: &str = "KINESYNC_WORKER_ID";
/// Overrides `index.dataset_prefix`.
pub const DATASET_PREFIX_VAR: &str = "KINESYNC_DATASET_PREFIX";
/// Overrides `store.root`.
pub const STORE_ROOT_VAR: &str = "KINESYNC_STORE_ROOT";
/// Overrides `coordinator.poll_interval_ms`; accepts `30s` or bare millis.
pub const POLL_INTERVAL_VAR: &str = "KINESYNC_POLL_INTERVAL";

/// Everything a worker process needs, as read from disk or the environment.
///
/// The component sections sit at the top level of the file:
///
/// ```toml
/// expected_workers = 4
///
/// [index]
/// dataset_prefix = "protected/"
///
/// [engine]
/// program = "/opt/fit/bin/fit"
/// timeout_secs = 7200
///
/// [coordinator]
/// reclaim = { after_secs = 3600 }
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Component settings shared with `kinesync-core`.
    #[serde(flatten)]
    pub sync: SyncConfig,
    /// How many workers the deployment runs against the same dataset. Only
    /// used to judge whether the reclaim policy is safe.
    pub expected_workers: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            sync: SyncConfig::default(),
            expected_workers: 1,
        }
    }
}

/// Encodings a config document may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    /// TOML document.
    Toml,
    /// JSON object.
    Json,
}

impl ConfigFormat {
    /// Format implied by a file extension, if the extension is known.
    pub fn from_extension(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "toml" | "tml" => Some(Self::Toml),
            "json" => Some(Self::Json),
            _ => None,
        }
    }

    /// A document whose first non-blank character is `{` is JSON; anything
    /// else is read as TOML.
    pub fn sniff(contents: &str) -> Self {
        if contents.trim_start().starts_with('{') {
            Self::Json
        } else {
            Self::Toml
        }
    }

    /// Parse `contents` as a [`WorkerConfig`] in this format.
    pub fn decode(self, contents: &str) -> anyhow::Result<WorkerConfig> {
        match self {
            Self::Toml => toml::from_str(contents).map_err(|err| anyhow!("toml: {err}")),
            Self::Json => serde_json::from_str(contents).map_err(|err| anyhow!("json: {err}")),
        }
    }
}

/// Source that produced the worker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum WorkerConfigSource {
    /// Nothing found; built-in defaults.
    #[default]
    Default,
    /// Path handed to the loader directly, e.g. from `--config`.
    Explicit(PathBuf),
    /// Path taken from `$KINESYNC_CONFIG_PATH`.
    EnvPath(PathBuf),
    /// Inline JSON from `$KINESYNC_CONFIG_JSON`.
    EnvInline,
    /// One of the default locations in the working directory.
    File(PathBuf),
}

/// Result of [`WorkerConfigLoader::load`].
#[derive(Debug, Clone)]
pub struct WorkerConfigLoad {
    /// Configuration after overrides.
    pub config: WorkerConfig,
    /// Where the configuration came from.
    pub source: WorkerConfigSource,
    /// Whether a `.env` file was read.
    pub env_file_loaded: bool,
    /// Environment variables that overrode a loaded setting.
    pub overrides: Vec<&'static str>,
    /// Risky settings that do not stop the worker.
    pub warnings: ConfigWarnings,
}

type ApplyOverride = fn(&mut WorkerConfig, &str) -> anyhow::Result<()>;

/// Scalar settings that single environment variables replace.
const OVERRIDES: &[(&str, ApplyOverride)] = &[
    (WORKER_ID_VAR, |config, value| {
        config.sync.coordinator.worker_id = value.to_string();
        Ok(())
    }),
    (DATASET_PREFIX_VAR, |config, value| {
        config.sync.index.dataset_prefix = value.to_string();
        Ok(())
    }),
    (STORE_ROOT_VAR, |config, value| {
        config.sync.store.root = Some(PathBuf::from(value));
        Ok(())
    }),
    (POLL_INTERVAL_VAR, |config, value| {
        let interval = parse_interval(value)?;
        config.sync.coordinator.poll_interval_ms =
            u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        Ok(())
    }),
];

/// Accept humantime strings (`30s`, `2m 30s`) and bare milliseconds.
fn parse_interval(raw: &str) -> anyhow::Result<Duration> {
    if let Ok(millis) = raw.parse::<u64>() {
        return Ok(Duration::from_millis(millis));
    }
    humantime::parse_duration(raw).map_err(|err| anyhow!(err))
}

/// Resolves a [`WorkerConfig`] from, in order: an explicit path,
/// `$KINESYNC_CONFIG_PATH`, `$KINESYNC_CONFIG_JSON`, the first existing
/// default location, and finally built-in defaults. Scalar `KINESYNC_*`
/// overrides and guard rails run on whichever source wins.
#[derive(Debug, Default, Clone)]
pub struct WorkerConfigLoader {
    config_path: Option<PathBuf>,
    env_file: Option<PathBuf>,
}

impl WorkerConfigLoader {
    /// Loader that reads `.env` from the working directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read this file instead of probing the environment and default locations.
    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.config_path = Some(path.into());
        self
    }

    /// Read this `.env` file instead of `./.env`.
    pub fn with_env_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.env_file = Some(path.into());
        self
    }

    /// Read `.env`, resolve the config source, apply overrides and run the
    /// guard rails. A missing `.env` file is not an error.
    pub fn load(&self) -> anyhow::Result<WorkerConfigLoad> {
        let loaded = match &self.env_file {
            Some(path) => dotenvy::from_path(path),
            None => dotenvy::dotenv().map(|_| ()),
        };
        let env_file_loaded = match loaded {
            Ok(()) => true,
            Err(dotenvy::Error::Io(_)) => false,
            Err(err) => return Err(err).context("failed to read .env file"),
        };

        self.load_with(|key| env::var(key).ok(), env_file_loaded)
    }

    /// Resolve and validate without touching `.env` or the process environment.
    pub fn load_with<F>(&self, lookup: F, env_file_loaded: bool) -> anyhow::Result<WorkerConfigLoad>
    where
        F: Fn(&str) -> Option<String>,
    {
        let value = |key: &str| {
            lookup(key)
                .map(|raw| raw.trim().to_string())
                .filter(|raw| !raw.is_empty())
        };

        let source = self.locate(&value);
        let mut config = match &source {
            WorkerConfigSource::Default => WorkerConfig::default(),
            WorkerConfigSource::EnvInline => {
                let raw = value(CONFIG_JSON_VAR).unwrap_or_default();
                ConfigFormat::Json
                    .decode(&raw)
                    .with_context(|| format!("failed to parse {CONFIG_JSON_VAR}"))?
            }
            WorkerConfigSource::Explicit(path)
            | WorkerConfigSource::EnvPath(path)
            | WorkerConfigSource::File(path) => read_file(path)?,
        };

        let mut overrides = Vec::new();
        for &(var, apply) in OVERRIDES {
            if let Some(raw) = value(var) {
                apply(&mut config, &raw).with_context(|| format!("invalid {var} value {raw:?}"))?;
                overrides.push(var);
            }
        }

        let mut warnings = ConfigWarnings::default();
        if source == WorkerConfigSource::Default {
            warnings.add(
                ConfigWarning::new(
                    "config",
                    "no kinesync.toml detected; running on defaults and environment overrides",
                )
                .with_hint("Set KINESYNC_CONFIG_PATH or place kinesync.toml in the working directory"),
            );
        }
        warnings.extend(validation::apply_guard_rails(&config)?);

        tracing::debug!(source = ?source, overrides = ?overrides, "worker configuration resolved");

        Ok(WorkerConfigLoad {
            config,
            source,
            env_file_loaded,
            overrides,
            warnings,
        })
    }

    fn locate(&self, value: impl Fn(&str) -> Option<String>) -> WorkerConfigSource {
        if let Some(path) = &self.config_path {
            return WorkerConfigSource::Explicit(path.clone());
        }
        if let Some(path) = value(CONFIG_PATH_VAR) {
            return WorkerConfigSource::EnvPath(PathBuf::from(path));
        }
        if value(CONFIG_JSON_VAR).is_some() {
            return WorkerConfigSource::EnvInline;
        }
        DEFAULT_CONFIG_LOCATIONS
            .iter()
            .map(PathBuf::from)
            .find(|path| path.is_file())
            .map_or(WorkerConfigSource::Default, WorkerConfigSource::File)
    }
}

/// Read one config file. The extension picks the format; unknown extensions
/// are sniffed from the contents.
pub fn read_file(path: &Path) -> anyhow::Result<WorkerConfig> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read worker config from {}", path.display()))?;
    let format = ConfigFormat::from_extension(path).unwrap_or_else(|| ConfigFormat::sniff(&contents));
    format
        .decode(&contents)
        .with_context(|| format!("invalid worker config {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kinesync_core::config::{ReclaimPolicy, SelectionStrategy, WatchStrategy};
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn runnable<'a>() -> Vec<(&'a str, &'a str)> {
        vec![(STORE_ROOT_VAR, "/srv/data"), (DATASET_PREFIX_VAR, "protected/")]
    }

    #[test]
    fn toml_sections_land_in_components() {
        let config = ConfigFormat::Toml
            .decode(
                r#"
                expected_workers = 3

                [index]
                dataset_prefix = "protected/"

                [watch]
                strategy = "poll"

                [engine]
                program = "/opt/fit/bin/fit"
                args = ["--quiet"]
                timeout_secs = 600

                [coordinator]
                selection = "weighted_by_staleness"
                reclaim = { after_secs = 120 }
                "#,
            )
            .unwrap();

        assert_eq!(config.expected_workers, 3);
        assert_eq!(config.sync.index.dataset_prefix, "protected/");
        assert!(config.sync.index.publish_changes);
        assert_eq!(config.sync.watch.strategy, WatchStrategy::Poll);
        assert_eq!(config.sync.engine.args, vec!["--quiet"]);
        assert_eq!(config.sync.engine.timeout_secs, Some(600));
        assert_eq!(config.sync.coordinator.selection, SelectionStrategy::WeightedByStaleness);
        assert_eq!(config.sync.coordinator.reclaim, ReclaimPolicy::AfterSecs(120));
        assert_eq!(config.sync.store.page_size, 1_000);
    }

    #[test]
    fn unknown_extensions_are_sniffed() {
        let dir = tempfile::tempdir().unwrap();
        let json = dir.path().join("worker.conf");
        fs::write(&json, "\n  {\"coordinator\":{\"reclaim\":\"immediate\"}}").unwrap();
        let config = read_file(&json).unwrap();
        assert_eq!(config.sync.coordinator.reclaim, ReclaimPolicy::Immediate);
        assert_eq!(config.expected_workers, 1);

        let toml = dir.path().join("worker.cfg");
        fs::write(&toml, "expected_workers = 5\n").unwrap();
        assert_eq!(read_file(&toml).unwrap().expected_workers, 5);
    }

    #[test]
    fn parse_errors_name_file_and_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.conf");
        fs::write(&path, "[[[").unwrap();

        let text = format!("{:#}", read_file(&path).unwrap_err());
        assert!(text.contains("broken.conf"));
        assert!(text.contains("toml:"));
    }

    #[test]
    fn explicit_path_beats_environment() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.toml");
        fs::write(&path, "[engine]\nprogram = \"explicit\"\n").unwrap();

        let loader = WorkerConfigLoader::new().with_config_path(&path);
        let source = loader.locate(vars(&[(CONFIG_JSON_VAR, "{}"), (CONFIG_PATH_VAR, "/x.toml")]));
        assert_eq!(source, WorkerConfigSource::Explicit(path));
    }

    #[test]
    fn env_path_wins_over_inline_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.toml");
        fs::write(&path, "[engine]\nprogram = \"from-file\"\n").unwrap();

        let mut env = runnable();
        env.push((CONFIG_PATH_VAR, path.to_str().unwrap()));
        env.push((CONFIG_JSON_VAR, r#"{"engine":{"program":"from-json"}}"#));
        let load = WorkerConfigLoader::new().load_with(vars(&env), false).unwrap();

        assert_eq!(load.config.sync.engine.program, "from-file");
        assert_eq!(load.source, WorkerConfigSource::EnvPath(path));
    }

    #[test]
    fn inline_json_used_when_path_blank() {
        let mut env = runnable();
        env.push((CONFIG_PATH_VAR, "   "));
        env.push((CONFIG_JSON_VAR, r#"{"engine":{"program":"from-json"}}"#));
        let load = WorkerConfigLoader::new().load_with(vars(&env), false).unwrap();

        assert_eq!(load.config.sync.engine.program, "from-json");
        assert_eq!(load.source, WorkerConfigSource::EnvInline);
    }

    #[test]
    fn bad_inline_json_names_the_variable() {
        let err = WorkerConfigLoader::new()
            .load_with(vars(&[(CONFIG_JSON_VAR, "{")]), false)
            .unwrap_err();
        assert!(format!("{err:#}").contains(CONFIG_JSON_VAR));
    }

    #[test]
    fn missing_env_path_is_an_error() {
        let err = WorkerConfigLoader::new()
            .load_with(vars(&[(CONFIG_PATH_VAR, "/nonexistent/k.toml")]), false)
            .unwrap_err();
        assert!(err.to_string().contains("/nonexistent/k.toml"));
    }

    #[test]
    fn scalar_overrides_apply_in_table_order() {
        let load = WorkerConfigLoader::new()
            .load_with(
                vars(&[
                    (POLL_INTERVAL_VAR, "1m 30s"),
                    (WORKER_ID_VAR, " rig-7 "),
                    (DATASET_PREFIX_VAR, "protected/"),
                    (STORE_ROOT_VAR, "/srv/data"),
                ]),
                false,
            )
            .unwrap();

        assert_eq!(
            load.overrides,
            vec![WORKER_ID_VAR, DATASET_PREFIX_VAR, STORE_ROOT_VAR, POLL_INTERVAL_VAR]
        );
        let sync = &load.config.sync;
        assert_eq!(sync.coordinator.worker_id, "rig-7");
        assert_eq!(sync.index.dataset_prefix, "protected/");
        assert_eq!(sync.store.root, Some(PathBuf::from("/srv/data")));
        assert_eq!(sync.coordinator.poll_interval_ms, 90_000);
    }

    #[test]
    fn poll_interval_accepts_bare_millis_and_rejects_junk() {
        let mut env = runnable();
        env.push((POLL_INTERVAL_VAR, "250"));
        let load = WorkerConfigLoader::new().load_with(vars(&env), false).unwrap();
        assert_eq!(load.config.sync.coordinator.poll_interval_ms, 250);

        let err = WorkerConfigLoader::new()
            .load_with(vars(&[(POLL_INTERVAL_VAR, "soon")]), false)
            .unwrap_err();
        assert!(err.to_string().contains(POLL_INTERVAL_VAR));
    }
}
