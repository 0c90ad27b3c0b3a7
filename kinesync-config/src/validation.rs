use std::fmt;

use kinesync_core::config::ReclaimPolicy;
use kinesync_core::pubsub::validate_pattern;
use thiserror::Error;

use crate::loader::WorkerConfig;

/// Settings a worker refuses to start with.
#[derive(Debug, Error)]
pub enum ConfigGuardRailError {
    /// `engine.program` is blank.
    #[error("engine.program is empty; the worker has nothing to run")]
    EmptyEngineProgram,
    /// `store.page_size` is 0.
    #[error("store.page_size must be at least 1")]
    ZeroPageSize,
    /// `bus.change_topic_prefix` cannot head a subscription pattern.
    #[error("bus.change_topic_prefix {prefix:?} does not form a valid topic: {reason}")]
    InvalidChangeTopic {
        /// The configured prefix.
        prefix: String,
        /// Why the derived topic is rejected.
        reason: String,
    },
}

/// A legal setting that is probably a mistake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigWarning {
    /// Dotted path of the offending setting, e.g. `coordinator.reclaim`.
    pub setting: &'static str,
    /// What is wrong with it.
    pub message: String,
    /// How to silence the warning, when there is a single obvious fix.
    pub hint: Option<String>,
}

impl ConfigWarning {
    /// Warning about `setting` without a hint.
    pub fn new(setting: &'static str, message: impl Into<String>) -> Self {
        Self {
            setting,
            message: message.into(),
            hint: None,
        }
    }

    /// Attach a remediation hint.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

impl fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.setting, self.message)
    }
}

/// Warnings collected while loading, in the order they were raised.
#[derive(Debug, Default, Clone)]
pub struct ConfigWarnings(Vec<ConfigWarning>);

impl ConfigWarnings {
    /// Record one warning.
    pub fn add(&mut self, warning: ConfigWarning) {
        self.0.push(warning);
    }

    /// True when the configuration raised nothing.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of warnings.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Warnings in the order they were raised.
    pub fn iter(&self) -> std::slice::Iter<'_, ConfigWarning> {
        self.0.iter()
    }

    /// Warning raised for `setting`, if any.
    pub fn for_setting(&self, setting: &str) -> Option<&ConfigWarning> {
        self.0.iter().find(|warning| warning.setting == setting)
    }

    /// Emit every warning through `tracing`.
    pub fn log(&self) {
        for warning in self {
            tracing::warn!(
                setting = warning.setting,
                message = %warning.message,
                hint = warning.hint.as_deref().unwrap_or(""),
                "configuration warning"
            );
        }
    }
}

impl Extend<ConfigWarning> for ConfigWarnings {
    fn extend<I: IntoIterator<Item = ConfigWarning>>(&mut self, iter: I) {
        self.0.extend(iter);
    }
}

impl IntoIterator for ConfigWarnings {
    type Item = ConfigWarning;
    type IntoIter = std::vec::IntoIter<ConfigWarning>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a ConfigWarnings {
    type Item = &'a ConfigWarning;
    type IntoIter = std::slice::Iter<'a, ConfigWarning>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

type Check = fn(&WorkerConfig) -> Option<ConfigWarning>;

const CHECKS: &[Check] = &[
    idle_poll,
    eager_reclaim,
    unscoped_prefix,
    implicit_store_root,
    late_log_flush,
];

/// Check a loaded configuration before the worker starts.
///
/// Settings the worker cannot run with are errors; the rest come back as
/// warnings for the caller to log.
pub fn apply_guard_rails(config: &WorkerConfig) -> Result<ConfigWarnings, ConfigGuardRailError> {
    reject_unrunnable(config)?;

    let mut warnings = ConfigWarnings::default();
    warnings.extend(CHECKS.iter().filter_map(|check| check(config)));
    Ok(warnings)
}

fn reject_unrunnable(config: &WorkerConfig) -> Result<(), ConfigGuardRailError> {
    let sync = &config.sync;
    if sync.engine.program.trim().is_empty() {
        return Err(ConfigGuardRailError::EmptyEngineProgram);
    }
    if sync.store.page_size == 0 {
        return Err(ConfigGuardRailError::ZeroPageSize);
    }
    if sync.index.publish_changes {
        let pattern = format!("{}/update/#", sync.bus.change_topic_prefix);
        validate_pattern(&pattern).map_err(|err| ConfigGuardRailError::InvalidChangeTopic {
            prefix: sync.bus.change_topic_prefix.clone(),
            reason: err.to_string(),
        })?;
    }
    Ok(())
}

fn idle_poll(config: &WorkerConfig) -> Option<ConfigWarning> {
    (config.sync.coordinator.poll_interval_ms == 0).then(|| {
        ConfigWarning::new(
            "coordinator.poll_interval_ms",
            "is 0; an idle worker will list the store in a tight loop",
        )
        .with_hint("Set KINESYNC_POLL_INTERVAL (e.g. 30s) or coordinator.poll_interval_ms")
    })
}

fn eager_reclaim(config: &WorkerConfig) -> Option<ConfigWarning> {
    let immediate = config.sync.coordinator.reclaim == ReclaimPolicy::Immediate;
    (immediate && config.expected_workers > 1).then(|| {
        ConfigWarning::new(
            "coordinator.reclaim",
            format!(
                "is immediate with {} workers; a subject being fitted can be claimed again",
                config.expected_workers
            ),
        )
        .with_hint("Use reclaim = { after_secs = N } with N above the longest expected fit")
    })
}

fn unscoped_prefix(config: &WorkerConfig) -> Option<ConfigWarning> {
    config.sync.index.dataset_prefix.trim_matches('/').is_empty().then(|| {
        ConfigWarning::new(
            "index.dataset_prefix",
            "is empty; every subject marker in the store will be considered",
        )
    })
}

fn implicit_store_root(config: &WorkerConfig) -> Option<ConfigWarning> {
    config.sync.store.root.is_none().then(|| {
        ConfigWarning::new(
            "store.root",
            "not configured; the working directory is used as the store",
        )
        .with_hint("Set KINESYNC_STORE_ROOT or store.root")
    })
}

fn late_log_flush(config: &WorkerConfig) -> Option<ConfigWarning> {
    let engine = &config.sync.engine;
    let timeout_ms = engine.timeout_secs.filter(|secs| *secs > 0)?.saturating_mul(1_000);
    (engine.log_flush_interval_ms > timeout_ms).then(|| {
        ConfigWarning::new(
            "engine.log_flush_interval_ms",
            "exceeds the engine timeout; the log is only written at exit",
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn runnable() -> WorkerConfig {
        let mut config = WorkerConfig::default();
        config.sync.index.dataset_prefix = "protected/".into();
        config.sync.store.root = Some(PathBuf::from("/srv/data"));
        config
    }

    #[test]
    fn defaults_with_store_and_prefix_are_clean() {
        let warnings = apply_guard_rails(&runnable()).unwrap();
        assert!(warnings.is_empty(), "{warnings:?}");
    }

    #[test]
    fn empty_engine_program_is_fatal() {
        let mut config = runnable();
        config.sync.engine.program = "  ".into();
        assert!(matches!(
            apply_guard_rails(&config),
            Err(ConfigGuardRailError::EmptyEngineProgram)
        ));
    }

    #[test]
    fn zero_page_size_is_fatal() {
        let mut config = runnable();
        config.sync.store.page_size = 0;
        assert!(matches!(
            apply_guard_rails(&config),
            Err(ConfigGuardRailError::ZeroPageSize)
        ));
    }

    #[test]
    fn wildcard_change_prefix_is_fatal() {
        let mut config = runnable();
        config.sync.bus.change_topic_prefix = "index/#".into();
        assert!(matches!(
            apply_guard_rails(&config),
            Err(ConfigGuardRailError::InvalidChangeTopic { .. })
        ));

        config.sync.index.publish_changes = false;
        assert!(apply_guard_rails(&config).is_ok());
    }

    #[test]
    fn zero_poll_interval_warns() {
        let mut config = runnable();
        config.sync.coordinator.poll_interval_ms = 0;
        let warnings = apply_guard_rails(&config).unwrap();
        assert_eq!(warnings.len(), 1);
        let warning = warnings.for_setting("coordinator.poll_interval_ms").unwrap();
        assert!(warning.hint.is_some());
        assert!(warning.to_string().starts_with("coordinator.poll_interval_ms: is 0"));
    }

    #[test]
    fn immediate_reclaim_only_warns_with_several_workers() {
        let mut config = runnable();
        config.sync.coordinator.reclaim = ReclaimPolicy::Immediate;
        assert!(apply_guard_rails(&config).unwrap().is_empty());

        config.expected_workers = 4;
        let warnings = apply_guard_rails(&config).unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(warnings.for_setting("coordinator.reclaim").unwrap().message.contains("4 workers"));
    }

    #[test]
    fn log_flush_longer_than_timeout_warns() {
        let mut config = runnable();
        config.sync.engine.timeout_secs = Some(2);
        config.sync.engine.log_flush_interval_ms = 2_000;
        assert!(apply_guard_rails(&config).unwrap().is_empty());

        config.sync.engine.log_flush_interval_ms = 2_001;
        let warnings = apply_guard_rails(&config).unwrap();
        let settings: Vec<_> = warnings.iter().map(|w| w.setting).collect();
        assert_eq!(settings, vec!["engine.log_flush_interval_ms"]);
    }

    #[test]
    fn warnings_keep_check_order() {
        let mut config = WorkerConfig::default();
        config.sync.coordinator.poll_interval_ms = 0;
        let settings: Vec<_> = apply_guard_rails(&config)
            .unwrap()
            .into_iter()
            .map(|w| w.setting)
            .collect();
        assert_eq!(
            settings,
            vec!["coordinator.poll_interval_ms", "index.dataset_prefix", "store.root"]
        );
    }
}
