//! Configuration loading for kinesync workers.
//!
//! [`WorkerConfig`] wraps the per-component tuning structs from
//! [`kinesync_core::config`] and knows how to find them: an explicit path, the
//! `KINESYNC_CONFIG_PATH`/`KINESYNC_CONFIG_JSON` environment variables, or a
//! `kinesync.toml` in the working directory. [`validation`] turns risky but
//! legal settings into warnings and rejects settings a worker cannot run with.

pub mod loader;
pub mod validation;

pub use loader::{
    ConfigFormat, WorkerConfig, WorkerConfigLoad, WorkerConfigLoader, WorkerConfigSource, read_file,
};
pub use validation::{ConfigGuardRailError, ConfigWarning, ConfigWarnings, apply_guard_rails};
