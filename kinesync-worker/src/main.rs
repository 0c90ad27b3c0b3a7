use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args as ClapArgs, Parser, Subcommand};
use kinesync_config::{
    WorkerConfig, WorkerConfigLoad, WorkerConfigLoader, WorkerConfigSource, apply_guard_rails,
};
use kinesync_core::coordinator::WorkCoordinator;
use kinesync_core::engine::SubprocessEngine;
use kinesync_core::index::ObjectStoreIndex;
use kinesync_core::pubsub::PubSubBus;
use kinesync_core::store::FsObjectStore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "kinesync-worker")]
#[command(about = "Claims subjects from a shared dataset and runs the fitting engine on them")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    run: RunArgs,
}

#[derive(ClapArgs, Debug, Clone)]
struct RunArgs {
    /// Configuration file (TOML or JSON); overrides KINESYNC_CONFIG_PATH
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Alternate .env file
    #[arg(long)]
    env_file: Option<PathBuf>,

    /// Root directory of the filesystem-backed store (overrides config)
    #[arg(long)]
    store_root: Option<PathBuf>,

    /// Prefix scanned for subjects (overrides config)
    #[arg(long)]
    dataset_prefix: Option<String>,

    /// Identity stamped into status records (overrides config)
    #[arg(long)]
    worker_id: Option<String>,

    /// Engine executable (overrides config)
    #[arg(long)]
    engine: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a single pass and exit
    Once,
    /// Resolve and validate configuration, print it and exit
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let WorkerConfigLoad {
        config,
        source,
        env_file_loaded,
        overrides,
        warnings,
    } = load_config(&cli.run)?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,kinesync::engine=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if env_file_loaded {
        info!("loaded .env file");
    }
    match &source {
        WorkerConfigSource::Default => info!("worker config: defaults"),
        WorkerConfigSource::Explicit(path) | WorkerConfigSource::File(path) => {
            info!(path = %path.display(), "worker config loaded from file")
        }
        WorkerConfigSource::EnvPath(path) => {
            info!(path = %path.display(), "worker config loaded from env path")
        }
        WorkerConfigSource::EnvInline => info!("worker config loaded from inline environment json"),
    }
    if !overrides.is_empty() {
        info!(overrides = ?overrides, "environment overrides applied");
    }
    warnings.log();

    match cli.command {
        Some(Command::Check) => {
            let rendered =
                toml::to_string_pretty(&config).context("failed to render configuration")?;
            println!("{rendered}");
            Ok(())
        }
        Some(Command::Once) => {
            let coordinator = build_coordinator(config)?;
            match coordinator.run_once().await? {
                Some(outcome) => info!(
                    subject = %outcome.subject,
                    state = ?outcome.state,
                    exit_code = ?outcome.exit_code,
                    "pass finished"
                ),
                None => info!("nothing to process"),
            }
            Ok(())
        }
        None => {
            let coordinator = build_coordinator(config)?;
            let cancel = CancellationToken::new();
            let trigger = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received; stopping after the current pass");
                    trigger.cancel();
                }
            });
            coordinator.run(cancel).await?;
            info!("worker stopped");
            Ok(())
        }
    }
}

fn load_config(args: &RunArgs) -> anyhow::Result<WorkerConfigLoad> {
    let mut loader = WorkerConfigLoader::new();
    if let Some(path) = &args.config {
        loader = loader.with_config_path(path);
    }
    if let Some(path) = &args.env_file {
        loader = loader.with_env_file(path);
    }
    let mut load = loader.load().context("failed to load configuration")?;

    if apply_cli_overrides(&mut load.config, args) {
        load.warnings =
            apply_guard_rails(&load.config).context("invalid configuration after CLI overrides")?;
    }
    Ok(load)
}

/// Returns whether any flag changed the loaded configuration.
fn apply_cli_overrides(config: &mut WorkerConfig, args: &RunArgs) -> bool {
    let mut changed = false;
    if let Some(root) = &args.store_root {
        config.sync.store.root = Some(root.clone());
        changed = true;
    }
    if let Some(prefix) = &args.dataset_prefix {
        config.sync.index.dataset_prefix = prefix.clone();
        changed = true;
    }
    if let Some(worker_id) = &args.worker_id {
        config.sync.coordinator.worker_id = worker_id.clone();
        changed = true;
    }
    if let Some(engine) = &args.engine {
        config.sync.engine.program = engine.clone();
        changed = true;
    }
    changed
}

fn build_coordinator(config: WorkerConfig) -> anyhow::Result<WorkCoordinator> {
    let sync = config.sync;
    let root = match &sync.store.root {
        Some(root) => root.clone(),
        None => std::env::current_dir().context("failed to resolve working directory")?,
    };
    let store = Arc::new(FsObjectStore::new(&root, sync.store.page_size));

    let bus = Arc::new(PubSubBus::loopback());
    bus.connect().context("failed to connect pub/sub transport")?;

    let mut index = ObjectStoreIndex::new(store);
    if sync.index.publish_changes {
        index = index.with_change_feed(bus.clone(), sync.bus.change_topic_prefix.clone());
    }
    let engine = Arc::new(SubprocessEngine::new(sync.engine.clone()));

    info!(
        store.root = %root.display(),
        dataset.prefix = %sync.index.dataset_prefix,
        engine.program = %sync.engine.program,
        selection = ?sync.coordinator.selection,
        reclaim = ?sync.coordinator.reclaim,
        "worker configuration in effect"
    );

    let coordinator = WorkCoordinator::new(Arc::new(index), bus, engine, sync);
    info!(worker_id = %coordinator.worker_id(), "worker ready");
    Ok(coordinator)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_loaded_config() {
        let cli = Cli::parse_from([
            "kinesync-worker",
            "--store-root",
            "/srv/data",
            "--dataset-prefix",
            "protected/",
            "--worker-id",
            "rig-1",
            "--engine",
            "/opt/fit/bin/fit",
            "once",
        ]);
        assert!(matches!(cli.command, Some(Command::Once)));

        let mut config = WorkerConfig::default();
        assert!(apply_cli_overrides(&mut config, &cli.run));
        assert_eq!(config.sync.store.root, Some(PathBuf::from("/srv/data")));
        assert_eq!(config.sync.index.dataset_prefix, "protected/");
        assert_eq!(config.sync.coordinator.worker_id, "rig-1");
        assert_eq!(config.sync.engine.program, "/opt/fit/bin/fit");
    }

    #[test]
    fn no_flags_leave_config_alone() {
        let cli = Cli::parse_from(["kinesync-worker"]);
        assert!(cli.command.is_none());
        let mut config = WorkerConfig::default();
        assert!(!apply_cli_overrides(&mut config, &cli.run));
        assert_eq!(config.sync.engine.program, "engine");
    }

    #[tokio::test]
    async fn coordinator_builds_over_a_local_directory() {
        let dir = std::env::temp_dir();
        let mut config = WorkerConfig::default();
        config.sync.store.root = Some(dir);
        config.sync.coordinator.worker_id = "rig-9".into();
        let coordinator = build_coordinator(config).unwrap();
        assert_eq!(coordinator.worker_id(), "rig-9");
    }
}
