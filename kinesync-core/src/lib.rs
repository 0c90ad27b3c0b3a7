//! # Kinesync Core
//!
//! Building blocks for workers that process a shared object-store dataset
//! without a central lock service.
//!
//! ## Overview
//!
//! - **Index**: in-memory mirror of a key space, refreshed by paginated
//!   prefix listings and swapped atomically ([`index::ObjectStoreIndex`])
//! - **Pub/Sub**: topic bus with trailing `#` wildcards, an offline queue and
//!   liveness heartbeats ([`pubsub::PubSubBus`])
//! - **Local mirrors**: scoped materialisation of a remote subtree with
//!   close-write detection and per-file upload ([`mirror::LocalMirror`])
//! - **Work units**: subjects and trials driven by JSON status records
//!   ([`unit`])
//! - **Coordination**: randomised claiming, engine supervision and
//!   last-writer-wins recovery ([`coordinator::WorkCoordinator`])
//!
//! ## Architecture
//!
//! The store is reached only through [`store::ObjectStore`]; two
//! implementations ship, one in memory and one on the local filesystem. The
//! numerical engine is an external process described by [`engine::Engine`].
//!
//! ## Examples
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use kinesync_core::config::SyncConfig;
//! use kinesync_core::coordinator::WorkCoordinator;
//! use kinesync_core::engine::SubprocessEngine;
//! use kinesync_core::index::ObjectStoreIndex;
//! use kinesync_core::pubsub::PubSubBus;
//! use kinesync_core::store::FsObjectStore;
//!
//! # async fn run() -> kinesync_core::error::Result<()> {
//! let config = SyncConfig::default();
//! let store = Arc::new(FsObjectStore::new("/srv/dataset", config.store.page_size));
//! let bus = Arc::new(PubSubBus::loopback());
//! bus.connect()?;
//! let index = Arc::new(ObjectStoreIndex::new(store).with_change_feed(bus.clone(), "index"));
//! let engine = Arc::new(SubprocessEngine::new(config.engine.clone()));
//!
//! let coordinator = WorkCoordinator::new(index, bus, engine, config);
//! coordinator.run_once().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod index;
pub mod mirror;
pub mod pubsub;
pub mod store;
pub mod unit;

pub use error::{ErrorKind, Result, SyncError};
