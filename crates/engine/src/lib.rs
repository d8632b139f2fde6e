//! # Muster engine
//!
//! Cluster action orchestration: polymorphic actions moving through a
//! one-way state machine, a worker pool claiming them atomically,
//! per-cluster exclusive locks, cooperative cancellation and a
//! pluggable policy-check pipeline.
//!
//! The typical embedding connects a store, registers policy rules and
//! a node provider, starts the runtime and then creates READY actions
//! and notifies the dispatcher:
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use muster_engine::node::NoopProvider;
//! use muster_engine::persistence::{EngineStore, StoreConfig};
//! use muster_engine::policies::PolicyRegistry;
//! use muster_engine::runtime::{EngineConfig, Runtime};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let store = EngineStore::connect(StoreConfig::in_memory()).await?;
//! store.initialize_schema().await?;
//! let (runtime, pool) = Runtime::start(
//!     EngineConfig::default(),
//!     store,
//!     PolicyRegistry::new(),
//!     Arc::new(NoopProvider),
//! )
//! .await?;
//! // ... create actions, runtime.dispatcher.notify(&action_id) ...
//! pool.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod action;
pub mod cluster;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod node;
pub mod persistence;
pub mod policies;
pub mod runtime;
pub mod scheduler;

pub use action::{Action, ActionStatus, ActionVerb, Outcome};
pub use context::RequestContext;
pub use error::{EngineError, EngineResult};
pub use runtime::{EngineConfig, Runtime, WorkerPool};
