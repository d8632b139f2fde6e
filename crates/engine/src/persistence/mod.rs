//! Persistence layer for the engine.
//!
//! SurrealDB-backed storage for:
//! - actions, their dependency edges and owner claims
//! - cluster locks
//! - cluster, node and policy records plus policy bindings
//!
//! # Architecture
//!
//! `EngineStore` owns the connection; each record type contributes its
//! operations as an `impl EngineStore` block in its own module. The
//! claim, lock and fan-in primitives are single statements so their
//! atomicity comes from the store, not from engine-side coordination.

pub mod action_store;
pub mod client;
pub mod cluster_store;
pub mod error;
pub mod lock_store;
pub mod node_store;
pub mod policy_store;

pub use action_store::ActionQuery;
pub use client::{Credentials, EngineStore, StoreConfig};
pub use cluster_store::{ClusterRecord, ClusterStatus};
pub use error::{PersistenceError, PersistenceResult};
pub use lock_store::ClusterLock;
pub use node_store::{NodeRecord, NodeStatus};
pub use policy_store::{ClusterPolicy, PolicyRecord};
