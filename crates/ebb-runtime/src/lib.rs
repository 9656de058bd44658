//! ebb-runtime: Async shell for `ebb` replicas
//!
//! The runtime is the "imperative shell" around the pure replica state
//! machine. It gives every hosted region copy its own tokio task and wires
//! the tasks together through an in-process network:
//!
//! 1. A replica starts, registers its route, and publishes its business card
//! 2. A caller asks a replica to catch up; the directory names a backfiller
//! 3. The replica task turns messages and commands into state transitions
//! 4. Outgoing messages are routed to peer tasks or to waiting clients
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          Cluster                              │
//! │  ┌───────────┐   ┌──────────────┐      ┌──────────────┐      │
//! │  │ Directory │   │ Replica task │ ◄──► │ Replica task │ ...  │
//! │  │  (cards)  │   │ ReplicaState │  Net │ ReplicaState │      │
//! │  └───────────┘   └──────▲───────┘      └──────▲───────┘      │
//! │                         │ commands            │               │
//! │                    NodeHandle            NodeHandle           │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use ebb_runtime::{Cluster, RuntimeConfig};
//!
//! let cluster = Cluster::new(RuntimeConfig::development())?;
//! let source = cluster.spawn_replica(current_copy).await?;
//! let target = cluster
//!     .open_replica(node, shard, region.clone(), branch, history, storage)
//!     .await?;
//!
//! target.backfill(region.clone()).await?;
//! target.synchronize(region, Timestamp::new(50)).await?;
//! ```

pub mod cluster;
pub mod config;
pub mod error;
pub mod node;

pub use cluster::{CLIENT_SHARD, Cluster};
pub use config::RuntimeConfig;
pub use error::RuntimeError;
pub use node::{BackfillHandle, NodeHandle, ReplicaSnapshot};
