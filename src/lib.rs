//! stripemend - erasure-coded stripe aggregation engine
//!
//! Storage targets holding EC parity accumulate plain replicas from
//! partial-stripe writes. This crate reconciles those replicas against the
//! stripe's parity, converging every committed stripe to one of two states:
//! parity only, or replicas with no stale parity behind them.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                           Aggregator                                  │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │                                                                       │
//! │  extent-store iteration ──▶ stripe assembler ──▶ parity probe        │
//! │                                                        │              │
//! │                                                        ▼              │
//! │                 ┌─────────────────── classifier ───────────────────┐  │
//! │                 │ drop │ full-encode │ no-op │ hole-fill │ partial │  │
//! │                 └──────┴──────┬──────┴───────┴─────┬─────┴────┬────┘  │
//! │                               ▼                    ▼          ▼       │
//! │                         parity codec        peer transport  committer │
//! │                        (offload worker)       (RPC)        (local)    │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The engine runs on the elected leader among an object's parity shards
//! and consumes four ports: the local [`store::ExtentStore`], the
//! cross-shard [`client::ObjectClient`], the [`rpc::PeerTransport`] to the
//! other parity shards, and the pool [`cluster::Membership`]. Everything
//! behind those ports - the versioned store itself, the real RPC stack,
//! leader election - lives outside this crate; [`memory`] provides
//! in-memory implementations that wire a whole loopback cluster together.
//!
//! # Modules
//!
//! - [`layout`] - EC class geometry, extents, epochs, identities
//! - [`stripe`] - per-akey stripe assembly and cell accounting
//! - [`codec`] - Galois-field parity encode / incremental update
//! - [`engine`] - the iteration driver and public entry point
//! - [`store`], [`client`], [`rpc`], [`cluster`] - ports onto collaborators
//! - [`offload`] - completion-handle bridge for CPU-bound codec work
//! - [`watermark`] - per-container last-aggregated-epoch registry
//! - [`memory`] - in-memory cluster for tests and development
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use stripemend::{Aggregator, EpochRange, WatermarkRegistry};
//!
//! let engine = Aggregator::new(store, client, transport, membership,
//!                              Arc::new(WatermarkRegistry::new()));
//! let summary = engine
//!     .aggregate(&container, EpochRange::new(lo, hi), || false, true)
//!     .await?;
//! ```

pub mod client;
pub mod cluster;
pub mod codec;
pub mod engine;
pub mod error;
pub mod layout;
pub mod memory;
pub mod offload;
pub mod rpc;
pub mod store;
pub mod stripe;
pub mod watermark;

mod process;

// Re-export the types most callers need
pub use engine::{AggregateSummary, Aggregator, AggregatorConfig};
pub use error::{Error, Result};
pub use layout::{
    ContainerId, EcClass, Epoch, EpochRange, Extent, Key, ObjectId, PoolId, ShardObjectId,
    PARITY_FLAG,
};
pub use store::ContainerHandle;
pub use watermark::WatermarkRegistry;
