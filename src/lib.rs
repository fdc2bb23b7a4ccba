//! # snapmesh
//!
//! A multi-level checkpoint/restart engine for tightly coupled parallel
//! jobs: node-local (L1), partner-ring replication (L2), Reed-Solomon
//! group erasure coding (L3), and a flush to a persistent parallel
//! filesystem (L4).
//!
//! ## Architecture
//!
//! - `error`: crate-wide error taxonomy and the public `ResultCode`
//! - `config`: engine configuration, loaded from TOML
//! - `logging`: process-wide `tracing` setup
//! - `identity`: checkpoint naming and stem parsing
//! - `header`: the on-disk checkpoint file header and region table
//! - `registry`: per-client memory region registration
//! - `comm`: the collective communicator abstraction
//! - `topology`: group/ring topology built from node ids
//! - `metadata`: per-level checksums and promotion bookkeeping
//! - `storage`: pluggable L4 storage backends
//! - `codec`: Reed-Solomon erasure coding over GF(2^16)
//! - `levels`: the four level engines (L1-L4)
//! - `dispatch`: watchdog, versioning, and checksum dispatch modules
//! - `orchestrator`: checkpoint dispatch and the restart cascade
//! - `client`: the per-rank client API
//! - `queue`: the async-mode request queue and backend worker pool

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod codec;
pub mod comm;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod header;
pub mod identity;
pub mod levels;
pub mod logging;
pub mod metadata;
pub mod orchestrator;
pub mod queue;
pub mod registry;
pub mod storage;
pub mod topology;

pub use client::{Client, Observer};
pub use config::EngineConfig;
pub use error::{EngineError, EngineResult, ResultCode};
pub use orchestrator::Orchestrator;

/// Crate version, as declared in `Cargo.toml`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name, as declared in `Cargo.toml`.
pub const NAME: &str = env!("CARGO_PKG_NAME");
