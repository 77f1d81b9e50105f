//! skillgate-state: governance persistence for skillgate
//!
//! This crate owns the only mutable shared resource of the substrate: the
//! record of who may invoke which skill version, and the provenance log of
//! every invocation.
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: trust binding, per-key write serialization and append-only audit.
//!
//! ## Key Components
//!
//! - `GovernanceStore`: async trait over grants, checkpoints and receipts
//! - `SurrealGovernanceStore`: SurrealDB implementation (`mem://`, `surrealkv://`, `ws://`)
//! - `MemoryGovernanceStore`: in-memory fake for tests
//! - `KeyedLocks`: per-`(agent, skill)` async locks

mod error;
pub mod fakes;
mod handle;
pub mod keyed_lock;
mod migrations;
mod schema;
pub mod storage_traits;
pub mod surreal_store;

pub use error::{StateError, StorageError};
pub use handle::{connect, StoreConfig};
pub use keyed_lock::KeyedLocks;
pub use storage_traits::{
    AppliedLimits, Consume, GovernanceStore, Grant, GrantKey, GrantMode, Outcome, OutputRef,
    ProvenanceReceipt, SecurityHash, StorageResult, WriteCheckpoint,
};
pub use surreal_store::SurrealGovernanceStore;

/// Result type for skillgate-state connection and schema operations
pub type Result<T> = std::result::Result<T, StateError>;
