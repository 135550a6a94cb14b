//! # tracepat-state
//!
//! Time-versioned attribute store for tracepat.
//!
//! This crate provides:
//! - Typed state values with a natural ordering
//! - A hierarchical, path-addressed attribute tree (quarks)
//! - Per-attribute interval history with ongoing and point-in-time queries
//! - Checksummed JSON snapshots of a whole store

pub mod error;
pub mod snapshot;
pub mod store;
pub mod value;

pub use error::StateError;
pub use snapshot::{SnapshotMeta, StoreSnapshot};
pub use store::{Interval, MemoryStateStore, Quark, SharedStateStore, StateStore};
pub use value::Value;

/// Path segment that matches every child in [`StateStore::query_pattern`].
pub const WILDCARD: &str = "*";
