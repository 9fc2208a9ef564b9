//! Transactional key-value store for local account state.
//!
//! Values live in named collections and are read/written only through
//! scoped transactions. A write transaction stages its changes on a
//! working copy and commits them atomically when the block returns `Ok`;
//! an `Err` rolls everything back. Completions registered during a write
//! run after the exclusive section ends, and only on commit.

mod error;
mod persist;
mod store;

pub use error::StoreError;
pub use persist::Persistence;
pub use store::{KeyValueStore, ReadTransaction, StoreRead, WriteTransaction};
