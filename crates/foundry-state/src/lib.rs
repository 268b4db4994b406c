//! foundry-state — persistent state for the installation service.
//!
//! A redb-backed row store holding cluster, host, event, and lease rows,
//! plus the schema-migration ledger. Both on-disk and in-memory backends
//! are supported; tests run entirely in memory.

pub mod error;
pub mod migrations;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::{StateStore, WriteCtx};
pub use types::*;
