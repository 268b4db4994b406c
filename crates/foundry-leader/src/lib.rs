//! foundry-leader — leader gate for replicated deployments.
//!
//! A small fixed set of monitors must run exactly once across all replicas.
//! Each monitor tick is wrapped by [`run_with_leader`], which invokes the
//! task iff this process holds leadership at that moment and otherwise
//! returns without error. Leadership is a store-backed lease renewed by a
//! background loop; [`DummyElector`] always leads and serves single-process
//! deployments.

pub mod elector;
pub mod runner;

pub use elector::{DummyElector, Elector, LeaderConfig, LeaseElector};
pub use runner::spawn_monitor;

use std::future::Future;

use thiserror::Error;

pub type LeaderResult<T> = Result<T, LeaderError>;

#[derive(Debug, Error)]
pub enum LeaderError {
    #[error("lease backend error: {0}")]
    Backend(String),

    #[error("shut down before leadership was acquired")]
    ShutDown,
}

/// Run `task` iff `elector` holds leadership right now.
///
/// A non-leader invocation is not an error; the task simply does not run.
/// Long tasks must re-check [`Elector::is_leader`] between batches and
/// abort cooperatively on lease loss.
pub async fn run_with_leader<F, Fut, E>(elector: &dyn Elector, task: F) -> Result<(), E>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<(), E>>,
{
    if elector.is_leader() {
        task().await
    } else {
        Ok(())
    }
}
