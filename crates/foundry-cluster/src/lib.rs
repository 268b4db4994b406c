//! foundry-cluster — cluster lifecycle management.
//!
//! Aggregates host states into a cluster state, enforces installation
//! readiness, drives installation progress, and reaps soft-deleted rows.
//! Host-state changes arrive through a queued refresh channel so the
//! cluster machine never re-enters the host machine synchronously.

pub mod deletion;
pub mod manager;
pub mod validations;

pub use deletion::DeletionWorker;
pub use manager::{
    host_status_callback, refresh_channel, ClusterConfig, ClusterManager, ClusterParams,
    RefreshReceiver, RefreshSender,
};
pub use validations::{validate_cluster, ClusterCheck};

use thiserror::Error;

use foundry_state::ClusterState;

pub type ClusterResult<T> = Result<T, ClusterError>;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error(transparent)]
    State(#[from] foundry_state::StateError),

    #[error(transparent)]
    Host(#[from] foundry_host::HostError),

    #[error("cluster not found: {0}")]
    ClusterNotFound(String),

    #[error("cluster {cluster_id} cannot {operation} while in state {current}")]
    InvalidStateTransition {
        cluster_id: String,
        current: ClusterState,
        operation: &'static str,
    },

    #[error("cluster {cluster_id} is not ready for installation: {reasons}")]
    NotReady { cluster_id: String, reasons: String },
}
