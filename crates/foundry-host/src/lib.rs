//! foundry-host — host lifecycle management.
//!
//! Registers hosts, applies agent-reported evidence, drives the host state
//! machine, demotes silent hosts from a periodic monitor, and assembles the
//! ordered instruction batches agents execute next.

pub mod instructions;
pub mod manager;
pub mod steps;

pub use instructions::{InstructionConfig, InstructionManager};
pub use manager::{HostConfig, HostManager, StatusCallback};
pub use steps::{Step, StepType};

use thiserror::Error;

use foundry_state::HostState;

pub type HostResult<T> = Result<T, HostError>;

#[derive(Debug, Error)]
pub enum HostError {
    #[error(transparent)]
    State(#[from] foundry_state::StateError),

    #[error("cluster not found: {0}")]
    ClusterNotFound(String),

    #[error("host not found: {0}")]
    HostNotFound(String),

    #[error("malformed inventory: {0}")]
    InvalidInventory(String),

    #[error("host {host_id} cannot {operation} while in state {current}")]
    InvalidStateTransition {
        host_id: String,
        current: HostState,
        operation: &'static str,
    },
}
