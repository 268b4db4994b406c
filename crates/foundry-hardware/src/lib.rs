//! foundry-hardware — pure validation of agent-reported inventory.
//!
//! The validator takes a parsed inventory, the cluster constraints, and the
//! host's role, and returns a list of check verdicts. It performs no I/O;
//! the host state machine turns the verdicts into `known`/`insufficient`
//! transitions.

pub mod inventory;
pub mod validator;

pub use inventory::{parse_inventory, Cpu, Disk, Interface, Inventory, Memory};
pub use validator::{
    failure_messages, is_sufficient, CheckResult, ClusterConstraints, HardwareValidator,
    ValidationRole, ValidatorCfg,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HardwareError {
    #[error("malformed inventory: {0}")]
    InvalidInventory(String),
}
