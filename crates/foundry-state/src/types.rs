//! Domain types for the foundry state store.
//!
//! These types represent the persisted state of clusters, hosts, and events.
//! All types are serializable to/from JSON for storage in redb tables.
//! Identifiers are canonical UUID strings; timestamps are epoch seconds
//! except event times, which are epoch milliseconds so that per-host event
//! order survives sub-second bursts.

use std::collections::HashMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Unique identifier for a cluster (canonical UUID string).
pub type ClusterId = String;

/// Unique identifier for a host within a cluster.
pub type HostId = String;

// ── Cluster ────────────────────────────────────────────────────────

/// Lifecycle state of a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClusterState {
    Insufficient,
    Ready,
    PreparingForInstallation,
    Installing,
    Finalizing,
    Installed,
    Error,
    PendingForInput,
    AddingHosts,
}

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClusterState::Insufficient => "insufficient",
            ClusterState::Ready => "ready",
            ClusterState::PreparingForInstallation => "preparing-for-installation",
            ClusterState::Installing => "installing",
            ClusterState::Finalizing => "finalizing",
            ClusterState::Installed => "installed",
            ClusterState::Error => "error",
            ClusterState::PendingForInput => "pending-for-input",
            ClusterState::AddingHosts => "adding-hosts",
        };
        f.write_str(s)
    }
}

/// A cluster being prepared for installation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub id: ClusterId,
    pub name: String,
    /// Base DNS domain for the installed cluster (e.g. `example.com`).
    pub base_dns_domain: String,
    /// Declared machine network CIDR (e.g. `1.1.0.0/16`).
    pub machine_network_cidr: String,
    pub api_vip: String,
    pub api_vip_dns_name: String,
    pub ingress_vip: String,
    /// Allocate the VIPs via DHCP lease instead of static assignment.
    pub vip_dhcp_allocation: bool,
    /// Reference to the registry pull secret (opaque).
    pub pull_secret: String,
    /// Free-form install-config overrides. May be large.
    pub install_config_overrides: String,
    pub release_image: String,
    pub ignition_generator_version: String,
    pub state: ClusterState,
    /// Human-readable reason for the current state.
    pub status_info: String,
    /// Installation progress percentage (0-100).
    pub progress: u8,
    pub created_at: u64,
    pub status_updated_at: u64,
    pub install_started_at: Option<u64>,
    pub install_completed_at: Option<u64>,
    /// Soft-delete marker; reaped by the deletion worker past retention.
    pub deleted_at: Option<u64>,
}

impl Cluster {
    /// Create a cluster row in its initial state.
    pub fn new(id: ClusterId, name: &str) -> Self {
        let now = epoch_secs();
        Self {
            id,
            name: name.to_string(),
            base_dns_domain: String::new(),
            machine_network_cidr: String::new(),
            api_vip: String::new(),
            api_vip_dns_name: String::new(),
            ingress_vip: String::new(),
            vip_dhcp_allocation: false,
            pull_secret: String::new(),
            install_config_overrides: String::new(),
            release_image: String::new(),
            ignition_generator_version: String::new(),
            state: ClusterState::Insufficient,
            status_info: "cluster is insufficient".to_string(),
            progress: 0,
            created_at: now,
            status_updated_at: now,
            install_started_at: None,
            install_completed_at: None,
            deleted_at: None,
        }
    }
}

// ── Host ───────────────────────────────────────────────────────────

/// Lifecycle state of a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HostState {
    Discovering,
    Known,
    Disconnected,
    Insufficient,
    PendingForInput,
    PreparingForInstallation,
    Installing,
    InstallingInProgress,
    Installed,
    Error,
    Resetting,
    ResettingPendingUserAction,
    Disabled,
}

impl HostState {
    /// States in which the host is taking part in an installation.
    pub fn is_installation(self) -> bool {
        matches!(
            self,
            HostState::PreparingForInstallation
                | HostState::Installing
                | HostState::InstallingInProgress
        )
    }

    /// Terminal states leave only through an explicit administrative reset.
    pub fn is_terminal(self) -> bool {
        matches!(self, HostState::Installed | HostState::Error)
    }
}

impl fmt::Display for HostState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HostState::Discovering => "discovering",
            HostState::Known => "known",
            HostState::Disconnected => "disconnected",
            HostState::Insufficient => "insufficient",
            HostState::PendingForInput => "pending-for-input",
            HostState::PreparingForInstallation => "preparing-for-installation",
            HostState::Installing => "installing",
            HostState::InstallingInProgress => "installing-in-progress",
            HostState::Installed => "installed",
            HostState::Error => "error",
            HostState::Resetting => "resetting",
            HostState::ResettingPendingUserAction => "resetting-pending-user-action",
            HostState::Disabled => "disabled",
        };
        f.write_str(s)
    }
}

/// Role a host will take in the installed cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostRole {
    #[default]
    Auto,
    Master,
    Worker,
}

impl fmt::Display for HostRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostRole::Auto => f.write_str("auto"),
            HostRole::Master => f.write_str("master"),
            HostRole::Worker => f.write_str("worker"),
        }
    }
}

/// Agent-reported installation progress for a single attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostProgress {
    pub stage: String,
    pub stage_started_at: u64,
    pub stage_updated_at: u64,
    pub progress_info: String,
}

/// The recorded outcome of one executed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub step_type: String,
    pub exit_code: i64,
    pub output: String,
    pub error: String,
    pub received_at: u64,
}

/// A machine running the discovery agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Host {
    pub id: HostId,
    pub cluster_id: ClusterId,
    pub role: HostRole,
    /// Raw inventory blob as reported by the agent (JSON, opaque here).
    pub inventory: String,
    /// Legacy hardware-info blob from older agents (opaque).
    #[serde(default)]
    pub hw_info: String,
    /// Connectivity matrix as reported by the agent (opaque).
    pub connectivity: String,
    pub state: HostState,
    /// Human-readable reason for the current state.
    pub status_info: String,
    pub progress: HostProgress,
    /// Results of executed steps, newest last.
    pub step_results: Vec<StepResult>,
    /// Whether an operator asked to cancel the running installation.
    pub cancellation_requested: bool,
    pub checked_in_at: u64,
    pub created_at: u64,
    pub status_updated_at: u64,
    pub deleted_at: Option<u64>,
}

impl Host {
    /// Create a host row in its initial `discovering` state.
    pub fn new(id: HostId, cluster_id: ClusterId) -> Self {
        let now = epoch_secs();
        Self {
            id,
            cluster_id,
            role: HostRole::Auto,
            inventory: String::new(),
            hw_info: String::new(),
            connectivity: String::new(),
            state: HostState::Discovering,
            status_info: "Waiting for host to send hardware details".to_string(),
            progress: HostProgress::default(),
            step_results: Vec::new(),
            cancellation_requested: false,
            checked_in_at: now,
            created_at: now,
            status_updated_at: now,
            deleted_at: None,
        }
    }

    /// Composite table key for this host.
    pub fn table_key(&self) -> String {
        host_key(&self.cluster_id, &self.id)
    }
}

/// Composite key for the hosts table.
pub fn host_key(cluster_id: &str, host_id: &str) -> String {
    format!("{cluster_id}/{host_id}")
}

// ── Event ──────────────────────────────────────────────────────────

/// Severity of an appended event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl fmt::Display for EventSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventSeverity::Info => f.write_str("info"),
            EventSeverity::Warning => f.write_str("warning"),
            EventSeverity::Error => f.write_str("error"),
            EventSeverity::Critical => f.write_str("critical"),
        }
    }
}

/// An immutable, append-only event record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub cluster_id: ClusterId,
    pub host_id: Option<HostId>,
    pub severity: EventSeverity,
    pub message: String,
    /// Epoch milliseconds at append time.
    pub event_time: u64,
    pub request_id: String,
}

// ── Leases ─────────────────────────────────────────────────────────

/// A time-bounded grant of leadership, persisted by name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseRecord {
    /// Identity of the current holder.
    pub holder: String,
    /// Epoch milliseconds at which the lease lapses.
    pub expires_at: u64,
    pub acquired_at: u64,
}

// ── Time helpers ───────────────────────────────────────────────────

/// Current time as epoch seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Current time as epoch milliseconds.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
