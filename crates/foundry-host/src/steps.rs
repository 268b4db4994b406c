//! Step model and per-step-type factories.
//!
//! A step is one command the service asks an agent to execute next. Steps
//! are transient: the server regenerates them from the current (host,
//! cluster) snapshot on every poll, so re-delivery is expected and agents
//! correlate replies by `step_id`. For a fixed snapshot the emitted argument
//! lists are a deterministic function of that snapshot.

use std::fmt;

use serde::{Deserialize, Serialize};

use foundry_hardware::{parse_inventory, Inventory};
use foundry_state::{Cluster, Host};

use crate::{HostError, HostResult, InstructionConfig};

/// Kind of command an agent is asked to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepType {
    Inventory,
    ConnectivityCheck,
    FreeAddresses,
    DhcpLeaseAllocate,
    ApiVipConnectivityCheck,
    Install,
    ResetInstallation,
    StopInstallation,
    Execute,
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepType::Inventory => "inventory",
            StepType::ConnectivityCheck => "connectivity-check",
            StepType::FreeAddresses => "free-addresses",
            StepType::DhcpLeaseAllocate => "dhcp-lease-allocate",
            StepType::ApiVipConnectivityCheck => "api-vip-connectivity-check",
            StepType::Install => "install",
            StepType::ResetInstallation => "reset-installation",
            StepType::StopInstallation => "stop-installation",
            StepType::Execute => "execute",
        };
        f.write_str(s)
    }
}

/// A single instruction returned to an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub step_type: StepType,
    /// Server-generated identifier agents echo in their reply.
    pub step_id: String,
    pub command: String,
    pub args: Vec<String>,
    /// Whether the server expects a reply for this step.
    pub expects_reply: bool,
}

fn step_id(step_type: StepType) -> String {
    format!("{step_type}-{}", uuid::Uuid::new_v4())
}

fn podman_run(image: &str, trailing: &[String]) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "--rm".to_string(),
        "--privileged".to_string(),
        "--net=host".to_string(),
        image.to_string(),
    ];
    args.extend(trailing.iter().cloned());
    args
}

// ── Factories ──────────────────────────────────────────────────────

/// Collect hardware inventory.
pub fn inventory_step(cfg: &InstructionConfig) -> Step {
    Step {
        step_type: StepType::Inventory,
        step_id: step_id(StepType::Inventory),
        command: "podman".to_string(),
        args: podman_run(&cfg.inventory_image, &["inventory".to_string()]),
        expects_reply: true,
    }
}

#[derive(Serialize)]
struct ConnectivityCheckNic {
    name: String,
    ip_addresses: Vec<String>,
}

#[derive(Serialize)]
struct ConnectivityCheckHost {
    host_id: String,
    nics: Vec<ConnectivityCheckNic>,
}

/// Probe connectivity towards the cluster's other hosts.
///
/// Emits nothing when the host has no peers to probe.
pub fn connectivity_check_step(
    cfg: &InstructionConfig,
    host: &Host,
    peers: &[Host],
) -> HostResult<Option<Step>> {
    let mut targets = Vec::new();
    for peer in peers {
        if peer.id == host.id || peer.inventory.is_empty() || peer.deleted_at.is_some() {
            continue;
        }
        let inventory = parse_peer_inventory(&peer.inventory)?;
        let nics: Vec<ConnectivityCheckNic> = inventory
            .interfaces
            .iter()
            .map(|iface| ConnectivityCheckNic {
                name: iface.name.clone(),
                ip_addresses: iface
                    .ipv4_addresses
                    .iter()
                    .map(|addr| addr.split('/').next().unwrap_or(addr).to_string())
                    .collect(),
            })
            .collect();
        targets.push(ConnectivityCheckHost {
            host_id: peer.id.clone(),
            nics,
        });
    }
    if targets.is_empty() {
        return Ok(None);
    }
    targets.sort_by(|a, b| a.host_id.cmp(&b.host_id));

    let payload = serde_json::to_string(&targets)
        .map_err(|e| HostError::InvalidInventory(e.to_string()))?;
    Ok(Some(Step {
        step_type: StepType::ConnectivityCheck,
        step_id: step_id(StepType::ConnectivityCheck),
        command: "podman".to_string(),
        args: podman_run(&cfg.connectivity_check_image, &[payload]),
        expects_reply: true,
    }))
}

/// Scan the host's networks for free addresses.
///
/// Emits nothing until the host has reported an inventory with addresses.
pub fn free_addresses_step(cfg: &InstructionConfig, host: &Host) -> HostResult<Option<Step>> {
    if host.inventory.is_empty() {
        return Ok(None);
    }
    let inventory = parse_peer_inventory(&host.inventory)?;
    let mut networks = networks_of(&inventory);
    if networks.is_empty() {
        return Ok(None);
    }
    networks.sort();
    networks.dedup();

    let payload = serde_json::to_string(&networks)
        .map_err(|e| HostError::InvalidInventory(e.to_string()))?;
    Ok(Some(Step {
        step_type: StepType::FreeAddresses,
        step_id: step_id(StepType::FreeAddresses),
        command: "podman".to_string(),
        args: podman_run(&cfg.free_addresses_image, &[payload]),
        expects_reply: true,
    }))
}

/// Ask the agent to hold DHCP leases for the cluster VIPs.
pub fn dhcp_lease_allocate_step(cfg: &InstructionConfig, cluster: &Cluster) -> Option<Step> {
    if !cluster.vip_dhcp_allocation || cluster.machine_network_cidr.is_empty() {
        return None;
    }
    let payload = serde_json::json!({
        "cluster_id": cluster.id,
        "network_cidr": cluster.machine_network_cidr,
    })
    .to_string();
    Some(Step {
        step_type: StepType::DhcpLeaseAllocate,
        step_id: step_id(StepType::DhcpLeaseAllocate),
        command: "podman".to_string(),
        args: podman_run(&cfg.dhcp_lease_allocator_image, &[payload]),
        expects_reply: true,
    })
}

#[derive(Serialize)]
struct ApiVipConnectivityCheckRequest {
    url: String,
    verify_cidr: bool,
}

/// Verify the machine-config server behind the API VIP answers.
///
/// The final argument is the JSON request; for a cluster with DNS name
/// `test.com` it is exactly
/// `{"url":"http://test.com:22624/config/worker","verify_cidr":true}`.
pub fn api_vip_connectivity_check_step(
    cfg: &InstructionConfig,
    cluster: &Cluster,
) -> HostResult<Option<Step>> {
    if cluster.api_vip_dns_name.is_empty() {
        return Ok(None);
    }
    let request = ApiVipConnectivityCheckRequest {
        url: format!("http://{}:22624/config/worker", cluster.api_vip_dns_name),
        verify_cidr: cfg.verify_cidr,
    };
    let payload = serde_json::to_string(&request)
        .map_err(|e| HostError::InvalidInventory(e.to_string()))?;
    let mut args = podman_run(&cfg.api_vip_connectivity_check_image, &[]);
    args.push(payload);
    Ok(Some(Step {
        step_type: StepType::ApiVipConnectivityCheck,
        step_id: step_id(StepType::ApiVipConnectivityCheck),
        command: "podman".to_string(),
        args,
        expects_reply: true,
    }))
}

/// Write the release image to disk and kick off installation.
pub fn install_step(cfg: &InstructionConfig, host: &Host, cluster: &Cluster) -> Step {
    let trailing = vec![
        "--cluster-id".to_string(),
        cluster.id.clone(),
        "--host-id".to_string(),
        host.id.clone(),
        "--role".to_string(),
        host.role.to_string(),
        "--release-image".to_string(),
        cluster.release_image.clone(),
    ];
    Step {
        step_type: StepType::Install,
        step_id: step_id(StepType::Install),
        command: "podman".to_string(),
        args: podman_run(&cfg.installer_image, &trailing),
        expects_reply: true,
    }
}

/// Stop a running installation on the host.
///
/// Emitted as a generic execute step: the agent just stops the installer
/// container.
pub fn stop_installation_step() -> Step {
    Step {
        step_type: StepType::Execute,
        step_id: step_id(StepType::Execute),
        command: "podman".to_string(),
        args: vec![
            "stop".to_string(),
            "-i".to_string(),
            "-t".to_string(),
            "5".to_string(),
            "installer".to_string(),
        ],
        expects_reply: false,
    }
}

/// Wipe installation leftovers so the host can re-enter discovery.
pub fn reset_installation_step() -> Step {
    Step {
        step_type: StepType::ResetInstallation,
        step_id: step_id(StepType::ResetInstallation),
        command: "podman".to_string(),
        args: vec![
            "rm".to_string(),
            "-f".to_string(),
            "installer".to_string(),
        ],
        expects_reply: false,
    }
}

fn parse_peer_inventory(raw: &str) -> HostResult<Inventory> {
    parse_inventory(raw).map_err(|e| HostError::InvalidInventory(e.to_string()))
}

/// Network CIDRs derivable from the inventory's interface addresses.
fn networks_of(inventory: &Inventory) -> Vec<String> {
    use std::net::Ipv4Addr;
    let mut out = Vec::new();
    for iface in &inventory.interfaces {
        for addr in &iface.ipv4_addresses {
            let Some((ip, prefix)) = addr.split_once('/') else {
                continue;
            };
            let (Ok(ip), Ok(prefix)) = (ip.parse::<Ipv4Addr>(), prefix.parse::<u32>()) else {
                continue;
            };
            if prefix > 32 {
                continue;
            }
            let mask: u32 = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
            let network = Ipv4Addr::from(u32::from(ip) & mask);
            out.push(format!("{network}/{prefix}"));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use foundry_state::HostRole;

    fn test_cfg() -> InstructionConfig {
        InstructionConfig::default()
    }

    fn host_with_inventory(id: &str, inventory: &str) -> Host {
        let mut host = Host::new(id.to_string(), "c1".to_string());
        host.inventory = inventory.to_string();
        host
    }

    const WORKER_INVENTORY: &str = r#"{
        "hostname": "worker-0",
        "cpu": {"count": 2},
        "memory": {"physical_bytes": 8589934592},
        "disks": [{"name": "sda", "size_bytes": 128849018880}],
        "interfaces": [{"name": "eth0", "ipv4_addresses": ["1.2.3.4/24"]}]
    }"#;

    #[test]
    fn api_vip_step_emits_golden_argument() {
        let mut cluster = Cluster::new("c1".to_string(), "test");
        cluster.api_vip_dns_name = "test.com".to_string();

        let step = api_vip_connectivity_check_step(&test_cfg(), &cluster)
            .unwrap()
            .unwrap();
        assert_eq!(
            step.args.last().unwrap(),
            "{\"url\":\"http://test.com:22624/config/worker\",\"verify_cidr\":true}"
        );
        assert_eq!(step.step_type, StepType::ApiVipConnectivityCheck);
        assert!(step.step_id.starts_with("api-vip-connectivity-check-"));
    }

    #[test]
    fn connectivity_check_needs_peers() {
        let host = host_with_inventory("h1", WORKER_INVENTORY);
        let step = connectivity_check_step(&test_cfg(), &host, &[]).unwrap();
        assert!(step.is_none());

        // A peer without inventory is not a probe target either.
        let bare_peer = Host::new("h2".to_string(), "c1".to_string());
        let step = connectivity_check_step(&test_cfg(), &host, &[bare_peer]).unwrap();
        assert!(step.is_none());
    }

    #[test]
    fn connectivity_check_lists_peer_nics() {
        let host = host_with_inventory("h1", WORKER_INVENTORY);
        let peer = host_with_inventory("h2", WORKER_INVENTORY);
        let step = connectivity_check_step(&test_cfg(), &host, &[peer])
            .unwrap()
            .unwrap();
        let payload = step.args.last().unwrap();
        assert!(payload.contains("\"host_id\":\"h2\""));
        assert!(payload.contains("\"ip_addresses\":[\"1.2.3.4\"]"));
    }

    #[test]
    fn free_addresses_derives_networks() {
        let host = host_with_inventory("h1", WORKER_INVENTORY);
        let step = free_addresses_step(&test_cfg(), &host).unwrap().unwrap();
        assert_eq!(step.args.last().unwrap(), "[\"1.2.3.0/24\"]");
    }

    #[test]
    fn dhcp_step_requires_allocation_flag() {
        let mut cluster = Cluster::new("c1".to_string(), "test");
        cluster.machine_network_cidr = "1.1.0.0/16".to_string();
        assert!(dhcp_lease_allocate_step(&test_cfg(), &cluster).is_none());

        cluster.vip_dhcp_allocation = true;
        let step = dhcp_lease_allocate_step(&test_cfg(), &cluster).unwrap();
        assert_eq!(step.step_type, StepType::DhcpLeaseAllocate);
    }

    #[test]
    fn install_step_carries_role_and_image() {
        let mut cluster = Cluster::new("c1".to_string(), "test");
        cluster.release_image = "quay.io/release:4.6".to_string();
        let mut host = Host::new("h1".to_string(), "c1".to_string());
        host.role = HostRole::Master;

        let step = install_step(&test_cfg(), &host, &cluster);
        assert_eq!(step.step_type, StepType::Install);
        assert!(step.args.contains(&"master".to_string()));
        assert!(step.args.contains(&"quay.io/release:4.6".to_string()));
    }

    #[test]
    fn stop_step_is_generic_execute() {
        let step = stop_installation_step();
        assert_eq!(step.step_type, StepType::Execute);
        assert_eq!(step.command, "podman");
        assert_eq!(step.args[0], "stop");
    }

    #[test]
    fn step_types_serialize_kebab_case() {
        let json = serde_json::to_string(&StepType::ApiVipConnectivityCheck).unwrap();
        assert_eq!(json, "\"api-vip-connectivity-check\"");
        assert_eq!(StepType::FreeAddresses.to_string(), "free-addresses");
    }
}
