//! Instruction manager — assembles the next step batch for a host.
//!
//! For a host in a given state, consults the step factories in a fixed,
//! state-dependent order and returns the ordered batch. The manager keeps
//! no per-agent delivery state: a step left unanswered is reissued on every
//! poll until a reply arrives.

use std::sync::Arc;

use serde::Deserialize;
use tracing::debug;

use foundry_metrics::MetricsRegistry;
use foundry_state::{Host, HostState, StateStore};

use crate::steps::{
    api_vip_connectivity_check_step, connectivity_check_step, dhcp_lease_allocate_step,
    free_addresses_step, install_step, inventory_step, reset_installation_step,
    stop_installation_step, Step,
};
use crate::{HostError, HostResult};

/// Container images and switches for the emitted steps.
#[derive(Debug, Clone, Deserialize)]
pub struct InstructionConfig {
    pub inventory_image: String,
    pub connectivity_check_image: String,
    pub free_addresses_image: String,
    pub dhcp_lease_allocator_image: String,
    pub api_vip_connectivity_check_image: String,
    pub installer_image: String,
    pub controller_image: String,
    /// Ask agents to verify the VIP answers from inside the machine CIDR.
    pub verify_cidr: bool,
}

impl Default for InstructionConfig {
    fn default() -> Self {
        Self {
            inventory_image: "quay.io/foundry/agent:latest".to_string(),
            connectivity_check_image: "quay.io/foundry/agent:latest".to_string(),
            free_addresses_image: "quay.io/foundry/agent:latest".to_string(),
            dhcp_lease_allocator_image: "quay.io/foundry/agent:latest".to_string(),
            api_vip_connectivity_check_image: "quay.io/foundry/agent:latest".to_string(),
            installer_image: "quay.io/foundry/installer:latest".to_string(),
            controller_image: "quay.io/foundry/controller:latest".to_string(),
            verify_cidr: true,
        }
    }
}

/// Produces ordered instruction batches from (host, cluster) snapshots.
pub struct InstructionManager {
    store: StateStore,
    cfg: InstructionConfig,
    metrics: Arc<MetricsRegistry>,
}

impl InstructionManager {
    pub fn new(store: StateStore, cfg: InstructionConfig, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            store,
            cfg,
            metrics,
        }
    }

    /// Assemble the next ordered step batch for `host`.
    ///
    /// The owning cluster must exist; an unknown cluster is an error and
    /// yields no steps.
    pub fn get_next_steps(&self, host: &Host) -> HostResult<Vec<Step>> {
        let cluster = self
            .store
            .get_cluster(&host.cluster_id)?
            .ok_or_else(|| HostError::ClusterNotFound(host.cluster_id.clone()))?;
        if host.deleted_at.is_some() {
            return Ok(Vec::new());
        }

        let mut steps = Vec::new();
        match host.state {
            HostState::Discovering | HostState::Disconnected => {
                steps.push(inventory_step(&self.cfg));
            }
            HostState::Insufficient | HostState::Known | HostState::PendingForInput => {
                steps.push(inventory_step(&self.cfg));
                let peers = self.store.list_hosts_for_cluster(&host.cluster_id)?;
                if let Some(step) = connectivity_check_step(&self.cfg, host, &peers)? {
                    steps.push(step);
                }
                if let Some(step) = free_addresses_step(&self.cfg, host)? {
                    steps.push(step);
                }
                if let Some(step) = dhcp_lease_allocate_step(&self.cfg, &cluster) {
                    steps.push(step);
                }
                if let Some(step) = api_vip_connectivity_check_step(&self.cfg, &cluster)? {
                    steps.push(step);
                }
            }
            HostState::PreparingForInstallation => {
                steps.push(install_step(&self.cfg, host, &cluster));
            }
            HostState::Installing | HostState::InstallingInProgress => {
                if host.cancellation_requested {
                    steps.push(stop_installation_step());
                }
            }
            HostState::Error => {
                steps.push(stop_installation_step());
            }
            HostState::Resetting => {
                steps.push(reset_installation_step());
            }
            HostState::Installed
            | HostState::Disabled
            | HostState::ResettingPendingUserAction => {}
        }

        self.metrics.step_batches_served.inc();
        debug!(
            host_id = %host.id,
            cluster_id = %host.cluster_id,
            state = %host.state,
            steps = steps.len(),
            "assembled next steps"
        );
        Ok(steps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::StepType;
    use foundry_state::Cluster;

    const WORKER_INVENTORY: &str = r#"{
        "hostname": "worker-0",
        "cpu": {"count": 2},
        "memory": {"physical_bytes": 8589934592},
        "disks": [{"name": "sda", "size_bytes": 128849018880}],
        "interfaces": [{"name": "eth0", "ipv4_addresses": ["1.2.3.4/24"]}]
    }"#;

    fn test_manager() -> (InstructionManager, StateStore) {
        let store = StateStore::open_in_memory().unwrap();
        let manager = InstructionManager::new(
            store.clone(),
            InstructionConfig::default(),
            Arc::new(MetricsRegistry::new()),
        );
        (manager, store)
    }

    fn seed_cluster(store: &StateStore, id: &str, dns_name: &str) -> Cluster {
        let mut cluster = Cluster::new(id.to_string(), "test");
        cluster.api_vip_dns_name = dns_name.to_string();
        store.put_cluster(&cluster).unwrap();
        cluster
    }

    fn seed_host(store: &StateStore, cluster_id: &str, id: &str, state: HostState) -> Host {
        let mut host = Host::new(id.to_string(), cluster_id.to_string());
        host.state = state;
        host.inventory = WORKER_INVENTORY.to_string();
        store.put_host(&host).unwrap();
        host
    }

    #[test]
    fn discovering_host_gets_inventory_only() {
        let (manager, store) = test_manager();
        seed_cluster(&store, "c1", "");
        let host = seed_host(&store, "c1", "h1", HostState::Discovering);

        let steps = manager.get_next_steps(&host).unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].step_type, StepType::Inventory);
    }

    #[test]
    fn insufficient_host_gets_probe_batch_with_golden_api_vip_argument() {
        let (manager, store) = test_manager();
        seed_cluster(&store, "c1", "test.com");
        seed_host(&store, "c1", "h2", HostState::Insufficient);
        let host = seed_host(&store, "c1", "h1", HostState::Insufficient);

        let steps = manager.get_next_steps(&host).unwrap();
        let types: Vec<StepType> = steps.iter().map(|s| s.step_type).collect();
        assert_eq!(
            types,
            vec![
                StepType::Inventory,
                StepType::ConnectivityCheck,
                StepType::FreeAddresses,
                StepType::ApiVipConnectivityCheck,
            ]
        );
        let api_vip = steps.last().unwrap();
        assert_eq!(
            api_vip.args.last().unwrap(),
            "{\"url\":\"http://test.com:22624/config/worker\",\"verify_cidr\":true}"
        );
    }

    #[test]
    fn unknown_cluster_is_an_error_with_no_steps() {
        let (manager, _store) = test_manager();
        let host = Host::new("h1".to_string(), "nonexistent".to_string());

        let result = manager.get_next_steps(&host);
        assert!(matches!(result, Err(HostError::ClusterNotFound(_))));
    }

    #[test]
    fn preparing_host_gets_install() {
        let (manager, store) = test_manager();
        seed_cluster(&store, "c1", "");
        let host = seed_host(&store, "c1", "h1", HostState::PreparingForInstallation);

        let steps = manager.get_next_steps(&host).unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].step_type, StepType::Install);
    }

    #[test]
    fn installing_host_gets_stop_only_when_cancelled() {
        let (manager, store) = test_manager();
        seed_cluster(&store, "c1", "");
        let mut host = seed_host(&store, "c1", "h1", HostState::InstallingInProgress);
        assert!(manager.get_next_steps(&host).unwrap().is_empty());

        host.cancellation_requested = true;
        let steps = manager.get_next_steps(&host).unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].step_type, StepType::Execute);
    }

    #[test]
    fn terminal_and_disabled_hosts_get_nothing() {
        let (manager, store) = test_manager();
        seed_cluster(&store, "c1", "test.com");
        for state in [HostState::Installed, HostState::Disabled] {
            let host = seed_host(&store, "c1", "h1", state);
            assert!(manager.get_next_steps(&host).unwrap().is_empty());
        }
    }

    #[test]
    fn dhcp_step_included_for_dhcp_clusters() {
        let (manager, store) = test_manager();
        let mut cluster = seed_cluster(&store, "c1", "test.com");
        cluster.vip_dhcp_allocation = true;
        cluster.machine_network_cidr = "1.1.0.0/16".to_string();
        store.put_cluster(&cluster).unwrap();
        let host = seed_host(&store, "c1", "h1", HostState::Known);

        let steps = manager.get_next_steps(&host).unwrap();
        assert!(steps
            .iter()
            .any(|s| s.step_type == StepType::DhcpLeaseAllocate));
    }
}
