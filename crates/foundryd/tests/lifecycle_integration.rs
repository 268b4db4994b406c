//! Lifecycle integration tests.
//!
//! Exercises the host and cluster state machines together against an
//! in-memory store: disconnection by timeout, reconnection, batched
//! monitoring at fleet scale, and the full install flow invariants.

use std::sync::Arc;

use foundry_cluster::{
    host_status_callback, refresh_channel, ClusterConfig, ClusterManager, ClusterParams,
};
use foundry_events::EventSink;
use foundry_hardware::HardwareValidator;
use foundry_host::{HostConfig, HostManager, InstructionConfig, InstructionManager};
use foundry_leader::DummyElector;
use foundry_metrics::MetricsRegistry;
use foundry_state::{
    epoch_secs, ClusterState, EventSeverity, HostState, StateStore,
};

struct Service {
    store: StateStore,
    hosts: Arc<HostManager>,
    clusters: Arc<ClusterManager>,
    instructions: InstructionManager,
}

fn service() -> Service {
    let store = StateStore::open_in_memory().unwrap();
    let metrics = Arc::new(MetricsRegistry::new());
    let events = EventSink::new(store.clone(), metrics.clone());
    let (tx, rx) = refresh_channel();
    let hosts = Arc::new(
        HostManager::new(
            store.clone(),
            events.clone(),
            HardwareValidator::default(),
            HostConfig::default(),
            metrics.clone(),
            Arc::new(DummyElector),
        )
        .with_status_callback(host_status_callback(tx)),
    );
    let clusters = Arc::new(ClusterManager::new(
        store.clone(),
        events,
        hosts.clone(),
        ClusterConfig::default(),
        metrics.clone(),
        Arc::new(DummyElector),
        rx,
    ));
    let instructions = InstructionManager::new(store.clone(), InstructionConfig::default(), metrics);
    Service {
        store,
        hosts,
        clusters,
        instructions,
    }
}

fn worker_inventory(hostname: &str) -> String {
    format!(
        r#"{{
            "hostname": "{hostname}",
            "cpu": {{"count": 4}},
            "memory": {{"physical_bytes": 17179869184}},
            "disks": [{{"name": "sda", "size_bytes": 256000000000}}],
            "interfaces": [{{"name": "eth0", "ipv4_addresses": ["1.1.3.4/24"]}}]
        }}"#
    )
}

fn test_cluster(svc: &Service, cidr: &str) -> String {
    let cluster = svc
        .clusters
        .register_cluster(
            ClusterParams {
                name: "test-cluster".to_string(),
                base_dns_domain: "example.com".to_string(),
                machine_network_cidr: cidr.to_string(),
                api_vip: "1.1.0.10".to_string(),
                api_vip_dns_name: "test.com".to_string(),
                ingress_vip: "1.1.0.11".to_string(),
                vip_dhcp_allocation: false,
                pull_secret: "{\"auths\":{}}".to_string(),
                release_image: "quay.io/release:4.6".to_string(),
                install_config_overrides: String::new(),
            },
            "",
        )
        .unwrap();
    cluster.id
}

fn backdate(svc: &Service, cluster_id: &str, host_id: &str, secs: u64) {
    let mut host = svc.store.get_host(cluster_id, host_id).unwrap().unwrap();
    host.checked_in_at = epoch_secs() - secs;
    svc.store.put_host(&host).unwrap();
}

#[test]
fn disconnection_by_timeout() {
    let svc = service();
    let cluster_id = test_cluster(&svc, "1.1.0.0/16");
    svc.hosts.register_host(&cluster_id, "h1", "").unwrap();
    svc.hosts
        .update_inventory(&cluster_id, "h1", &worker_inventory("h1"), "")
        .unwrap();
    assert_eq!(
        svc.store.get_host(&cluster_id, "h1").unwrap().unwrap().state,
        HostState::Known
    );
    backdate(&svc, &cluster_id, "h1", 4 * 60);

    svc.hosts.host_monitoring();

    let host = svc.store.get_host(&cluster_id, "h1").unwrap().unwrap();
    assert_eq!(host.state, HostState::Disconnected);

    let warnings: Vec<_> = svc
        .store
        .list_events(&cluster_id, Some("h1"))
        .unwrap()
        .into_iter()
        .filter(|e| e.severity == EventSeverity::Warning)
        .collect();
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0]
        .message
        .contains("updated status from \"known\" to \"disconnected\""));
}

#[test]
fn reconnection_returns_to_discovering() {
    let svc = service();
    let cluster_id = test_cluster(&svc, "1.1.0.0/16");
    svc.hosts.register_host(&cluster_id, "h1", "").unwrap();

    let mut host = svc.store.get_host(&cluster_id, "h1").unwrap().unwrap();
    host.state = HostState::Disconnected;
    host.inventory.clear();
    host.checked_in_at = epoch_secs();
    svc.store.put_host(&host).unwrap();

    svc.hosts.host_monitoring();

    let host = svc.store.get_host(&cluster_id, "h1").unwrap().unwrap();
    assert_eq!(host.state, HostState::Discovering);
    let last = svc
        .store
        .list_events(&cluster_id, Some("h1"))
        .unwrap()
        .pop()
        .unwrap();
    assert_eq!(last.severity, EventSeverity::Info);
}

#[test]
fn batched_monitor_disconnects_765_hosts_across_77_clusters() {
    let svc = service();
    let mut cluster_id = String::new();
    for i in 0..765 {
        if i % 10 == 0 {
            cluster_id = test_cluster(&svc, "1.1.0.0/16");
        }
        let host_id = uuid::Uuid::new_v4().to_string();
        svc.hosts.register_host(&cluster_id, &host_id, "").unwrap();
        backdate(&svc, &cluster_id, &host_id, 4 * 60);
    }
    assert_eq!(
        svc.store
            .list_clusters()
            .unwrap()
            .len(),
        77
    );

    svc.hosts.host_monitoring();

    let disconnected = svc
        .store
        .list_hosts()
        .unwrap()
        .into_iter()
        .filter(|h| h.state == HostState::Disconnected)
        .count();
    assert_eq!(disconnected, 765);
}

#[test]
fn next_steps_for_insufficient_host_carries_golden_api_vip_argument() {
    let svc = service();
    let cluster_id = test_cluster(&svc, "1.1.0.0/16");
    svc.hosts.register_host(&cluster_id, "h1", "").unwrap();
    let mut host = svc.store.get_host(&cluster_id, "h1").unwrap().unwrap();
    host.state = HostState::Insufficient;
    host.inventory = worker_inventory("h1");
    svc.store.put_host(&host).unwrap();

    let steps = svc.instructions.get_next_steps(&host).unwrap();
    let api_vip = steps
        .iter()
        .find(|s| s.step_type == foundry_host::StepType::ApiVipConnectivityCheck)
        .expect("api-vip step present");
    assert_eq!(
        api_vip.args.last().unwrap(),
        "{\"url\":\"http://test.com:22624/config/worker\",\"verify_cidr\":true}"
    );
}

#[test]
fn next_steps_for_unknown_cluster_errors_with_no_steps() {
    let svc = service();
    let host = foundry_state::Host::new("h1".to_string(), uuid::Uuid::new_v4().to_string());
    let result = svc.instructions.get_next_steps(&host);
    assert!(result.is_err());
}

#[test]
fn installed_cluster_implies_all_hosts_installed() {
    let svc = service();
    let cluster_id = test_cluster(&svc, "1.1.0.0/16");
    for host_id in ["h1", "h2", "h3"] {
        svc.hosts.register_host(&cluster_id, host_id, "").unwrap();
        svc.hosts
            .update_inventory(&cluster_id, host_id, &worker_inventory(host_id), "")
            .unwrap();
    }
    svc.clusters.process_queued();
    svc.clusters.install_cluster(&cluster_id, "").unwrap();

    for host_id in ["h1", "h2", "h3"] {
        svc.hosts
            .update_install_progress(&cluster_id, host_id, "Starting installation", "", "")
            .unwrap();
        svc.hosts
            .update_install_progress(&cluster_id, host_id, "Done", "", "")
            .unwrap();
    }
    svc.clusters.process_queued();
    svc.clusters
        .complete_installation(&cluster_id, true, "", "")
        .unwrap();

    let cluster = svc.store.get_cluster(&cluster_id).unwrap().unwrap();
    assert_eq!(cluster.state, ClusterState::Installed);
    for host in svc.store.list_hosts_for_cluster(&cluster_id).unwrap() {
        assert_eq!(host.state, HostState::Installed);
    }
}

#[test]
fn event_times_are_monotonic_per_host() {
    let svc = service();
    let cluster_id = test_cluster(&svc, "1.1.0.0/16");
    svc.hosts.register_host(&cluster_id, "h1", "").unwrap();
    svc.hosts
        .update_inventory(&cluster_id, "h1", &worker_inventory("h1"), "")
        .unwrap();
    svc.hosts.install(&cluster_id, "h1", "").unwrap();
    svc.hosts
        .update_install_progress(&cluster_id, "h1", "Starting installation", "", "")
        .unwrap();

    let events = svc.store.list_events(&cluster_id, Some("h1")).unwrap();
    assert!(events.len() >= 4);
    for pair in events.windows(2) {
        assert!(pair[1].event_time >= pair[0].event_time);
    }
}
