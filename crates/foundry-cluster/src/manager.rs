//! Cluster state machine.
//!
//! Aggregation is pure: [`aggregate`] maps a (cluster, hosts) snapshot to
//! the next cluster state. Transitions commit the row and one event in a
//! single write transaction, with the same optimistic retry the host
//! machine uses. Host-state changes land in a refresh queue instead of
//! re-entering this machine synchronously.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use foundry_events::EventSink;
use foundry_host::{HostManager, StatusCallback};
use foundry_leader::Elector;
use foundry_metrics::MetricsRegistry;
use foundry_state::{
    epoch_secs, Cluster, ClusterState, EventSeverity, Host, HostRole, HostState, StateStore,
};

use crate::validations::{all_passed, failures, validate_cluster};
use crate::{ClusterError, ClusterResult};

const TRANSITION_ATTEMPTS: u32 = 3;

/// Masters required for a multi-node topology.
const MULTI_NODE_MASTERS: usize = 3;

const STATUS_READY: &str = "Cluster ready to be installed";

/// Cluster ID refresh queue fed by the host machine's status callback.
pub type RefreshSender = mpsc::UnboundedSender<String>;
pub type RefreshReceiver = mpsc::UnboundedReceiver<String>;

pub fn refresh_channel() -> (RefreshSender, RefreshReceiver) {
    mpsc::unbounded_channel()
}

/// Build the narrow callback the host machine fires after a committed
/// transition. It only queues work.
pub fn host_status_callback(sender: RefreshSender) -> StatusCallback {
    Arc::new(move |cluster_id: &str, _host_id: &str, _state: HostState| {
        let _ = sender.send(cluster_id.to_string());
    })
}

/// Tunables of the cluster lifecycle manager.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Rows per monitor batch.
    pub monitor_batch_size: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            monitor_batch_size: 100,
        }
    }
}

/// Operator-supplied attributes at cluster registration.
#[derive(Debug, Clone, Default)]
pub struct ClusterParams {
    pub name: String,
    pub base_dns_domain: String,
    pub machine_network_cidr: String,
    pub api_vip: String,
    pub api_vip_dns_name: String,
    pub ingress_vip: String,
    pub vip_dhcp_allocation: bool,
    pub pull_secret: String,
    pub release_image: String,
    pub install_config_overrides: String,
}

/// Drives cluster registration, aggregation, and installation progress.
pub struct ClusterManager {
    store: StateStore,
    events: EventSink,
    hosts: Arc<HostManager>,
    cfg: ClusterConfig,
    metrics: Arc<MetricsRegistry>,
    elector: Arc<dyn Elector>,
    refresh_rx: Mutex<RefreshReceiver>,
}

impl ClusterManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: StateStore,
        events: EventSink,
        hosts: Arc<HostManager>,
        cfg: ClusterConfig,
        metrics: Arc<MetricsRegistry>,
        elector: Arc<dyn Elector>,
        refresh_rx: RefreshReceiver,
    ) -> Self {
        Self {
            store,
            events,
            hosts,
            cfg,
            metrics,
            elector,
            refresh_rx: Mutex::new(refresh_rx),
        }
    }

    // ── Operations ─────────────────────────────────────────────────

    /// Create a cluster row in its initial `insufficient` state.
    pub fn register_cluster(
        &self,
        params: ClusterParams,
        request_id: &str,
    ) -> ClusterResult<Cluster> {
        let id = uuid::Uuid::new_v4().to_string();
        let mut cluster = Cluster::new(id.clone(), &params.name);
        apply_params(&mut cluster, &params);

        self.store.with_write(|ctx| {
            ctx.put_cluster(&cluster)?;
            self.events.append_in(
                ctx,
                &id,
                None,
                EventSeverity::Info,
                &format!("Registered cluster \"{}\"", params.name),
                request_id,
            )
        })?;
        self.metrics.cluster_transitions.inc();
        info!(cluster_id = %id, name = %params.name, "cluster registered");
        Ok(cluster)
    }

    /// Update operator-editable attributes. Forbidden during installation.
    pub fn update_cluster(
        &self,
        cluster_id: &str,
        params: ClusterParams,
        request_id: &str,
    ) -> ClusterResult<Cluster> {
        let (cluster, ()) =
            self.transition(cluster_id, request_id, "update", |snapshot| {
                if installation_state(snapshot.state) {
                    return Err(ClusterError::InvalidStateTransition {
                        cluster_id: snapshot.id.clone(),
                        current: snapshot.state,
                        operation: "update",
                    });
                }
                let mut cluster = snapshot.clone();
                apply_params(&mut cluster, &params);
                Ok((cluster, None, ()))
            })?;
        self.refresh_cluster(cluster_id)?;
        Ok(self.store.get_cluster(cluster_id)?.unwrap_or(cluster))
    }

    /// Soft-delete a cluster; the deletion worker reaps it past retention.
    pub fn deregister_cluster(&self, cluster_id: &str, request_id: &str) -> ClusterResult<Cluster> {
        self.transition(cluster_id, request_id, "deregister", |snapshot| {
            if installation_state(snapshot.state) {
                return Err(ClusterError::InvalidStateTransition {
                    cluster_id: snapshot.id.clone(),
                    current: snapshot.state,
                    operation: "deregister",
                });
            }
            let mut cluster = snapshot.clone();
            cluster.deleted_at = Some(epoch_secs());
            let event = Some((
                EventSeverity::Info,
                format!("Deregistered cluster \"{}\"", cluster.name),
            ));
            Ok((cluster, event, ()))
        })
        .map(|(cluster, ())| cluster)
    }

    /// Start installing a ready cluster.
    ///
    /// Assigns `auto` roles, commands every known host into
    /// `preparing-for-installation`, and moves the cluster to `installing`.
    pub fn install_cluster(&self, cluster_id: &str, request_id: &str) -> ClusterResult<Cluster> {
        self.refresh_cluster(cluster_id)?;
        let cluster = self.require_cluster(cluster_id)?;

        match cluster.state {
            ClusterState::Ready => {}
            ClusterState::Insufficient | ClusterState::PendingForInput => {
                return Err(ClusterError::NotReady {
                    cluster_id: cluster_id.to_string(),
                    reasons: cluster.status_info.clone(),
                });
            }
            current => {
                return Err(ClusterError::InvalidStateTransition {
                    cluster_id: cluster_id.to_string(),
                    current,
                    operation: "install",
                });
            }
        }

        self.transition(cluster_id, request_id, "install", |snapshot| {
            if snapshot.state != ClusterState::Ready {
                return Err(ClusterError::InvalidStateTransition {
                    cluster_id: snapshot.id.clone(),
                    current: snapshot.state,
                    operation: "install",
                });
            }
            let mut cluster = snapshot.clone();
            cluster.install_started_at = Some(epoch_secs());
            Ok(status_change(
                snapshot,
                cluster,
                ClusterState::PreparingForInstallation,
                EventSeverity::Info,
                "Preparing cluster for installation",
            ))
        })?;

        let hosts = self.live_hosts(cluster_id)?;
        for (host, role) in assign_roles(&hosts) {
            if host.role == HostRole::Auto {
                self.hosts.update_role(cluster_id, &host.id, role, request_id)?;
            }
            self.hosts.install(cluster_id, &host.id, request_id)?;
        }

        self.transition(cluster_id, request_id, "install", |snapshot| {
            let cluster = snapshot.clone();
            Ok(status_change(
                snapshot,
                cluster,
                ClusterState::Installing,
                EventSeverity::Info,
                "Installation in progress",
            ))
        })
        .map(|(cluster, ())| cluster)
    }

    /// Cancel a running installation. Hosts land in `error` until reset.
    pub fn cancel_installation(&self, cluster_id: &str, request_id: &str) -> ClusterResult<Cluster> {
        let cluster = self.require_cluster(cluster_id)?;
        if !installation_state(cluster.state) {
            return Err(ClusterError::InvalidStateTransition {
                cluster_id: cluster_id.to_string(),
                current: cluster.state,
                operation: "cancel installation",
            });
        }

        for host in self.live_hosts(cluster_id)? {
            if host.state.is_installation() {
                self.hosts.cancel_installation(cluster_id, &host.id, request_id)?;
            }
        }

        self.transition(cluster_id, request_id, "cancel installation", |snapshot| {
            let cluster = snapshot.clone();
            Ok(status_change(
                snapshot,
                cluster,
                ClusterState::Error,
                EventSeverity::Warning,
                "Installation was canceled by the user",
            ))
        })
        .map(|(cluster, ())| cluster)
    }

    /// Reset a failed installation so hosts can rediscover.
    pub fn reset_cluster(&self, cluster_id: &str, request_id: &str) -> ClusterResult<Cluster> {
        let cluster = self.require_cluster(cluster_id)?;
        if cluster.state != ClusterState::Error {
            return Err(ClusterError::InvalidStateTransition {
                cluster_id: cluster_id.to_string(),
                current: cluster.state,
                operation: "reset",
            });
        }

        for host in self.live_hosts(cluster_id)? {
            if host.state == HostState::Error {
                self.hosts.reset_host(cluster_id, &host.id, request_id)?;
            }
        }

        self.transition(cluster_id, request_id, "reset", |snapshot| {
            let mut cluster = snapshot.clone();
            cluster.install_started_at = None;
            cluster.install_completed_at = None;
            cluster.progress = 0;
            Ok(status_change(
                snapshot,
                cluster,
                ClusterState::Insufficient,
                EventSeverity::Info,
                "Waiting for hosts to rediscover",
            ))
        })
        .map(|(cluster, ())| cluster)
    }

    /// Conclude post-install checks on a finalizing cluster.
    pub fn complete_installation(
        &self,
        cluster_id: &str,
        success: bool,
        detail: &str,
        request_id: &str,
    ) -> ClusterResult<Cluster> {
        self.transition(cluster_id, request_id, "complete installation", |snapshot| {
            if snapshot.state != ClusterState::Finalizing {
                return Err(ClusterError::InvalidStateTransition {
                    cluster_id: snapshot.id.clone(),
                    current: snapshot.state,
                    operation: "complete installation",
                });
            }
            let mut cluster = snapshot.clone();
            cluster.install_completed_at = Some(epoch_secs());
            if success {
                cluster.progress = 100;
                Ok(status_change(
                    snapshot,
                    cluster,
                    ClusterState::Installed,
                    EventSeverity::Info,
                    "Cluster installation completed",
                ))
            } else {
                let info = if detail.is_empty() {
                    "Cluster installation failed".to_string()
                } else {
                    format!("Cluster installation failed: {detail}")
                };
                let (cluster, event, ()) = status_change(
                    snapshot,
                    cluster,
                    ClusterState::Error,
                    EventSeverity::Critical,
                    &info,
                );
                Ok((cluster, event, ()))
            }
        })
        .map(|(cluster, ())| cluster)
    }

    /// Re-aggregate one cluster from its hosts.
    pub fn refresh_cluster(&self, cluster_id: &str) -> ClusterResult<()> {
        let cluster = self.require_cluster(cluster_id)?;
        if cluster.deleted_at.is_some() {
            return Ok(());
        }
        let hosts = self.live_hosts(cluster_id)?;
        let Some((next, severity, info)) = aggregate(&cluster, &hosts) else {
            return Ok(());
        };
        if next == cluster.state && info == cluster.status_info {
            return Ok(());
        }

        self.transition(cluster_id, "", "refresh", |snapshot| {
            let cluster = snapshot.clone();
            let (cluster, event, ()) = status_change(snapshot, cluster, next, severity, &info);
            Ok((cluster, event, ()))
        })?;
        Ok(())
    }

    // ── Monitor & queue ────────────────────────────────────────────

    /// Drain queued host-change refreshes. Never blocks.
    pub fn process_queued(&self) {
        let Ok(mut rx) = self.refresh_rx.try_lock() else {
            return;
        };
        let mut seen = std::collections::HashSet::new();
        while let Ok(cluster_id) = rx.try_recv() {
            if !seen.insert(cluster_id.clone()) {
                continue;
            }
            if let Err(e) = self.refresh_cluster(&cluster_id) {
                debug!(%cluster_id, error = %e, "queued refresh failed");
            }
        }
    }

    /// Long-running queue worker for the daemon.
    pub async fn run_refresh_queue(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        loop {
            let next = {
                let mut rx = self.refresh_rx.lock().await;
                tokio::select! {
                    next = rx.recv() => next,
                    _ = shutdown.changed() => return,
                }
            };
            match next {
                Some(cluster_id) => {
                    if let Err(e) = self.refresh_cluster(&cluster_id) {
                        debug!(%cluster_id, error = %e, "queued refresh failed");
                    }
                }
                None => return,
            }
        }
    }

    /// One monitor sweep over all clusters, in batches.
    pub fn cluster_monitoring(&self) {
        if !self.elector.is_leader() {
            return;
        }
        self.process_queued();

        let clusters = match self.store.list_clusters() {
            Ok(clusters) => clusters,
            Err(e) => {
                warn!(error = %e, "cluster monitor failed to list clusters");
                return;
            }
        };

        for batch in clusters.chunks(self.cfg.monitor_batch_size) {
            if !self.elector.is_leader() {
                debug!("leadership lost, aborting cluster monitor sweep");
                return;
            }
            for cluster in batch {
                if cluster.deleted_at.is_some()
                    || matches!(cluster.state, ClusterState::Installed | ClusterState::Error)
                {
                    continue;
                }
                if let Err(e) = self.refresh_cluster(&cluster.id) {
                    warn!(cluster_id = %cluster.id, error = %e, "cluster refresh failed");
                }
            }
        }
        self.metrics.cluster_monitor_ticks.inc();
    }

    // ── Internals ──────────────────────────────────────────────────

    fn require_cluster(&self, cluster_id: &str) -> ClusterResult<Cluster> {
        self.store
            .get_cluster(cluster_id)?
            .ok_or_else(|| ClusterError::ClusterNotFound(cluster_id.to_string()))
    }

    /// Hosts that participate in aggregation.
    fn live_hosts(&self, cluster_id: &str) -> ClusterResult<Vec<Host>> {
        let mut hosts: Vec<Host> = self
            .store
            .list_hosts_for_cluster(cluster_id)?
            .into_iter()
            .filter(|h| h.deleted_at.is_none() && h.state != HostState::Disabled)
            .collect();
        hosts.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(hosts)
    }

    /// Optimistic transition runner, mirroring the host machine's.
    fn transition<T>(
        &self,
        cluster_id: &str,
        request_id: &str,
        operation: &'static str,
        f: impl Fn(&Cluster) -> ClusterResult<(Cluster, Option<(EventSeverity, String)>, T)>,
    ) -> ClusterResult<(Cluster, T)> {
        for attempt in 0..TRANSITION_ATTEMPTS {
            let snapshot = self.require_cluster(cluster_id)?;
            let (cluster, event, value) = f(&snapshot)?;
            let state_changed = cluster.state != snapshot.state;

            let committed = self.store.with_write(|ctx| {
                let Some(current) = ctx.get_cluster(cluster_id)? else {
                    return Ok(false);
                };
                if current != snapshot {
                    return Ok(false);
                }
                ctx.put_cluster(&cluster)?;
                if let Some((severity, message)) = &event {
                    self.events
                        .append_in(ctx, cluster_id, None, *severity, message, request_id)?;
                }
                Ok(true)
            })?;

            if committed {
                if state_changed {
                    self.metrics.cluster_transitions.inc();
                }
                return Ok((cluster, value));
            }
            debug!(%cluster_id, operation, attempt, "cluster row changed under us, retrying");
        }
        Err(foundry_state::StateError::Conflict(cluster_id.to_string(), TRANSITION_ATTEMPTS).into())
    }
}

/// Pure aggregation: the next (state, severity, reason) for a cluster given
/// its live hosts, or `None` when no transition applies.
pub fn aggregate(
    cluster: &Cluster,
    hosts: &[Host],
) -> Option<(ClusterState, EventSeverity, String)> {
    let total = hosts.len();
    let count = |state: HostState| hosts.iter().filter(|h| h.state == state).count();

    match cluster.state {
        ClusterState::Insufficient | ClusterState::Ready | ClusterState::PendingForInput => {
            let known = count(HostState::Known);
            let checks = validate_cluster(cluster);
            let mut reasons = failures(&checks);
            if total == 0 {
                reasons.push("No registered hosts".to_string());
            } else if known < total {
                reasons.push(format!("{} of {total} hosts are ready", known));
            }
            if total > 1 && total < MULTI_NODE_MASTERS {
                reasons.push(format!(
                    "A multi-node cluster requires at least {MULTI_NODE_MASTERS} hosts"
                ));
            }

            if reasons.is_empty() {
                Some((ClusterState::Ready, EventSeverity::Info, STATUS_READY.to_string()))
            } else {
                Some((
                    ClusterState::Insufficient,
                    EventSeverity::Info,
                    format!("Cluster is not ready for installation: {}", reasons.join(", ")),
                ))
            }
        }

        ClusterState::PreparingForInstallation | ClusterState::Installing => {
            if hosts.iter().any(|h| h.state == HostState::Error) {
                return Some((
                    ClusterState::Error,
                    EventSeverity::Critical,
                    "Installation failed: a host entered error state".to_string(),
                ));
            }
            if total > 0 && hosts.iter().all(|h| h.state == HostState::Installed) {
                return Some((
                    ClusterState::Finalizing,
                    EventSeverity::Info,
                    "Finalizing cluster installation".to_string(),
                ));
            }
            if cluster.state == ClusterState::PreparingForInstallation
                && hosts.iter().any(|h| {
                    matches!(
                        h.state,
                        HostState::Installing | HostState::InstallingInProgress
                    )
                })
            {
                return Some((
                    ClusterState::Installing,
                    EventSeverity::Info,
                    "Installation in progress".to_string(),
                ));
            }
            None
        }

        // Terminal and day-2 states move only through explicit operations.
        ClusterState::Finalizing
        | ClusterState::Installed
        | ClusterState::Error
        | ClusterState::AddingHosts => None,
    }
}

/// Resolve `auto` roles at install time: the first three hosts become
/// masters (one in single-node), the rest workers. Declared roles win.
fn assign_roles(hosts: &[Host]) -> Vec<(Host, HostRole)> {
    let mut masters = hosts
        .iter()
        .filter(|h| h.role == HostRole::Master)
        .count();
    let mut out = Vec::new();
    for host in hosts {
        let role = match host.role {
            HostRole::Auto => {
                if masters < MULTI_NODE_MASTERS {
                    masters += 1;
                    HostRole::Master
                } else {
                    HostRole::Worker
                }
            }
            declared => declared,
        };
        out.push((host.clone(), role));
    }
    out
}

fn installation_state(state: ClusterState) -> bool {
    matches!(
        state,
        ClusterState::PreparingForInstallation
            | ClusterState::Installing
            | ClusterState::Finalizing
    )
}

fn apply_params(cluster: &mut Cluster, params: &ClusterParams) {
    if !params.name.is_empty() {
        cluster.name = params.name.clone();
    }
    cluster.base_dns_domain = params.base_dns_domain.clone();
    cluster.machine_network_cidr = params.machine_network_cidr.clone();
    cluster.api_vip = params.api_vip.clone();
    cluster.api_vip_dns_name = params.api_vip_dns_name.clone();
    cluster.ingress_vip = params.ingress_vip.clone();
    cluster.vip_dhcp_allocation = params.vip_dhcp_allocation;
    cluster.pull_secret = params.pull_secret.clone();
    cluster.release_image = params.release_image.clone();
    cluster.install_config_overrides = params.install_config_overrides.clone();
}

fn status_change(
    snapshot: &Cluster,
    mut cluster: Cluster,
    new_state: ClusterState,
    severity: EventSeverity,
    info: &str,
) -> (Cluster, Option<(EventSeverity, String)>, ()) {
    let old = snapshot.state;
    cluster.state = new_state;
    cluster.status_info = info.to_string();
    if old != new_state {
        cluster.status_updated_at = epoch_secs();
        let message = format!(
            "Cluster {}: updated status from \"{old}\" to \"{new_state}\" ({info})",
            cluster.id
        );
        (cluster, Some((severity, message)), ())
    } else {
        (cluster, None, ())
    }
}
