//! Host state machine.
//!
//! All transitions commit the new state, the status message, the bumped
//! `status_updated_at`, and exactly one event in one write transaction.
//! API-driven transitions read a snapshot first and commit only if the row
//! is unchanged, retrying up to three times on a lost race — the optimistic
//! substitute for row-level locks the backing store does not provide.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use foundry_events::EventSink;
use foundry_hardware::{
    failure_messages, is_sufficient, parse_inventory, validator::ValidationRole,
    ClusterConstraints, HardwareValidator,
};
use foundry_leader::Elector;
use foundry_metrics::MetricsRegistry;
use foundry_state::{
    epoch_secs, Cluster, EventSeverity, Host, HostProgress, HostRole, HostState, StateError,
    StateResult, StateStore, StepResult, WriteCtx,
};

use crate::{HostError, HostResult};

/// Retry budget for optimistic transition commits.
const TRANSITION_ATTEMPTS: u32 = 3;

/// Install-progress stage reported by the agent on success.
pub const PROGRESS_DONE: &str = "Done";
/// Prefix of install-progress stages reported on failure.
pub const PROGRESS_FAILED_PREFIX: &str = "Failed";

const STATUS_DISCOVERING: &str = "Waiting for host to send hardware details";
const STATUS_DISCONNECTED: &str =
    "Host has stopped communicating with the installation service";
const STATUS_KNOWN: &str = "Host is ready to be installed";

/// Invoked after a committed transition changed a host's state.
///
/// The cluster state machine owns this callback and must only queue work;
/// it never calls back into the host machine synchronously.
pub type StatusCallback = Arc<dyn Fn(&str, &str, HostState) + Send + Sync>;

/// Tunables of the host lifecycle manager.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Silence threshold before a host is demoted to `disconnected`.
    pub disconnection_timeout: Duration,
    /// Rows per monitor batch.
    pub monitor_batch_size: usize,
    /// Retained step results per host, oldest dropped first.
    pub max_step_results: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            disconnection_timeout: Duration::from_secs(3 * 60),
            monitor_batch_size: 100,
            max_step_results: 50,
        }
    }
}

/// What one transition wants committed.
struct Commit {
    host: Host,
    event: Option<(EventSeverity, String)>,
}

/// Drives host registration, evidence intake, and state transitions.
pub struct HostManager {
    store: StateStore,
    events: EventSink,
    validator: HardwareValidator,
    cfg: HostConfig,
    metrics: Arc<MetricsRegistry>,
    elector: Arc<dyn Elector>,
    on_status_change: Option<StatusCallback>,
}

impl HostManager {
    pub fn new(
        store: StateStore,
        events: EventSink,
        validator: HardwareValidator,
        cfg: HostConfig,
        metrics: Arc<MetricsRegistry>,
        elector: Arc<dyn Elector>,
    ) -> Self {
        Self {
            store,
            events,
            validator,
            cfg,
            metrics,
            elector,
            on_status_change: None,
        }
    }

    /// Set the callback fired after a committed state change.
    pub fn with_status_callback(mut self, callback: StatusCallback) -> Self {
        self.on_status_change = Some(callback);
        self
    }

    // ── Operations ─────────────────────────────────────────────────

    /// Register a host, or reset an existing registration to `discovering`.
    ///
    /// Re-registering a host that is installing or installed is a
    /// precondition failure.
    pub fn register_host(
        &self,
        cluster_id: &str,
        host_id: &str,
        request_id: &str,
    ) -> HostResult<Host> {
        self.require_cluster(cluster_id)?;

        if let Some(existing) = self.store.get_host(cluster_id, host_id)? {
            if existing.state.is_installation() || existing.state == HostState::Installed {
                return Err(HostError::InvalidStateTransition {
                    host_id: host_id.to_string(),
                    current: existing.state,
                    operation: "register",
                });
            }
            return self
                .transition(cluster_id, host_id, request_id, "register", |snapshot| {
                    let mut host = snapshot.clone();
                    host.inventory.clear();
                    host.hw_info.clear();
                    host.connectivity.clear();
                    host.progress = HostProgress::default();
                    host.step_results.clear();
                    host.cancellation_requested = false;
                    host.checked_in_at = epoch_secs();
                    host.deleted_at = None;
                    Ok(self.status_commit(
                        snapshot,
                        host,
                        HostState::Discovering,
                        EventSeverity::Info,
                        STATUS_DISCOVERING,
                    ))
                })
                .map(|(host, ())| host);
        }

        let host = Host::new(host_id.to_string(), cluster_id.to_string());
        self.store.with_write(|ctx| {
            ctx.put_host(&host)?;
            self.events.append_in(
                ctx,
                cluster_id,
                Some(host_id),
                EventSeverity::Info,
                &format!("Host {host_id}: registered to cluster"),
                request_id,
            )
        })?;
        self.metrics.host_transitions.inc();
        self.notify(&host);
        info!(%cluster_id, %host_id, "host registered");
        Ok(host)
    }

    /// Soft-delete a host; the deletion worker reaps it past retention.
    pub fn deregister_host(
        &self,
        cluster_id: &str,
        host_id: &str,
        request_id: &str,
    ) -> HostResult<Host> {
        self.transition(cluster_id, host_id, request_id, "deregister", |snapshot| {
            if snapshot.state.is_installation() {
                return Err(HostError::InvalidStateTransition {
                    host_id: snapshot.id.clone(),
                    current: snapshot.state,
                    operation: "deregister",
                });
            }
            let mut host = snapshot.clone();
            host.deleted_at = Some(epoch_secs());
            Ok((
                Commit {
                    host,
                    event: Some((
                        EventSeverity::Info,
                        format!("Host {host_id}: deregistered from cluster"),
                    )),
                },
                (),
            ))
        })
        .map(|(host, ())| host)
    }

    /// Apply a freshly reported inventory and re-run hardware validation.
    pub fn update_inventory(
        &self,
        cluster_id: &str,
        host_id: &str,
        inventory: &str,
        request_id: &str,
    ) -> HostResult<Host> {
        let parsed = parse_inventory(inventory)
            .map_err(|e| HostError::InvalidInventory(e.to_string()))?;
        let cluster = self.require_cluster(cluster_id)?;
        let constraints = self.constraints_for(&cluster, host_id)?;

        self.transition(cluster_id, host_id, request_id, "update inventory", |snapshot| {
            const ALLOWED: &[HostState] = &[
                HostState::Discovering,
                HostState::Known,
                HostState::Insufficient,
                HostState::PendingForInput,
                HostState::Disconnected,
            ];
            if !ALLOWED.contains(&snapshot.state) {
                return Err(HostError::InvalidStateTransition {
                    host_id: snapshot.id.clone(),
                    current: snapshot.state,
                    operation: "update inventory",
                });
            }

            let results =
                self.validator
                    .validate(&parsed, &constraints, validation_role(snapshot.role));
            let mut host = snapshot.clone();
            host.inventory = inventory.to_string();
            host.checked_in_at = epoch_secs();

            if is_sufficient(&results) {
                Ok(self.status_commit(
                    snapshot,
                    host,
                    HostState::Known,
                    EventSeverity::Info,
                    STATUS_KNOWN,
                ))
            } else {
                let info = format!(
                    "Host does not meet the minimum hardware requirements: {}",
                    failure_messages(&results).join(", ")
                );
                let (commit, ()) = self.status_commit(
                    snapshot,
                    host,
                    HostState::Insufficient,
                    EventSeverity::Warning,
                    &info,
                );
                Ok((commit, ()))
            }
        })
        .map(|(host, ())| host)
    }

    /// Apply a legacy hardware-info report from an older agent.
    ///
    /// Stored alongside the inventory; it drives validation only while no
    /// modern inventory has arrived.
    pub fn update_hw_info(
        &self,
        cluster_id: &str,
        host_id: &str,
        hw_info: &str,
        request_id: &str,
    ) -> HostResult<Host> {
        let parsed = parse_inventory(hw_info)
            .map_err(|e| HostError::InvalidInventory(e.to_string()))?;
        let cluster = self.require_cluster(cluster_id)?;
        let constraints = self.constraints_for(&cluster, host_id)?;

        self.transition(cluster_id, host_id, request_id, "update hardware info", |snapshot| {
            const ALLOWED: &[HostState] = &[
                HostState::Discovering,
                HostState::Known,
                HostState::Insufficient,
                HostState::PendingForInput,
                HostState::Disconnected,
            ];
            if !ALLOWED.contains(&snapshot.state) {
                return Err(HostError::InvalidStateTransition {
                    host_id: snapshot.id.clone(),
                    current: snapshot.state,
                    operation: "update hardware info",
                });
            }

            let mut host = snapshot.clone();
            host.hw_info = hw_info.to_string();
            host.checked_in_at = epoch_secs();
            if !snapshot.inventory.is_empty() {
                return Ok((Commit { host, event: None }, ()));
            }

            let results =
                self.validator
                    .validate(&parsed, &constraints, validation_role(snapshot.role));
            if is_sufficient(&results) {
                Ok(self.status_commit(
                    snapshot,
                    host,
                    HostState::Known,
                    EventSeverity::Info,
                    STATUS_KNOWN,
                ))
            } else {
                let info = format!(
                    "Host does not meet the minimum hardware requirements: {}",
                    failure_messages(&results).join(", ")
                );
                let (commit, ()) = self.status_commit(
                    snapshot,
                    host,
                    HostState::Insufficient,
                    EventSeverity::Warning,
                    &info,
                );
                Ok((commit, ()))
            }
        })
        .map(|(host, ())| host)
    }

    /// Record the agent's connectivity report. No state change.
    pub fn update_connectivity(
        &self,
        cluster_id: &str,
        host_id: &str,
        connectivity: &str,
        request_id: &str,
    ) -> HostResult<Host> {
        self.transition(cluster_id, host_id, request_id, "update connectivity", |snapshot| {
            let mut host = snapshot.clone();
            host.connectivity = connectivity.to_string();
            host.checked_in_at = epoch_secs();
            Ok((Commit { host, event: None }, ()))
        })
        .map(|(host, ())| host)
    }

    /// Mark an agent poll. Refreshes `checked_in_at` without an event.
    pub fn check_in(&self, cluster_id: &str, host_id: &str) -> HostResult<Host> {
        self.transition(cluster_id, host_id, "", "check in", |snapshot| {
            let mut host = snapshot.clone();
            host.checked_in_at = epoch_secs();
            Ok((Commit { host, event: None }, ()))
        })
        .map(|(host, ())| host)
    }

    /// Change the host's declared role. Only valid before installation.
    pub fn update_role(
        &self,
        cluster_id: &str,
        host_id: &str,
        role: HostRole,
        request_id: &str,
    ) -> HostResult<Host> {
        self.transition(cluster_id, host_id, request_id, "update role", |snapshot| {
            const ALLOWED: &[HostState] = &[
                HostState::Discovering,
                HostState::Known,
                HostState::Insufficient,
                HostState::PendingForInput,
                HostState::Disconnected,
            ];
            if !ALLOWED.contains(&snapshot.state) {
                return Err(HostError::InvalidStateTransition {
                    host_id: snapshot.id.clone(),
                    current: snapshot.state,
                    operation: "update role",
                });
            }
            let mut host = snapshot.clone();
            host.role = role;
            Ok((Commit { host, event: None }, ()))
        })
        .map(|(host, ())| host)
    }

    /// Move a `known` host into `preparing-for-installation`.
    ///
    /// Only the cluster state machine calls this; hosts never enter
    /// installation unilaterally.
    pub fn install(&self, cluster_id: &str, host_id: &str, request_id: &str) -> HostResult<Host> {
        self.transition(cluster_id, host_id, request_id, "install", |snapshot| {
            if snapshot.state != HostState::Known {
                return Err(HostError::InvalidStateTransition {
                    host_id: snapshot.id.clone(),
                    current: snapshot.state,
                    operation: "install",
                });
            }
            let host = snapshot.clone();
            Ok(self.status_commit(
                snapshot,
                host,
                HostState::PreparingForInstallation,
                EventSeverity::Info,
                "Host is preparing for installation",
            ))
        })
        .map(|(host, ())| host)
    }

    /// Apply an agent-reported installation progress stage.
    ///
    /// `Done` completes the installation, a `Failed …` stage fails it, and
    /// any other stage advances the host into `installing-in-progress`.
    pub fn update_install_progress(
        &self,
        cluster_id: &str,
        host_id: &str,
        stage: &str,
        progress_info: &str,
        request_id: &str,
    ) -> HostResult<Host> {
        self.transition(cluster_id, host_id, request_id, "report progress", |snapshot| {
            if !snapshot.state.is_installation() {
                return Err(HostError::InvalidStateTransition {
                    host_id: snapshot.id.clone(),
                    current: snapshot.state,
                    operation: "report progress",
                });
            }

            let now = epoch_secs();
            let mut host = snapshot.clone();
            host.checked_in_at = now;
            if host.progress.stage != stage {
                host.progress.stage = stage.to_string();
                host.progress.stage_started_at = now;
            }
            host.progress.stage_updated_at = now;
            host.progress.progress_info = progress_info.to_string();

            if stage == PROGRESS_DONE {
                return Ok(self.status_commit(
                    snapshot,
                    host,
                    HostState::Installed,
                    EventSeverity::Info,
                    "Installation completed",
                ));
            }
            if stage.starts_with(PROGRESS_FAILED_PREFIX) {
                let info = format!("Installation failed: {stage}");
                let (commit, ()) = self.status_commit(
                    snapshot,
                    host,
                    HostState::Error,
                    EventSeverity::Error,
                    &info,
                );
                return Ok((commit, ()));
            }
            let next = match snapshot.state {
                HostState::PreparingForInstallation => HostState::Installing,
                _ => HostState::InstallingInProgress,
            };
            let info = format!("Installation in progress: {stage}");
            let (commit, ()) =
                self.status_commit(snapshot, host, next, EventSeverity::Info, &info);
            Ok((commit, ()))
        })
        .map(|(host, ())| host)
    }

    /// Record a step result in the host's result bag.
    pub fn report_step_result(
        &self,
        cluster_id: &str,
        host_id: &str,
        result: StepResult,
        request_id: &str,
    ) -> HostResult<Host> {
        let max = self.cfg.max_step_results;
        self.transition(cluster_id, host_id, request_id, "report step result", move |snapshot| {
            let mut host = snapshot.clone();
            host.checked_in_at = epoch_secs();
            host.step_results.push(result.clone());
            if host.step_results.len() > max {
                let excess = host.step_results.len() - max;
                host.step_results.drain(..excess);
            }
            Ok((Commit { host, event: None }, ()))
        })
        .map(|(host, ())| host)
    }

    /// Cancel a running installation. The host lands in `error` until reset.
    pub fn cancel_installation(
        &self,
        cluster_id: &str,
        host_id: &str,
        request_id: &str,
    ) -> HostResult<Host> {
        self.transition(cluster_id, host_id, request_id, "cancel installation", |snapshot| {
            if snapshot.state == HostState::Error {
                return Ok((
                    Commit {
                        host: snapshot.clone(),
                        event: None,
                    },
                    (),
                ));
            }
            if !snapshot.state.is_installation() {
                return Err(HostError::InvalidStateTransition {
                    host_id: snapshot.id.clone(),
                    current: snapshot.state,
                    operation: "cancel installation",
                });
            }
            let mut host = snapshot.clone();
            host.cancellation_requested = true;
            let (commit, ()) = self.status_commit(
                snapshot,
                host,
                HostState::Error,
                EventSeverity::Warning,
                "Installation was canceled by the user",
            );
            Ok((commit, ()))
        })
        .map(|(host, ())| host)
    }

    /// Reset a failed host so its agent can wipe leftovers and re-register.
    ///
    /// Install progress is cleared here; it restarts from zero when the
    /// host re-enters `discovering`.
    pub fn reset_host(&self, cluster_id: &str, host_id: &str, request_id: &str) -> HostResult<Host> {
        self.transition(cluster_id, host_id, request_id, "reset", |snapshot| {
            const ALLOWED: &[HostState] =
                &[HostState::Error, HostState::ResettingPendingUserAction];
            if !ALLOWED.contains(&snapshot.state) {
                return Err(HostError::InvalidStateTransition {
                    host_id: snapshot.id.clone(),
                    current: snapshot.state,
                    operation: "reset",
                });
            }
            let mut host = snapshot.clone();
            host.progress = HostProgress::default();
            host.cancellation_requested = false;
            Ok(self.status_commit(
                snapshot,
                host,
                HostState::Resetting,
                EventSeverity::Info,
                "Host is resetting its installation",
            ))
        })
        .map(|(host, ())| host)
    }

    /// Take a host out of service.
    pub fn disable_host(
        &self,
        cluster_id: &str,
        host_id: &str,
        request_id: &str,
    ) -> HostResult<Host> {
        self.transition(cluster_id, host_id, request_id, "disable", |snapshot| {
            const ALLOWED: &[HostState] = &[
                HostState::Discovering,
                HostState::Known,
                HostState::Insufficient,
                HostState::PendingForInput,
                HostState::Disconnected,
            ];
            if !ALLOWED.contains(&snapshot.state) {
                return Err(HostError::InvalidStateTransition {
                    host_id: snapshot.id.clone(),
                    current: snapshot.state,
                    operation: "disable",
                });
            }
            let host = snapshot.clone();
            Ok(self.status_commit(
                snapshot,
                host,
                HostState::Disabled,
                EventSeverity::Info,
                "Host was manually disabled",
            ))
        })
        .map(|(host, ())| host)
    }

    /// Return a disabled host to discovery.
    pub fn enable_host(
        &self,
        cluster_id: &str,
        host_id: &str,
        request_id: &str,
    ) -> HostResult<Host> {
        self.transition(cluster_id, host_id, request_id, "enable", |snapshot| {
            if snapshot.state != HostState::Disabled {
                return Err(HostError::InvalidStateTransition {
                    host_id: snapshot.id.clone(),
                    current: snapshot.state,
                    operation: "enable",
                });
            }
            let mut host = snapshot.clone();
            host.inventory.clear();
            Ok(self.status_commit(
                snapshot,
                host,
                HostState::Discovering,
                EventSeverity::Info,
                STATUS_DISCOVERING,
            ))
        })
        .map(|(host, ())| host)
    }

    // ── Monitor ────────────────────────────────────────────────────

    /// One monitor sweep over all hosts, in batches.
    ///
    /// Each batch runs in its own short-lived transaction; a failing row
    /// logs and does not stop the batch. The sweep aborts between batches
    /// when leadership is lost.
    pub fn host_monitoring(&self) {
        if !self.elector.is_leader() {
            return;
        }
        let keys = match self.store.list_host_keys() {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "host monitor failed to list hosts");
                return;
            }
        };

        for batch in keys.chunks(self.cfg.monitor_batch_size) {
            if !self.elector.is_leader() {
                debug!("leadership lost, aborting host monitor sweep");
                return;
            }
            let mut changed: Vec<Host> = Vec::new();
            let result = self.store.with_write(|ctx| {
                for (cluster_id, host_id) in batch {
                    match self.refresh_row(ctx, cluster_id, host_id) {
                        Ok(Some(host)) => changed.push(host),
                        Ok(None) => {}
                        Err(e) => {
                            warn!(%cluster_id, %host_id, error = %e, "host refresh failed");
                        }
                    }
                }
                Ok(())
            });
            match result {
                Ok(()) => {
                    for host in &changed {
                        self.metrics.host_transitions.inc();
                        self.notify(host);
                    }
                }
                Err(e) => {
                    // Whole-batch failure: leave the rows to the next tick.
                    warn!(error = %e, "host monitor batch failed");
                }
            }
        }
        self.metrics.host_monitor_ticks.inc();
    }

    /// Apply `RefreshStatus` to one host row inside the batch transaction.
    ///
    /// Returns the updated host if its state changed.
    fn refresh_row(
        &self,
        ctx: &WriteCtx<'_>,
        cluster_id: &str,
        host_id: &str,
    ) -> StateResult<Option<Host>> {
        let Some(mut host) = ctx.get_host(cluster_id, host_id)? else {
            return Ok(None);
        };
        if host.deleted_at.is_some() || host.state.is_terminal() {
            return Ok(None);
        }

        let now = epoch_secs();
        let timed_out =
            now.saturating_sub(host.checked_in_at) > self.cfg.disconnection_timeout.as_secs();

        const MONITORED: &[HostState] = &[
            HostState::Known,
            HostState::Insufficient,
            HostState::Discovering,
            HostState::PendingForInput,
        ];

        if MONITORED.contains(&host.state) && timed_out {
            self.apply_status(
                ctx,
                &mut host,
                HostState::Disconnected,
                EventSeverity::Warning,
                STATUS_DISCONNECTED,
                "",
            )?;
            return Ok(Some(host));
        }

        if host.state == HostState::Disconnected && !timed_out {
            host.inventory.clear();
            self.apply_status(
                ctx,
                &mut host,
                HostState::Discovering,
                EventSeverity::Info,
                STATUS_DISCOVERING,
                "",
            )?;
            return Ok(Some(host));
        }

        // Re-run validation so constraint changes propagate without agent
        // traffic.
        if matches!(
            host.state,
            HostState::Known | HostState::Insufficient | HostState::Discovering
        ) && !host.inventory.is_empty()
        {
            let Ok(parsed) = parse_inventory(&host.inventory) else {
                return Ok(None);
            };
            let Some(cluster) = ctx.get_cluster(cluster_id)? else {
                return Ok(None);
            };
            let peers = self.store.list_hosts_for_cluster(cluster_id)?;
            let results = self.validator.validate(
                &parsed,
                &constraints(&cluster, host_id, &peers),
                validation_role(host.role),
            );
            let (next, severity, info) = if is_sufficient(&results) {
                (HostState::Known, EventSeverity::Info, STATUS_KNOWN.to_string())
            } else {
                (
                    HostState::Insufficient,
                    EventSeverity::Warning,
                    format!(
                        "Host does not meet the minimum hardware requirements: {}",
                        failure_messages(&results).join(", ")
                    ),
                )
            };
            if next != host.state {
                self.apply_status(ctx, &mut host, next, severity, &info, "")?;
                return Ok(Some(host));
            }
        }

        Ok(None)
    }

    // ── Internals ──────────────────────────────────────────────────

    fn require_cluster(&self, cluster_id: &str) -> HostResult<Cluster> {
        self.store
            .get_cluster(cluster_id)?
            .ok_or_else(|| HostError::ClusterNotFound(cluster_id.to_string()))
    }

    fn constraints_for(&self, cluster: &Cluster, host_id: &str) -> HostResult<ClusterConstraints> {
        let peers = self.store.list_hosts_for_cluster(&cluster.id)?;
        Ok(constraints(cluster, host_id, &peers))
    }

    /// Build the commit for a status change, or a silent field update when
    /// the state is unchanged.
    fn status_commit(
        &self,
        snapshot: &Host,
        mut host: Host,
        new_state: HostState,
        severity: EventSeverity,
        info: &str,
    ) -> (Commit, ()) {
        let old = snapshot.state;
        host.state = new_state;
        host.status_info = info.to_string();
        if old != new_state {
            host.status_updated_at = epoch_secs();
            let message = status_event_message(&host.id, old, new_state, info);
            (
                Commit {
                    host,
                    event: Some((severity, message)),
                },
                (),
            )
        } else {
            (Commit { host, event: None }, ())
        }
    }

    /// Commit a status change directly inside an open transaction (monitor
    /// path).
    fn apply_status(
        &self,
        ctx: &WriteCtx<'_>,
        host: &mut Host,
        new_state: HostState,
        severity: EventSeverity,
        info: &str,
        request_id: &str,
    ) -> StateResult<()> {
        let old = host.state;
        host.state = new_state;
        host.status_info = info.to_string();
        host.status_updated_at = epoch_secs();
        ctx.put_host(host)?;
        self.events.append_in(
            ctx,
            &host.cluster_id,
            Some(&host.id),
            severity,
            &status_event_message(&host.id, old, new_state, info),
            request_id,
        )?;
        Ok(())
    }

    /// Optimistic transition runner: snapshot, compute, compare-and-commit.
    fn transition<T>(
        &self,
        cluster_id: &str,
        host_id: &str,
        request_id: &str,
        operation: &'static str,
        f: impl Fn(&Host) -> HostResult<(Commit, T)>,
    ) -> HostResult<(Host, T)> {
        for attempt in 0..TRANSITION_ATTEMPTS {
            let snapshot = self
                .store
                .get_host(cluster_id, host_id)?
                .ok_or_else(|| HostError::HostNotFound(host_id.to_string()))?;
            let (commit, value) = f(&snapshot)?;
            let state_changed = commit.host.state != snapshot.state;

            let committed = self.store.with_write(|ctx| {
                let Some(current) = ctx.get_host(cluster_id, host_id)? else {
                    return Ok(false);
                };
                if current != snapshot {
                    return Ok(false);
                }
                ctx.put_host(&commit.host)?;
                if let Some((severity, message)) = &commit.event {
                    self.events.append_in(
                        ctx,
                        cluster_id,
                        Some(host_id),
                        *severity,
                        message,
                        request_id,
                    )?;
                }
                Ok(true)
            })?;

            if committed {
                if state_changed {
                    self.metrics.host_transitions.inc();
                    self.notify(&commit.host);
                }
                return Ok((commit.host, value));
            }
            debug!(%cluster_id, %host_id, operation, attempt, "host row changed under us, retrying");
        }
        Err(StateError::Conflict(
            foundry_state::host_key(cluster_id, host_id),
            TRANSITION_ATTEMPTS,
        )
        .into())
    }

    fn notify(&self, host: &Host) {
        if let Some(callback) = &self.on_status_change {
            callback(&host.cluster_id, &host.id, host.state);
        }
    }
}

fn validation_role(role: HostRole) -> ValidationRole {
    match role {
        HostRole::Master => ValidationRole::Master,
        HostRole::Worker => ValidationRole::Worker,
        HostRole::Auto => ValidationRole::Auto,
    }
}

fn constraints(cluster: &Cluster, host_id: &str, peers: &[Host]) -> ClusterConstraints {
    let other_hostnames = peers
        .iter()
        .filter(|p| p.id != host_id && p.deleted_at.is_none() && !p.inventory.is_empty())
        .filter_map(|p| {
            parse_inventory(&p.inventory)
                .ok()
                .map(|inv| inv.hostname)
                .filter(|name| !name.is_empty())
        })
        .collect();
    ClusterConstraints {
        machine_network_cidr: cluster.machine_network_cidr.clone(),
        other_hostnames,
    }
}

fn status_event_message(host_id: &str, old: HostState, new: HostState, info: &str) -> String {
    format!("Host {host_id}: updated status from \"{old}\" to \"{new}\" ({info})")
}

#[cfg(test)]
mod tests {
    use super::*;
    use foundry_leader::DummyElector;

    const WORKER_INVENTORY: &str = r#"{
        "hostname": "worker-0",
        "cpu": {"count": 2},
        "memory": {"physical_bytes": 8589934592},
        "disks": [{"name": "sda", "size_bytes": 128849018880}],
        "interfaces": [{"name": "eth0", "ipv4_addresses": ["1.1.3.4/24"]}]
    }"#;

    fn test_manager() -> (HostManager, StateStore) {
        let store = StateStore::open_in_memory().unwrap();
        let metrics = Arc::new(MetricsRegistry::new());
        let events = EventSink::new(store.clone(), metrics.clone());
        let manager = HostManager::new(
            store.clone(),
            events,
            HardwareValidator::default(),
            HostConfig::default(),
            metrics,
            Arc::new(DummyElector),
        );
        (manager, store)
    }

    fn seed_cluster(store: &StateStore, id: &str, cidr: &str) {
        let mut cluster = Cluster::new(id.to_string(), "test-cluster");
        cluster.machine_network_cidr = cidr.to_string();
        store.put_cluster(&cluster).unwrap();
    }

    fn backdate_check_in(store: &StateStore, cluster_id: &str, host_id: &str, secs: u64) {
        let mut host = store.get_host(cluster_id, host_id).unwrap().unwrap();
        host.checked_in_at = epoch_secs() - secs;
        store.put_host(&host).unwrap();
    }

    fn force_state(store: &StateStore, cluster_id: &str, host_id: &str, state: HostState) {
        let mut host = store.get_host(cluster_id, host_id).unwrap().unwrap();
        host.state = state;
        store.put_host(&host).unwrap();
    }

    #[test]
    fn register_initializes_state_and_check_in() {
        let (manager, store) = test_manager();
        seed_cluster(&store, "c1", "1.1.0.0/16");

        let host = manager.register_host("c1", "h1", "r1").unwrap();
        assert_eq!(host.state, HostState::Discovering);
        assert!(host.checked_in_at > 0);

        let events = store.list_events("c1", Some("h1")).unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].message.contains("registered"));
    }

    #[test]
    fn register_requires_cluster() {
        let (manager, _store) = test_manager();
        assert!(matches!(
            manager.register_host("missing", "h1", ""),
            Err(HostError::ClusterNotFound(_))
        ));
    }

    #[test]
    fn register_during_installation_is_rejected() {
        let (manager, store) = test_manager();
        seed_cluster(&store, "c1", "1.1.0.0/16");
        manager.register_host("c1", "h1", "").unwrap();
        force_state(&store, "c1", "h1", HostState::Installing);

        assert!(matches!(
            manager.register_host("c1", "h1", ""),
            Err(HostError::InvalidStateTransition { .. })
        ));
    }

    #[test]
    fn reregister_resets_to_discovering() {
        let (manager, store) = test_manager();
        seed_cluster(&store, "c1", "1.1.0.0/16");
        manager.register_host("c1", "h1", "").unwrap();
        manager
            .update_inventory("c1", "h1", WORKER_INVENTORY, "")
            .unwrap();

        let host = manager.register_host("c1", "h1", "").unwrap();
        assert_eq!(host.state, HostState::Discovering);
        assert!(host.inventory.is_empty());
        assert_eq!(host.progress, HostProgress::default());
    }

    #[test]
    fn sufficient_inventory_moves_to_known() {
        let (manager, store) = test_manager();
        seed_cluster(&store, "c1", "1.1.0.0/16");
        manager.register_host("c1", "h1", "").unwrap();

        let host = manager
            .update_inventory("c1", "h1", WORKER_INVENTORY, "")
            .unwrap();
        assert_eq!(host.state, HostState::Known);
        assert_eq!(host.status_info, STATUS_KNOWN);

        let events = store.list_events("c1", Some("h1")).unwrap();
        assert!(events
            .last()
            .unwrap()
            .message
            .contains("from \"discovering\" to \"known\""));
    }

    #[test]
    fn small_inventory_moves_to_insufficient() {
        let (manager, store) = test_manager();
        seed_cluster(&store, "c1", "1.1.0.0/16");
        manager.register_host("c1", "h1", "").unwrap();

        let tiny = r#"{"hostname": "tiny", "cpu": {"count": 1},
            "memory": {"physical_bytes": 1073741824},
            "disks": [{"name": "sda", "size_bytes": 10000000}],
            "interfaces": [{"name": "eth0", "ipv4_addresses": ["1.1.3.4/24"]}]}"#;
        let host = manager.update_inventory("c1", "h1", tiny, "").unwrap();
        assert_eq!(host.state, HostState::Insufficient);
        assert!(host.status_info.contains("minimum hardware requirements"));
    }

    #[test]
    fn insufficient_recovers_to_known_when_checks_pass() {
        let (manager, store) = test_manager();
        seed_cluster(&store, "c1", "1.1.0.0/16");
        manager.register_host("c1", "h1", "").unwrap();
        force_state(&store, "c1", "h1", HostState::Insufficient);

        let host = manager
            .update_inventory("c1", "h1", WORKER_INVENTORY, "")
            .unwrap();
        assert_eq!(host.state, HostState::Known);
    }

    #[test]
    fn legacy_hw_info_drives_validation_until_inventory_arrives() {
        let (manager, store) = test_manager();
        seed_cluster(&store, "c1", "1.1.0.0/16");
        manager.register_host("c1", "h1", "").unwrap();

        let host = manager
            .update_hw_info("c1", "h1", WORKER_INVENTORY, "")
            .unwrap();
        assert_eq!(host.state, HostState::Known);
        assert!(host.inventory.is_empty());
        assert!(!host.hw_info.is_empty());

        // Once a modern inventory exists, hw-info updates are stored
        // without re-deciding the state.
        manager
            .update_inventory("c1", "h1", WORKER_INVENTORY, "")
            .unwrap();
        let tiny = r#"{"hostname": "h1", "cpu": {"count": 1}}"#;
        let host = manager.update_hw_info("c1", "h1", tiny, "").unwrap();
        assert_eq!(host.state, HostState::Known);
        assert_eq!(host.hw_info, tiny);
    }

    #[test]
    fn malformed_inventory_is_an_input_error() {
        let (manager, store) = test_manager();
        seed_cluster(&store, "c1", "1.1.0.0/16");
        manager.register_host("c1", "h1", "").unwrap();
        assert!(matches!(
            manager.update_inventory("c1", "h1", "not json", ""),
            Err(HostError::InvalidInventory(_))
        ));
        // No transition, no event.
        let host = store.get_host("c1", "h1").unwrap().unwrap();
        assert_eq!(host.state, HostState::Discovering);
        assert_eq!(store.list_events("c1", Some("h1")).unwrap().len(), 1);
    }

    #[test]
    fn known_host_disconnects_by_timeout() {
        let (manager, store) = test_manager();
        seed_cluster(&store, "c1", "1.1.0.0/16");
        manager.register_host("c1", "h1", "").unwrap();
        manager
            .update_inventory("c1", "h1", WORKER_INVENTORY, "")
            .unwrap();
        backdate_check_in(&store, "c1", "h1", 4 * 60);

        manager.host_monitoring();

        let host = store.get_host("c1", "h1").unwrap().unwrap();
        assert_eq!(host.state, HostState::Disconnected);
        let events = store.list_events("c1", Some("h1")).unwrap();
        let last = events.last().unwrap();
        assert_eq!(last.severity, EventSeverity::Warning);
        assert!(last.message.contains(
            "updated status from \"known\" to \"disconnected\" \
             (Host has stopped communicating with the installation service)"
        ));
    }

    #[test]
    fn discovering_and_insufficient_hosts_disconnect_too() {
        let (manager, store) = test_manager();
        seed_cluster(&store, "c1", "1.1.0.0/16");
        for (host_id, state) in [("h1", HostState::Discovering), ("h2", HostState::Insufficient)] {
            manager.register_host("c1", host_id, "").unwrap();
            force_state(&store, "c1", host_id, state);
            backdate_check_in(&store, "c1", host_id, 4 * 60);
        }

        manager.host_monitoring();

        for host_id in ["h1", "h2"] {
            let host = store.get_host("c1", host_id).unwrap().unwrap();
            assert_eq!(host.state, HostState::Disconnected);
        }
    }

    #[test]
    fn disconnected_host_reconnects_to_discovering() {
        let (manager, store) = test_manager();
        seed_cluster(&store, "c1", "1.1.0.0/16");
        manager.register_host("c1", "h1", "").unwrap();
        let mut host = store.get_host("c1", "h1").unwrap().unwrap();
        host.state = HostState::Disconnected;
        host.inventory.clear();
        host.checked_in_at = epoch_secs();
        store.put_host(&host).unwrap();

        manager.host_monitoring();

        let host = store.get_host("c1", "h1").unwrap().unwrap();
        assert_eq!(host.state, HostState::Discovering);
        let last = store.list_events("c1", Some("h1")).unwrap().pop().unwrap();
        assert_eq!(last.severity, EventSeverity::Info);
        assert!(last.message.contains(
            "updated status from \"disconnected\" to \"discovering\" \
             (Waiting for host to send hardware details)"
        ));
    }

    #[test]
    fn terminal_states_are_not_demoted() {
        let (manager, store) = test_manager();
        seed_cluster(&store, "c1", "1.1.0.0/16");
        for (host_id, state) in [("h1", HostState::Installed), ("h2", HostState::Error)] {
            manager.register_host("c1", host_id, "").unwrap();
            force_state(&store, "c1", host_id, state);
            backdate_check_in(&store, "c1", host_id, 10 * 60);
        }

        manager.host_monitoring();

        assert_eq!(
            store.get_host("c1", "h1").unwrap().unwrap().state,
            HostState::Installed
        );
        assert_eq!(
            store.get_host("c1", "h2").unwrap().unwrap().state,
            HostState::Error
        );
    }

    #[test]
    fn monitor_disconnects_hosts_in_batches() {
        let (manager, store) = test_manager();
        let mut cluster_id = String::new();
        for i in 0..15 {
            if i % 10 == 0 {
                cluster_id = format!("c{i}");
                seed_cluster(&store, &cluster_id, "1.1.0.0/16");
            }
            let host_id = format!("h{i}");
            manager.register_host(&cluster_id, &host_id, "").unwrap();
            backdate_check_in(&store, &cluster_id, &host_id, 4 * 60);
        }

        manager.host_monitoring();

        let disconnected = store
            .list_hosts()
            .unwrap()
            .into_iter()
            .filter(|h| h.state == HostState::Disconnected)
            .count();
        assert_eq!(disconnected, 15);
    }

    #[test]
    fn install_moves_known_host_to_preparing() {
        let (manager, store) = test_manager();
        seed_cluster(&store, "c1", "1.1.0.0/16");
        manager.register_host("c1", "h1", "").unwrap();
        manager
            .update_inventory("c1", "h1", WORKER_INVENTORY, "")
            .unwrap();

        let host = manager.install("c1", "h1", "").unwrap();
        assert_eq!(host.state, HostState::PreparingForInstallation);

        // Not from discovering.
        manager.register_host("c1", "h2", "").unwrap();
        assert!(matches!(
            manager.install("c1", "h2", ""),
            Err(HostError::InvalidStateTransition { .. })
        ));
    }

    #[test]
    fn progress_drives_installing_states() {
        let (manager, store) = test_manager();
        seed_cluster(&store, "c1", "1.1.0.0/16");
        manager.register_host("c1", "h1", "").unwrap();
        manager
            .update_inventory("c1", "h1", WORKER_INVENTORY, "")
            .unwrap();
        manager.install("c1", "h1", "").unwrap();

        let host = manager
            .update_install_progress("c1", "h1", "Starting installation", "", "")
            .unwrap();
        assert_eq!(host.state, HostState::Installing);

        let host = manager
            .update_install_progress("c1", "h1", "Writing image to disk", "58%", "")
            .unwrap();
        assert_eq!(host.state, HostState::InstallingInProgress);
        assert_eq!(host.progress.stage, "Writing image to disk");

        let host = manager
            .update_install_progress("c1", "h1", PROGRESS_DONE, "", "")
            .unwrap();
        assert_eq!(host.state, HostState::Installed);
    }

    #[test]
    fn failed_progress_moves_to_error() {
        let (manager, store) = test_manager();
        seed_cluster(&store, "c1", "1.1.0.0/16");
        manager.register_host("c1", "h1", "").unwrap();
        manager
            .update_inventory("c1", "h1", WORKER_INVENTORY, "")
            .unwrap();
        manager.install("c1", "h1", "").unwrap();

        let host = manager
            .update_install_progress("c1", "h1", "Failed - could not write image", "", "")
            .unwrap();
        assert_eq!(host.state, HostState::Error);
    }

    #[test]
    fn cancel_then_reset_then_reregister() {
        let (manager, store) = test_manager();
        seed_cluster(&store, "c1", "1.1.0.0/16");
        manager.register_host("c1", "h1", "").unwrap();
        manager
            .update_inventory("c1", "h1", WORKER_INVENTORY, "")
            .unwrap();
        manager.install("c1", "h1", "").unwrap();

        let host = manager.cancel_installation("c1", "h1", "").unwrap();
        assert_eq!(host.state, HostState::Error);
        assert!(host.cancellation_requested);

        let host = manager.reset_host("c1", "h1", "").unwrap();
        assert_eq!(host.state, HostState::Resetting);
        assert_eq!(host.progress, HostProgress::default());

        let host = manager.register_host("c1", "h1", "").unwrap();
        assert_eq!(host.state, HostState::Discovering);
        assert!(!host.cancellation_requested);
    }

    #[test]
    fn disable_and_enable_cycle() {
        let (manager, store) = test_manager();
        seed_cluster(&store, "c1", "1.1.0.0/16");
        manager.register_host("c1", "h1", "").unwrap();
        manager
            .update_inventory("c1", "h1", WORKER_INVENTORY, "")
            .unwrap();

        let host = manager.disable_host("c1", "h1", "").unwrap();
        assert_eq!(host.state, HostState::Disabled);

        // Disabled hosts are outside the monitor's scope.
        backdate_check_in(&store, "c1", "h1", 10 * 60);
        manager.host_monitoring();
        assert_eq!(
            store.get_host("c1", "h1").unwrap().unwrap().state,
            HostState::Disabled
        );

        let host = manager.enable_host("c1", "h1", "").unwrap();
        assert_eq!(host.state, HostState::Discovering);
        assert!(host.inventory.is_empty());
    }

    #[test]
    fn deregister_soft_deletes_and_monitor_skips() {
        let (manager, store) = test_manager();
        seed_cluster(&store, "c1", "1.1.0.0/16");
        manager.register_host("c1", "h1", "").unwrap();

        let host = manager.deregister_host("c1", "h1", "").unwrap();
        assert!(host.deleted_at.is_some());

        backdate_check_in(&store, "c1", "h1", 10 * 60);
        manager.host_monitoring();
        let host = store.get_host("c1", "h1").unwrap().unwrap();
        assert_eq!(host.state, HostState::Discovering);
    }

    #[test]
    fn status_callback_fires_on_state_change() {
        let (manager, store) = test_manager();
        let seen: Arc<std::sync::Mutex<Vec<(String, HostState)>>> =
            Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let manager = manager.with_status_callback(Arc::new(move |_cluster, host, state| {
            sink.lock().unwrap().push((host.to_string(), state));
        }));

        seed_cluster(&store, "c1", "1.1.0.0/16");
        manager.register_host("c1", "h1", "").unwrap();
        manager
            .update_inventory("c1", "h1", WORKER_INVENTORY, "")
            .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                ("h1".to_string(), HostState::Discovering),
                ("h1".to_string(), HostState::Known),
            ]
        );
    }

    #[test]
    fn each_transition_emits_exactly_one_event() {
        let (manager, store) = test_manager();
        seed_cluster(&store, "c1", "1.1.0.0/16");
        manager.register_host("c1", "h1", "").unwrap();
        manager
            .update_inventory("c1", "h1", WORKER_INVENTORY, "")
            .unwrap();
        manager.install("c1", "h1", "").unwrap();

        // register + known + preparing = 3 events, in commit order.
        let events = store.list_events("c1", Some("h1")).unwrap();
        assert_eq!(events.len(), 3);
        for pair in events.windows(2) {
            assert!(pair[1].event_time >= pair[0].event_time);
        }
    }

    #[test]
    fn step_results_are_capped() {
        let (manager, store) = test_manager();
        seed_cluster(&store, "c1", "1.1.0.0/16");
        manager.register_host("c1", "h1", "").unwrap();

        for i in 0..60 {
            manager
                .report_step_result(
                    "c1",
                    "h1",
                    StepResult {
                        step_id: format!("inventory-{i}"),
                        step_type: "inventory".to_string(),
                        exit_code: 0,
                        output: String::new(),
                        error: String::new(),
                        received_at: epoch_secs(),
                    },
                    "",
                )
                .unwrap();
        }

        let host = store.get_host("c1", "h1").unwrap().unwrap();
        assert_eq!(host.step_results.len(), 50);
        assert_eq!(host.step_results.last().unwrap().step_id, "inventory-59");
    }
}
