//! foundryd — the assisted installation service daemon.
//!
//! One binary, one flag (`--port`); everything else comes from `MYAPP_*`
//! environment variables. On startup the deploy target is resolved into a
//! concrete object store and leader gates, schema migrations run under
//! their own leader, the leader-gated monitors start, and the REST API is
//! served until ctrl-c. Initialization failures exit non-zero; runtime
//! request failures never terminate the process.

mod config;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tracing::info;

use foundry_api::{ApiState, AuthConfig, VersionInfo};
use foundry_cluster::{
    host_status_callback, refresh_channel, ClusterConfig, ClusterManager, DeletionWorker,
};
use foundry_events::EventSink;
use foundry_hardware::HardwareValidator;
use foundry_host::{HostConfig, HostManager, InstructionManager};
use foundry_leader::{
    run_with_leader, spawn_monitor, DummyElector, Elector, LeaderConfig, LeaseElector,
};
use foundry_manifests::ManifestsApi;
use foundry_metrics::MetricsRegistry;
use foundry_objectstore::{FsStore, ImageExpirer, ObjectStore};
use foundry_state::StateStore;

use config::{Config, DeployTarget, LogFormat};

#[derive(Parser)]
#[command(name = "foundryd", about = "Assisted bare-metal installation service")]
struct Cli {
    /// Port the service listens on.
    #[arg(long, default_value_t = 8090)]
    port: u16,
}

/// The deploy target resolved into concrete handles.
///
/// Components receive these handles, never the target enum.
struct DeployVariant {
    objects: Arc<dyn ObjectStore>,
    elector: Arc<dyn Elector>,
    migration_elector: Arc<dyn Elector>,
    lease_tasks: Vec<tokio::task::JoinHandle<()>>,
}

fn resolve_deploy_target(
    cfg: &Config,
    store: &StateStore,
    shutdown: &watch::Receiver<bool>,
) -> DeployVariant {
    let objects: Arc<dyn ObjectStore> = Arc::new(FsStore::new(&cfg.object_store_dir));
    match cfg.deploy_target {
        DeployTarget::K8s => {
            // Replicated deployment: lease-based leaders, one for the
            // monitors and a separate one for schema migrations.
            let lease_cfg = LeaderConfig {
                namespace: cfg.leader_namespace.clone(),
                ..LeaderConfig::default()
            };
            let elector = LeaseElector::new(store.clone(), lease_cfg.clone(), "monitors");
            let migration_elector =
                LeaseElector::new(store.clone(), lease_cfg, "migration-helper");
            let lease_tasks = vec![
                elector.start(shutdown.clone()),
                migration_elector.start(shutdown.clone()),
            ];
            DeployVariant {
                objects,
                elector,
                migration_elector,
                lease_tasks,
            }
        }
        DeployTarget::OnPrem | DeployTarget::Ocp => DeployVariant {
            objects,
            elector: Arc::new(DummyElector),
            migration_elector: Arc::new(DummyElector),
            lease_tasks: Vec::new(),
        },
    }
}

fn init_logs(cfg: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| cfg.log_level.parse().unwrap_or_else(|_| "info".parse().unwrap()));
    match cfg.log_format {
        LogFormat::Json => tracing_subscriber::fmt().with_env_filter(filter).json().init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = Config::from_env()?;
    init_logs(&cfg);
    info!(deploy_target = ?cfg.deploy_target, "starting installation service");

    std::fs::create_dir_all(&cfg.data_dir)?;
    let store = StateStore::open(&cfg.data_dir.join("foundry.redb"))?;
    info!(path = ?cfg.data_dir, "state store opened");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let variant = resolve_deploy_target(&cfg, &store, &shutdown_rx);

    // Schema migrations run under their own leader, separate from the
    // monitors' lease.
    variant
        .migration_elector
        .wait_for_leadership(shutdown_rx.clone())
        .await?;
    run_with_leader(variant.migration_elector.as_ref(), || async {
        info!("running schema migrations");
        foundry_state::migrations::migrate(&store)
    })
    .await?;
    info!("schema migrations finished");

    // ── Core managers ──────────────────────────────────────────────
    let metrics = Arc::new(MetricsRegistry::new());
    let events = EventSink::new(store.clone(), metrics.clone());
    let (refresh_tx, refresh_rx) = refresh_channel();

    let hosts = Arc::new(
        HostManager::new(
            store.clone(),
            events.clone(),
            HardwareValidator::default(),
            HostConfig::default(),
            metrics.clone(),
            variant.elector.clone(),
        )
        .with_status_callback(host_status_callback(refresh_tx)),
    );
    let clusters = Arc::new(ClusterManager::new(
        store.clone(),
        events.clone(),
        hosts.clone(),
        ClusterConfig::default(),
        metrics.clone(),
        variant.elector.clone(),
        refresh_rx,
    ));
    let instructions = Arc::new(InstructionManager::new(
        store.clone(),
        cfg.instructions.clone(),
        metrics.clone(),
    ));
    let manifests = Arc::new(ManifestsApi::new(store.clone(), variant.objects.clone()));

    // ── Background tasks ───────────────────────────────────────────
    let mut tasks = variant.lease_tasks;

    let queue_clusters = clusters.clone();
    let queue_shutdown = shutdown_rx.clone();
    tasks.push(tokio::spawn(async move {
        queue_clusters.run_refresh_queue(queue_shutdown).await;
    }));

    let monitor_hosts = hosts.clone();
    tasks.push(spawn_monitor(
        "host-monitor",
        cfg.host_monitor_interval,
        shutdown_rx.clone(),
        move || {
            let hosts = monitor_hosts.clone();
            async move { hosts.host_monitoring() }
        },
    ));

    let monitor_clusters = clusters.clone();
    tasks.push(spawn_monitor(
        "cluster-monitor",
        cfg.cluster_monitor_interval,
        shutdown_rx.clone(),
        move || {
            let clusters = monitor_clusters.clone();
            async move { clusters.cluster_monitoring() }
        },
    ));

    let expirer = Arc::new(ImageExpirer::new(
        variant.objects.clone(),
        events.clone(),
        cfg.image_expiration_time,
    ));
    let expirer_elector = variant.elector.clone();
    tasks.push(spawn_monitor(
        "image-expiration-monitor",
        cfg.image_expiration_interval,
        shutdown_rx.clone(),
        move || {
            let expirer = expirer.clone();
            let elector = expirer_elector.clone();
            async move {
                let swept = run_with_leader(elector.as_ref(), || async {
                    expirer.expire_once().await.map(|_| ())
                })
                .await;
                if let Err(e) = swept {
                    tracing::warn!(error = %e, "image expiration sweep failed");
                }
            }
        },
    ));

    let deletion = Arc::new(DeletionWorker::new(
        store.clone(),
        variant.objects.clone(),
        variant.elector.clone(),
        cfg.deletion_retention,
        cfg.event_retention,
    ));
    tasks.push(spawn_monitor(
        "deletion-worker",
        cfg.deletion_worker_interval,
        shutdown_rx.clone(),
        move || {
            let deletion = deletion.clone();
            async move { deletion.permanently_delete_unregistered().await }
        },
    ));

    // ── API server ─────────────────────────────────────────────────
    let ready = Arc::new(AtomicBool::new(false));
    let state = ApiState {
        store,
        hosts,
        clusters,
        instructions,
        manifests,
        events,
        metrics,
        versions: Arc::new(VersionInfo {
            service_version: cfg.service_version.clone(),
            release_image: cfg.release_image.clone(),
            agent_image: cfg.instructions.inventory_image.clone(),
            installer_image: cfg.instructions.installer_image.clone(),
            controller_image: cfg.instructions.controller_image.clone(),
        }),
        managed_domains: cfg.managed_domains.clone(),
        auth: Arc::new(AuthConfig {
            enable_auth: cfg.enable_auth,
            user_token: cfg.user_token.clone(),
            agent_secret: cfg.agent_secret.clone(),
        }),
        ready: ready.clone(),
    };
    let router = foundry_api::build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], cli.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "API server starting");
    ready.store(true, Ordering::SeqCst);

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to install CTRL+C handler");
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    for task in tasks {
        let _ = task.await;
    }
    info!("installation service stopped");
    Ok(())
}
