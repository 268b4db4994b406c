//! foundry-api — REST surface of the installation service.
//!
//! axum route handlers over the host and cluster managers, the instruction
//! manager, the event sink, and the manifests API.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/api/v1/clusters` | Register a cluster |
//! | GET | `/api/v1/clusters` | List clusters |
//! | GET/PATCH/DELETE | `/api/v1/clusters/{cluster_id}` | Get, update, deregister |
//! | POST | `/api/v1/clusters/{cluster_id}/actions/install` | Start installation |
//! | POST | `/api/v1/clusters/{cluster_id}/actions/cancel` | Cancel installation |
//! | POST | `/api/v1/clusters/{cluster_id}/actions/reset` | Reset a failed install |
//! | POST | `/api/v1/clusters/{cluster_id}/actions/complete` | Conclude finalizing |
//! | GET | `/api/v1/clusters/{cluster_id}/events` | List events |
//! | POST/GET | `/api/v1/clusters/{cluster_id}/hosts` | Register, list hosts |
//! | GET/PATCH/DELETE | `…/hosts/{host_id}` | Get, set role, deregister |
//! | POST | `…/hosts/{host_id}/actions/enable\|disable` | Enable/disable |
//! | GET | `…/hosts/{host_id}/instructions` | Next steps for the agent |
//! | POST | `…/hosts/{host_id}/instructions/reply` | Step result |
//! | POST | `…/hosts/{host_id}/progress` | Install progress |
//! | GET | `/api/v1/hosts/{node_id}/next-steps` | Legacy next steps |
//! | POST/GET/DELETE | `…/{cluster_id}/manifests` | Manifests |
//! | GET | `…/{cluster_id}/manifests/files` | Download manifest |
//! | GET | `/api/v1/component-versions`, `/api/v1/managed-domains` | Metadata |
//! | GET | `/metrics`, `/healthz`, `/ready` | Operability |

pub mod error;
pub mod handlers;
pub mod manifest_handlers;
pub mod middleware;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use serde::Serialize;

use foundry_cluster::ClusterManager;
use foundry_events::EventSink;
use foundry_host::{HostManager, InstructionManager};
use foundry_manifests::ManifestsApi;
use foundry_metrics::MetricsRegistry;
use foundry_state::StateStore;

pub use error::ApiError;
pub use middleware::AuthConfig;

/// Component image references reported by `/api/v1/component-versions`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct VersionInfo {
    pub service_version: String,
    pub release_image: String,
    pub agent_image: String,
    pub installer_image: String,
    pub controller_image: String,
}

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: StateStore,
    pub hosts: Arc<HostManager>,
    pub clusters: Arc<ClusterManager>,
    pub instructions: Arc<InstructionManager>,
    pub manifests: Arc<ManifestsApi>,
    pub events: EventSink,
    pub metrics: Arc<MetricsRegistry>,
    pub versions: Arc<VersionInfo>,
    pub managed_domains: Vec<String>,
    pub auth: Arc<AuthConfig>,
    /// Flipped once startup work (migrations, leaders) finished.
    pub ready: Arc<AtomicBool>,
}

/// Build the complete API router.
pub fn build_router(state: ApiState) -> Router {
    let api = Router::new()
        .route(
            "/clusters",
            post(handlers::register_cluster).get(handlers::list_clusters),
        )
        .route(
            "/clusters/{cluster_id}",
            get(handlers::get_cluster)
                .patch(handlers::update_cluster)
                .delete(handlers::deregister_cluster),
        )
        .route(
            "/clusters/{cluster_id}/actions/install",
            post(handlers::install_cluster),
        )
        .route(
            "/clusters/{cluster_id}/actions/cancel",
            post(handlers::cancel_cluster_installation),
        )
        .route(
            "/clusters/{cluster_id}/actions/reset",
            post(handlers::reset_cluster),
        )
        .route(
            "/clusters/{cluster_id}/actions/complete",
            post(handlers::complete_installation),
        )
        .route("/clusters/{cluster_id}/events", get(handlers::list_events))
        .route(
            "/clusters/{cluster_id}/hosts",
            post(handlers::register_host).get(handlers::list_hosts),
        )
        .route(
            "/clusters/{cluster_id}/hosts/{host_id}",
            get(handlers::get_host)
                .patch(handlers::update_host)
                .delete(handlers::deregister_host),
        )
        .route(
            "/clusters/{cluster_id}/hosts/{host_id}/actions/enable",
            post(handlers::enable_host),
        )
        .route(
            "/clusters/{cluster_id}/hosts/{host_id}/actions/disable",
            post(handlers::disable_host),
        )
        .route(
            "/clusters/{cluster_id}/hosts/{host_id}/instructions",
            get(handlers::get_next_steps),
        )
        .route(
            "/clusters/{cluster_id}/hosts/{host_id}/instructions/reply",
            post(handlers::post_step_reply),
        )
        .route(
            "/clusters/{cluster_id}/hosts/{host_id}/progress",
            post(handlers::update_host_install_progress),
        )
        .route("/hosts/{node_id}/next-steps", get(handlers::get_next_steps_legacy))
        .route(
            "/clusters/{cluster_id}/manifests",
            post(manifest_handlers::create_manifest)
                .get(manifest_handlers::list_manifests)
                .delete(manifest_handlers::delete_manifest),
        )
        .route(
            "/clusters/{cluster_id}/manifests/files",
            get(manifest_handlers::download_manifest),
        )
        .route("/component-versions", get(handlers::component_versions))
        .route("/managed-domains", get(handlers::managed_domains))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::authenticate,
        ));

    Router::new()
        .nest("/api/v1", api)
        .route("/metrics", get(handlers::prometheus_metrics))
        .route("/healthz", get(handlers::healthz))
        .route("/ready", get(handlers::ready))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::count_requests,
        ))
        .layer(axum::middleware::from_fn(middleware::request_id))
        .with_state(state)
}
