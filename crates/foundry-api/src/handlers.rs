//! REST API handlers for clusters, hosts, instructions, and events.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};

use foundry_cluster::ClusterParams;
use foundry_host::Step;
use foundry_state::{Cluster, Event, Host, HostRole, StepResult};

use crate::error::ApiError;
use crate::middleware::ReqId;
use crate::ApiState;

fn with_id<E: Into<ApiError>>(req: &ReqId) -> impl Fn(E) -> ApiError + '_ {
    move |e| e.into().with_request_id(&req.0)
}

// ── Clusters ───────────────────────────────────────────────────────

/// Operator-supplied cluster attributes (create and update).
#[derive(Debug, Default, Deserialize)]
pub struct ClusterRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub base_dns_domain: String,
    #[serde(default)]
    pub machine_network_cidr: String,
    #[serde(default)]
    pub api_vip: String,
    #[serde(default)]
    pub api_vip_dns_name: String,
    #[serde(default)]
    pub ingress_vip: String,
    #[serde(default)]
    pub vip_dhcp_allocation: bool,
    #[serde(default)]
    pub pull_secret: String,
    #[serde(default)]
    pub release_image: String,
    #[serde(default)]
    pub install_config_overrides: String,
}

impl From<ClusterRequest> for ClusterParams {
    fn from(r: ClusterRequest) -> Self {
        ClusterParams {
            name: r.name,
            base_dns_domain: r.base_dns_domain,
            machine_network_cidr: r.machine_network_cidr,
            api_vip: r.api_vip,
            api_vip_dns_name: r.api_vip_dns_name,
            ingress_vip: r.ingress_vip,
            vip_dhcp_allocation: r.vip_dhcp_allocation,
            pull_secret: r.pull_secret,
            release_image: r.release_image,
            install_config_overrides: r.install_config_overrides,
        }
    }
}

/// POST /api/v1/clusters
pub async fn register_cluster(
    State(state): State<ApiState>,
    req_id: ReqId,
    Json(body): Json<ClusterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if body.name.is_empty() {
        return Err(ApiError::bad_request("cluster name is required").with_request_id(&req_id.0));
    }
    let cluster = state
        .clusters
        .register_cluster(body.into(), &req_id.0)
        .map_err(with_id(&req_id))?;
    Ok((StatusCode::CREATED, Json(cluster)))
}

/// GET /api/v1/clusters
pub async fn list_clusters(
    State(state): State<ApiState>,
    req_id: ReqId,
) -> Result<Json<Vec<Cluster>>, ApiError> {
    let clusters = state
        .store
        .list_clusters()
        .map_err(with_id(&req_id))?
        .into_iter()
        .filter(|c| c.deleted_at.is_none())
        .collect();
    Ok(Json(clusters))
}

/// GET /api/v1/clusters/{cluster_id}
pub async fn get_cluster(
    State(state): State<ApiState>,
    req_id: ReqId,
    Path(cluster_id): Path<String>,
) -> Result<Json<Cluster>, ApiError> {
    match state.store.get_cluster(&cluster_id).map_err(with_id(&req_id))? {
        Some(cluster) if cluster.deleted_at.is_none() => Ok(Json(cluster)),
        _ => Err(ApiError::not_found(format!("cluster not found: {cluster_id}"))
            .with_request_id(&req_id.0)),
    }
}

/// PATCH /api/v1/clusters/{cluster_id}
pub async fn update_cluster(
    State(state): State<ApiState>,
    req_id: ReqId,
    Path(cluster_id): Path<String>,
    Json(body): Json<ClusterRequest>,
) -> Result<Json<Cluster>, ApiError> {
    let cluster = state
        .clusters
        .update_cluster(&cluster_id, body.into(), &req_id.0)
        .map_err(with_id(&req_id))?;
    Ok(Json(cluster))
}

/// DELETE /api/v1/clusters/{cluster_id}
pub async fn deregister_cluster(
    State(state): State<ApiState>,
    req_id: ReqId,
    Path(cluster_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state
        .clusters
        .deregister_cluster(&cluster_id, &req_id.0)
        .map_err(with_id(&req_id))?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/v1/clusters/{cluster_id}/actions/install
pub async fn install_cluster(
    State(state): State<ApiState>,
    req_id: ReqId,
    Path(cluster_id): Path<String>,
) -> Result<Json<Cluster>, ApiError> {
    let cluster = state
        .clusters
        .install_cluster(&cluster_id, &req_id.0)
        .map_err(with_id(&req_id))?;
    Ok(Json(cluster))
}

/// POST /api/v1/clusters/{cluster_id}/actions/cancel
pub async fn cancel_cluster_installation(
    State(state): State<ApiState>,
    req_id: ReqId,
    Path(cluster_id): Path<String>,
) -> Result<Json<Cluster>, ApiError> {
    let cluster = state
        .clusters
        .cancel_installation(&cluster_id, &req_id.0)
        .map_err(with_id(&req_id))?;
    Ok(Json(cluster))
}

/// POST /api/v1/clusters/{cluster_id}/actions/reset
pub async fn reset_cluster(
    State(state): State<ApiState>,
    req_id: ReqId,
    Path(cluster_id): Path<String>,
) -> Result<Json<Cluster>, ApiError> {
    let cluster = state
        .clusters
        .reset_cluster(&cluster_id, &req_id.0)
        .map_err(with_id(&req_id))?;
    Ok(Json(cluster))
}

#[derive(Debug, Deserialize)]
pub struct CompleteInstallationRequest {
    pub success: bool,
    #[serde(default)]
    pub error_info: String,
}

/// POST /api/v1/clusters/{cluster_id}/actions/complete
pub async fn complete_installation(
    State(state): State<ApiState>,
    req_id: ReqId,
    Path(cluster_id): Path<String>,
    Json(body): Json<CompleteInstallationRequest>,
) -> Result<Json<Cluster>, ApiError> {
    let cluster = state
        .clusters
        .complete_installation(&cluster_id, body.success, &body.error_info, &req_id.0)
        .map_err(with_id(&req_id))?;
    Ok(Json(cluster))
}

// ── Events ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub host_id: Option<String>,
}

/// GET /api/v1/clusters/{cluster_id}/events
pub async fn list_events(
    State(state): State<ApiState>,
    req_id: ReqId,
    Path(cluster_id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<Vec<Event>>, ApiError> {
    let events = state
        .events
        .list(&cluster_id, query.host_id.as_deref())
        .map_err(with_id(&req_id))?;
    Ok(Json(events))
}

// ── Hosts ──────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct RegisterHostRequest {
    /// Agent-generated host ID; the server mints one when absent.
    pub host_id: Option<String>,
}

/// POST /api/v1/clusters/{cluster_id}/hosts
pub async fn register_host(
    State(state): State<ApiState>,
    req_id: ReqId,
    Path(cluster_id): Path<String>,
    Json(body): Json<RegisterHostRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let host_id = body
        .host_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let host = state
        .hosts
        .register_host(&cluster_id, &host_id, &req_id.0)
        .map_err(with_id(&req_id))?;
    Ok((StatusCode::CREATED, Json(host)))
}

/// GET /api/v1/clusters/{cluster_id}/hosts
pub async fn list_hosts(
    State(state): State<ApiState>,
    req_id: ReqId,
    Path(cluster_id): Path<String>,
) -> Result<Json<Vec<Host>>, ApiError> {
    let hosts = state
        .store
        .list_hosts_for_cluster(&cluster_id)
        .map_err(with_id(&req_id))?
        .into_iter()
        .filter(|h| h.deleted_at.is_none())
        .collect();
    Ok(Json(hosts))
}

/// GET /api/v1/clusters/{cluster_id}/hosts/{host_id}
pub async fn get_host(
    State(state): State<ApiState>,
    req_id: ReqId,
    Path((cluster_id, host_id)): Path<(String, String)>,
) -> Result<Json<Host>, ApiError> {
    match state
        .store
        .get_host(&cluster_id, &host_id)
        .map_err(with_id(&req_id))?
    {
        Some(host) if host.deleted_at.is_none() => Ok(Json(host)),
        _ => Err(ApiError::not_found(format!("host not found: {host_id}"))
            .with_request_id(&req_id.0)),
    }
}

/// DELETE /api/v1/clusters/{cluster_id}/hosts/{host_id}
pub async fn deregister_host(
    State(state): State<ApiState>,
    req_id: ReqId,
    Path((cluster_id, host_id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    state
        .hosts
        .deregister_host(&cluster_id, &host_id, &req_id.0)
        .map_err(with_id(&req_id))?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct UpdateHostRequest {
    pub role: HostRole,
}

/// PATCH /api/v1/clusters/{cluster_id}/hosts/{host_id}
pub async fn update_host(
    State(state): State<ApiState>,
    req_id: ReqId,
    Path((cluster_id, host_id)): Path<(String, String)>,
    Json(body): Json<UpdateHostRequest>,
) -> Result<Json<Host>, ApiError> {
    let host = state
        .hosts
        .update_role(&cluster_id, &host_id, body.role, &req_id.0)
        .map_err(with_id(&req_id))?;
    Ok(Json(host))
}

/// POST /api/v1/clusters/{cluster_id}/hosts/{host_id}/actions/enable
pub async fn enable_host(
    State(state): State<ApiState>,
    req_id: ReqId,
    Path((cluster_id, host_id)): Path<(String, String)>,
) -> Result<Json<Host>, ApiError> {
    let host = state
        .hosts
        .enable_host(&cluster_id, &host_id, &req_id.0)
        .map_err(with_id(&req_id))?;
    Ok(Json(host))
}

/// POST /api/v1/clusters/{cluster_id}/hosts/{host_id}/actions/disable
pub async fn disable_host(
    State(state): State<ApiState>,
    req_id: ReqId,
    Path((cluster_id, host_id)): Path<(String, String)>,
) -> Result<Json<Host>, ApiError> {
    let host = state
        .hosts
        .disable_host(&cluster_id, &host_id, &req_id.0)
        .map_err(with_id(&req_id))?;
    Ok(Json(host))
}

// ── Instructions ───────────────────────────────────────────────────

/// Reply envelope for an instruction poll.
#[derive(Debug, Serialize)]
pub struct StepsReply {
    /// Suggested delay before the next poll.
    pub next_instruction_seconds: u64,
    pub instructions: Vec<Step>,
}

/// GET /api/v1/clusters/{cluster_id}/hosts/{host_id}/instructions
pub async fn get_next_steps(
    State(state): State<ApiState>,
    req_id: ReqId,
    Path((cluster_id, host_id)): Path<(String, String)>,
) -> Result<Json<StepsReply>, ApiError> {
    let host = state
        .hosts
        .check_in(&cluster_id, &host_id)
        .map_err(with_id(&req_id))?;
    let instructions = state
        .instructions
        .get_next_steps(&host)
        .map_err(with_id(&req_id))?;
    Ok(Json(StepsReply {
        next_instruction_seconds: 60,
        instructions,
    }))
}

/// GET /api/v1/hosts/{node_id}/next-steps
///
/// Legacy agents poll by node ID without a cluster scope.
pub async fn get_next_steps_legacy(
    State(state): State<ApiState>,
    req_id: ReqId,
    Path(node_id): Path<String>,
) -> Result<Json<StepsReply>, ApiError> {
    let host = state
        .store
        .find_host(&node_id)
        .map_err(with_id(&req_id))?
        .ok_or_else(|| {
            ApiError::not_found(format!("host not found: {node_id}")).with_request_id(&req_id.0)
        })?;
    let host = state
        .hosts
        .check_in(&host.cluster_id, &host.id)
        .map_err(with_id(&req_id))?;
    let instructions = state
        .instructions
        .get_next_steps(&host)
        .map_err(with_id(&req_id))?;
    Ok(Json(StepsReply {
        next_instruction_seconds: 60,
        instructions,
    }))
}

#[derive(Debug, Deserialize)]
pub struct StepReplyRequest {
    pub step_id: String,
    pub step_type: String,
    pub exit_code: i64,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub error: String,
}

/// POST /api/v1/clusters/{cluster_id}/hosts/{host_id}/instructions/reply
///
/// Inventory and connectivity outputs feed the host state machine; every
/// reply lands in the host's step-result bag.
pub async fn post_step_reply(
    State(state): State<ApiState>,
    req_id: ReqId,
    Path((cluster_id, host_id)): Path<(String, String)>,
    Json(body): Json<StepReplyRequest>,
) -> Result<StatusCode, ApiError> {
    state
        .hosts
        .report_step_result(
            &cluster_id,
            &host_id,
            StepResult {
                step_id: body.step_id.clone(),
                step_type: body.step_type.clone(),
                exit_code: body.exit_code,
                output: body.output.clone(),
                error: body.error.clone(),
                received_at: foundry_state::epoch_secs(),
            },
            &req_id.0,
        )
        .map_err(with_id(&req_id))?;

    if body.exit_code == 0 {
        match body.step_type.as_str() {
            "inventory" => {
                state
                    .hosts
                    .update_inventory(&cluster_id, &host_id, &body.output, &req_id.0)
                    .map_err(with_id(&req_id))?;
            }
            "connectivity-check" => {
                state
                    .hosts
                    .update_connectivity(&cluster_id, &host_id, &body.output, &req_id.0)
                    .map_err(with_id(&req_id))?;
            }
            "hardware-info" => {
                state
                    .hosts
                    .update_hw_info(&cluster_id, &host_id, &body.output, &req_id.0)
                    .map_err(with_id(&req_id))?;
            }
            _ => {}
        }
    }
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct ProgressRequest {
    pub current_stage: String,
    #[serde(default)]
    pub progress_info: String,
}

/// POST /api/v1/clusters/{cluster_id}/hosts/{host_id}/progress
pub async fn update_host_install_progress(
    State(state): State<ApiState>,
    req_id: ReqId,
    Path((cluster_id, host_id)): Path<(String, String)>,
    Json(body): Json<ProgressRequest>,
) -> Result<Json<Host>, ApiError> {
    let host = state
        .hosts
        .update_install_progress(
            &cluster_id,
            &host_id,
            &body.current_stage,
            &body.progress_info,
            &req_id.0,
        )
        .map_err(with_id(&req_id))?;
    Ok(Json(host))
}

// ── Service metadata ───────────────────────────────────────────────

/// GET /api/v1/component-versions
pub async fn component_versions(State(state): State<ApiState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "release_image": state.versions.release_image,
        "agent_image": state.versions.agent_image,
        "installer_image": state.versions.installer_image,
        "controller_image": state.versions.controller_image,
        "service_version": state.versions.service_version,
    }))
}

/// GET /api/v1/managed-domains
pub async fn managed_domains(State(state): State<ApiState>) -> Json<Vec<String>> {
    Json(state.managed_domains.clone())
}

/// GET /metrics
pub async fn prometheus_metrics(State(state): State<ApiState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        state.metrics.render_prometheus(),
    )
}

/// GET /healthz
pub async fn healthz() -> StatusCode {
    StatusCode::OK
}

/// GET /ready
pub async fn ready(State(state): State<ApiState>) -> StatusCode {
    if state.ready.load(std::sync::atomic::Ordering::SeqCst) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
