//! REST API handlers for cluster manifests.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;

use foundry_manifests::{CreateManifestParams, Manifest};

use crate::error::ApiError;
use crate::middleware::ReqId;
use crate::ApiState;

/// POST /api/v1/clusters/{cluster_id}/manifests
pub async fn create_manifest(
    State(state): State<ApiState>,
    req_id: ReqId,
    Path(cluster_id): Path<String>,
    Json(params): Json<CreateManifestParams>,
) -> Result<impl IntoResponse, ApiError> {
    let manifest = state
        .manifests
        .create_manifest(&cluster_id, params)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(&req_id.0))?;
    Ok((StatusCode::CREATED, Json(manifest)))
}

/// GET /api/v1/clusters/{cluster_id}/manifests
pub async fn list_manifests(
    State(state): State<ApiState>,
    req_id: ReqId,
    Path(cluster_id): Path<String>,
) -> Result<Json<Vec<Manifest>>, ApiError> {
    let manifests = state
        .manifests
        .list_manifests(&cluster_id)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(&req_id.0))?;
    Ok(Json(manifests))
}

#[derive(Debug, Deserialize)]
pub struct ManifestQuery {
    pub file_name: String,
    pub folder: Option<String>,
}

/// GET /api/v1/clusters/{cluster_id}/manifests/files
pub async fn download_manifest(
    State(state): State<ApiState>,
    req_id: ReqId,
    Path(cluster_id): Path<String>,
    Query(query): Query<ManifestQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let body = state
        .manifests
        .download_manifest(&cluster_id, query.folder.as_deref(), &query.file_name)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(&req_id.0))?;
    Ok((
        StatusCode::OK,
        [("content-type", "application/octet-stream")],
        body,
    ))
}

/// DELETE /api/v1/clusters/{cluster_id}/manifests
pub async fn delete_manifest(
    State(state): State<ApiState>,
    req_id: ReqId,
    Path(cluster_id): Path<String>,
    Query(query): Query<ManifestQuery>,
) -> Result<StatusCode, ApiError> {
    state
        .manifests
        .delete_manifest(&cluster_id, query.folder.as_deref(), &query.file_name)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(&req_id.0))?;
    Ok(StatusCode::NO_CONTENT)
}
