//! Request-ID and authentication middleware.

use axum::extract::{FromRequestParts, Request, State};
use axum::http::request::Parts;
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::Response;

use crate::error::ApiError;
use crate::ApiState;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// The per-request correlation ID, readable by any handler.
#[derive(Debug, Clone)]
pub struct ReqId(pub String);

impl<S: Send + Sync> FromRequestParts<S> for ReqId {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let id = parts
            .headers
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        Ok(ReqId(id))
    }
}

/// Assign each request a UUID (unless the client sent one) and echo it in
/// the response.
pub async fn request_id(mut request: Request, next: Next) -> Response {
    let id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    if let Ok(value) = HeaderValue::from_str(&id) {
        request.headers_mut().insert(REQUEST_ID_HEADER, value.clone());
        let mut response = next.run(request).await;
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
        return response;
    }
    next.run(request).await
}

/// Count requests and error responses in the metrics registry.
pub async fn count_requests(State(state): State<ApiState>, request: Request, next: Next) -> Response {
    state.metrics.api_requests.inc();
    let response = next.run(request).await;
    if response.status().is_client_error() || response.status().is_server_error() {
        state.metrics.api_errors.inc();
    }
    response
}

/// Coarse bearer-token authentication.
///
/// Agent identities carry a per-cluster token and may only act on their own
/// cluster; user identities carry the deployment's access token. Disabled
/// deployments accept everything.
pub async fn authenticate(
    State(state): State<ApiState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let auth = &state.auth;
    if !auth.enable_auth {
        return Ok(next.run(request).await);
    }

    let token = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string);

    let Some(token) = token else {
        return Err(ApiError::new(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "missing bearer token",
        ));
    };

    if auth.validate_user(&token) {
        return Ok(next.run(request).await);
    }
    // Agent tokens are cluster-scoped: the token must match the cluster
    // named in the path.
    if let Some(cluster_id) = path_cluster_id(request.uri().path()) {
        if auth.validate_agent(&token, &cluster_id) {
            return Ok(next.run(request).await);
        }
    }

    Err(ApiError::new(
        StatusCode::UNAUTHORIZED,
        "unauthorized",
        "invalid token",
    ))
}

/// Extract `{cluster_id}` from `/api/v1/clusters/{cluster_id}/…` paths.
fn path_cluster_id(path: &str) -> Option<String> {
    let mut segments = path.split('/').filter(|s| !s.is_empty());
    while let Some(segment) = segments.next() {
        if segment == "clusters" {
            return segments.next().map(str::to_string);
        }
    }
    None
}

/// Authentication configuration.
///
/// The trust-provider integration is an external collaborator; this keeps
/// only the coarse decision: a deployment-wide user token and per-cluster
/// agent tokens minted from a shared secret.
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    pub enable_auth: bool,
    /// Deployment-wide user access token.
    pub user_token: String,
    /// Secret the per-cluster agent tokens are minted from.
    pub agent_secret: String,
}

impl AuthConfig {
    /// The bearer token minted for a cluster's agents.
    pub fn agent_token(&self, cluster_id: &str) -> String {
        format!("{}.{cluster_id}", self.agent_secret)
    }

    pub fn validate_user(&self, token: &str) -> bool {
        !self.user_token.is_empty() && token == self.user_token
    }

    pub fn validate_agent(&self, token: &str, cluster_id: &str) -> bool {
        !self.agent_secret.is_empty() && token == self.agent_token(cluster_id)
    }
}
