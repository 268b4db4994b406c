//! Uniform error responses.
//!
//! Every error body is `{code, href, id, kind, reason}`; `reason` is safe
//! to display and `id` echoes the request ID for log correlation.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use foundry_cluster::ClusterError;
use foundry_host::HostError;
use foundry_manifests::ManifestError;
use foundry_state::StateError;

/// Error payload returned to clients.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub href: String,
    pub id: String,
    pub kind: String,
    pub reason: String,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub reason: String,
    pub id: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, reason: impl Into<String>) -> Self {
        Self {
            status,
            code,
            reason: reason.into(),
            id: String::new(),
        }
    }

    pub fn not_found(reason: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", reason)
    }

    pub fn bad_request(reason: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", reason)
    }

    pub fn conflict(reason: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, "conflict", reason)
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", reason)
    }

    /// Attach the request ID for log correlation.
    pub fn with_request_id(mut self, request_id: &str) -> Self {
        self.id = request_id.to_string();
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            code: self.code.to_string(),
            href: format!("/api/v1/errors/{}", self.code),
            id: self.id,
            kind: "Error".to_string(),
            reason: self.reason,
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<StateError> for ApiError {
    fn from(e: StateError) -> Self {
        match e {
            StateError::ClusterNotFound(_) | StateError::HostNotFound(_) => {
                ApiError::not_found(e.to_string())
            }
            StateError::Conflict(..) => ApiError::conflict(e.to_string()),
            other => ApiError::internal(other.to_string()),
        }
    }
}

impl From<HostError> for ApiError {
    fn from(e: HostError) -> Self {
        match e {
            HostError::ClusterNotFound(_) | HostError::HostNotFound(_) => {
                ApiError::not_found(e.to_string())
            }
            HostError::InvalidInventory(_) => ApiError::bad_request(e.to_string()),
            HostError::InvalidStateTransition { .. } => ApiError::conflict(e.to_string()),
            HostError::State(inner) => inner.into(),
        }
    }
}

impl From<ClusterError> for ApiError {
    fn from(e: ClusterError) -> Self {
        match e {
            ClusterError::ClusterNotFound(_) => ApiError::not_found(e.to_string()),
            ClusterError::InvalidStateTransition { .. } => ApiError::conflict(e.to_string()),
            ClusterError::NotReady { .. } => ApiError::conflict(e.to_string()),
            ClusterError::Host(inner) => inner.into(),
            ClusterError::State(inner) => inner.into(),
        }
    }
}

impl From<ManifestError> for ApiError {
    fn from(e: ManifestError) -> Self {
        match e {
            ManifestError::ClusterNotFound(_) | ManifestError::NotFound(_) => {
                ApiError::not_found(e.to_string())
            }
            ManifestError::InvalidFolder(_)
            | ManifestError::InvalidFileName(_)
            | ManifestError::InvalidContent(_) => ApiError::bad_request(e.to_string()),
            ManifestError::State(inner) => inner.into(),
            ManifestError::Object(reason) => ApiError::internal(reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_errors_map_to_statuses() {
        let e: ApiError = HostError::ClusterNotFound("c1".to_string()).into();
        assert_eq!(e.status, StatusCode::NOT_FOUND);

        let e: ApiError = HostError::InvalidInventory("bad".to_string()).into();
        assert_eq!(e.status, StatusCode::BAD_REQUEST);

        let e: ApiError = HostError::InvalidStateTransition {
            host_id: "h1".to_string(),
            current: foundry_state::HostState::Installing,
            operation: "register",
        }
        .into();
        assert_eq!(e.status, StatusCode::CONFLICT);
        // The current state is part of the displayed reason.
        assert!(e.reason.contains("installing"));
    }

    #[test]
    fn not_ready_maps_to_conflict() {
        let e: ApiError = ClusterError::NotReady {
            cluster_id: "c1".to_string(),
            reasons: "2 of 3 hosts are ready".to_string(),
        }
        .into();
        assert_eq!(e.status, StatusCode::CONFLICT);
    }
}
