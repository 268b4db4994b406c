//! foundry-manifests — user-supplied install-time override files.
//!
//! Manifests are stored in the object store under
//! `<cluster_id>/manifests/<folder>/<filename>`, where `<folder>` is either
//! `manifests` (the default) or `openshift`. Content arrives base64-encoded
//! and is stored decoded.

use std::sync::Arc;

use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use foundry_objectstore::{ObjectError, ObjectStore};
use foundry_state::StateStore;

/// The default manifest folder.
pub const DEFAULT_FOLDER: &str = "manifests";
/// Folders a manifest may be placed in.
pub const VALID_FOLDERS: &[&str] = &[DEFAULT_FOLDER, "openshift"];

pub type ManifestResult<T> = Result<T, ManifestError>;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("cluster not found: {0}")]
    ClusterNotFound(String),

    #[error("manifest not found: {0}")]
    NotFound(String),

    #[error("invalid manifest folder: {0}")]
    InvalidFolder(String),

    #[error("invalid manifest file name: {0}")]
    InvalidFileName(String),

    #[error("manifest content is not valid base64: {0}")]
    InvalidContent(String),

    #[error(transparent)]
    State(#[from] foundry_state::StateError),

    #[error("object store error: {0}")]
    Object(String),
}

impl From<ObjectError> for ManifestError {
    fn from(e: ObjectError) -> Self {
        match e {
            ObjectError::NotFound(key) => ManifestError::NotFound(key),
            other => ManifestError::Object(other.to_string()),
        }
    }
}

/// A stored manifest, as reported to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub file_name: String,
    pub folder: String,
}

/// Parameters for creating a manifest.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateManifestParams {
    pub file_name: String,
    /// Defaults to `manifests` when absent.
    pub folder: Option<String>,
    /// Base64-encoded file content.
    pub content: String,
}

/// Create/list/download/delete manifests for a cluster.
pub struct ManifestsApi {
    store: StateStore,
    objects: Arc<dyn ObjectStore>,
}

impl ManifestsApi {
    pub fn new(store: StateStore, objects: Arc<dyn ObjectStore>) -> Self {
        Self { store, objects }
    }

    /// Store a manifest, overwriting any previous file of the same name.
    pub async fn create_manifest(
        &self,
        cluster_id: &str,
        params: CreateManifestParams,
    ) -> ManifestResult<Manifest> {
        self.require_cluster(cluster_id)?;
        let folder = validate_folder(params.folder.as_deref())?;
        let file_name = validate_file_name(&params.file_name)?;
        let content = base64::engine::general_purpose::STANDARD
            .decode(params.content.as_bytes())
            .map_err(|e| ManifestError::InvalidContent(e.to_string()))?;

        let key = object_key(cluster_id, &folder, &file_name);
        self.objects.upload(&key, &content).await?;
        info!(%cluster_id, %folder, %file_name, "manifest stored");
        Ok(Manifest { file_name, folder })
    }

    /// List the cluster's manifests across both folders.
    pub async fn list_manifests(&self, cluster_id: &str) -> ManifestResult<Vec<Manifest>> {
        self.require_cluster(cluster_id)?;
        let prefix = format!("{cluster_id}/manifests/");
        let mut out = Vec::new();
        for object in self.objects.list_by_prefix(&prefix).await? {
            let rest = &object.key[prefix.len()..];
            if let Some((folder, file_name)) = rest.split_once('/') {
                out.push(Manifest {
                    file_name: file_name.to_string(),
                    folder: folder.to_string(),
                });
            }
        }
        Ok(out)
    }

    /// Fetch a manifest's decoded content.
    pub async fn download_manifest(
        &self,
        cluster_id: &str,
        folder: Option<&str>,
        file_name: &str,
    ) -> ManifestResult<Vec<u8>> {
        self.require_cluster(cluster_id)?;
        let folder = validate_folder(folder)?;
        let key = object_key(cluster_id, &folder, file_name);
        Ok(self.objects.download(&key).await?)
    }

    /// Delete a manifest. Absent manifests are a not-found error.
    pub async fn delete_manifest(
        &self,
        cluster_id: &str,
        folder: Option<&str>,
        file_name: &str,
    ) -> ManifestResult<()> {
        self.require_cluster(cluster_id)?;
        let folder = validate_folder(folder)?;
        let key = object_key(cluster_id, &folder, file_name);
        if !self.objects.delete(&key).await? {
            return Err(ManifestError::NotFound(key));
        }
        info!(%cluster_id, %folder, %file_name, "manifest deleted");
        Ok(())
    }

    fn require_cluster(&self, cluster_id: &str) -> ManifestResult<()> {
        match self.store.get_cluster(cluster_id)? {
            Some(cluster) if cluster.deleted_at.is_none() => Ok(()),
            _ => Err(ManifestError::ClusterNotFound(cluster_id.to_string())),
        }
    }
}

fn object_key(cluster_id: &str, folder: &str, file_name: &str) -> String {
    format!("{cluster_id}/manifests/{folder}/{file_name}")
}

fn validate_folder(folder: Option<&str>) -> ManifestResult<String> {
    let folder = folder.unwrap_or(DEFAULT_FOLDER);
    if VALID_FOLDERS.contains(&folder) {
        Ok(folder.to_string())
    } else {
        Err(ManifestError::InvalidFolder(folder.to_string()))
    }
}

fn validate_file_name(file_name: &str) -> ManifestResult<String> {
    if file_name.is_empty() || file_name.contains('/') || file_name.contains("..") {
        return Err(ManifestError::InvalidFileName(file_name.to_string()));
    }
    Ok(file_name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use foundry_objectstore::MemStore;
    use foundry_state::Cluster;

    const CONTENT_B64: &str = "aGVsbG8gd29ybGQhCg==";

    fn api_with_cluster(cluster_id: &str) -> (ManifestsApi, MemStore) {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_cluster(&Cluster::new(cluster_id.to_string(), "test"))
            .unwrap();
        let blobs = MemStore::new();
        (ManifestsApi::new(store, Arc::new(blobs.clone())), blobs)
    }

    fn create_params(file_name: &str, folder: Option<&str>) -> CreateManifestParams {
        CreateManifestParams {
            file_name: file_name.to_string(),
            folder: folder.map(str::to_string),
            content: CONTENT_B64.to_string(),
        }
    }

    #[tokio::test]
    async fn create_defaults_to_manifests_folder() {
        let (api, blobs) = api_with_cluster("c1");
        let manifest = api
            .create_manifest("c1", create_params("99-test.yaml", None))
            .await
            .unwrap();
        assert_eq!(manifest.file_name, "99-test.yaml");
        assert_eq!(manifest.folder, "manifests");
        // Content is stored decoded under the canonical key.
        let body = blobs
            .download("c1/manifests/manifests/99-test.yaml")
            .await
            .unwrap();
        assert_eq!(body, b"hello world!\n");
    }

    #[tokio::test]
    async fn create_accepts_openshift_folder() {
        let (api, _blobs) = api_with_cluster("c1");
        let manifest = api
            .create_manifest("c1", create_params("99-test.yaml", Some("openshift")))
            .await
            .unwrap();
        assert_eq!(manifest.folder, "openshift");
    }

    #[tokio::test]
    async fn create_rejects_unknown_folder() {
        let (api, _blobs) = api_with_cluster("c1");
        let err = api
            .create_manifest("c1", create_params("99-test.yaml", Some("deploy")))
            .await
            .unwrap_err();
        assert!(matches!(err, ManifestError::InvalidFolder(_)));
    }

    #[tokio::test]
    async fn create_rejects_bad_base64() {
        let (api, _blobs) = api_with_cluster("c1");
        let mut params = create_params("99-test.yaml", None);
        params.content = "not base64!!!".to_string();
        let err = api.create_manifest("c1", params).await.unwrap_err();
        assert!(matches!(err, ManifestError::InvalidContent(_)));
    }

    #[tokio::test]
    async fn create_requires_cluster() {
        let store = StateStore::open_in_memory().unwrap();
        let api = ManifestsApi::new(store, Arc::new(MemStore::new()));
        let err = api
            .create_manifest("missing", create_params("a.yaml", None))
            .await
            .unwrap_err();
        assert!(matches!(err, ManifestError::ClusterNotFound(_)));
    }

    #[tokio::test]
    async fn create_list_download_delete_roundtrip() {
        let (api, _blobs) = api_with_cluster("c1");
        api.create_manifest("c1", create_params("99-test.yaml", None))
            .await
            .unwrap();
        api.create_manifest("c1", create_params("50-other.yaml", Some("openshift")))
            .await
            .unwrap();

        let mut listed = api.list_manifests("c1").await.unwrap();
        listed.sort_by(|a, b| a.file_name.cmp(&b.file_name));
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].folder, "openshift");
        assert_eq!(listed[1].folder, "manifests");

        let body = api
            .download_manifest("c1", None, "99-test.yaml")
            .await
            .unwrap();
        assert_eq!(body, b"hello world!\n");

        api.delete_manifest("c1", None, "99-test.yaml").await.unwrap();

        // After delete the object is absent and no longer listed.
        let listed = api.list_manifests("c1").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed.iter().all(|m| m.file_name != "99-test.yaml"));
        assert!(matches!(
            api.download_manifest("c1", None, "99-test.yaml").await,
            Err(ManifestError::NotFound(_))
        ));
        assert!(matches!(
            api.delete_manifest("c1", None, "99-test.yaml").await,
            Err(ManifestError::NotFound(_))
        ));
    }
}
