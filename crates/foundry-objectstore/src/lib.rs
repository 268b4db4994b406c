//! foundry-objectstore — blob storage behind a capability trait.
//!
//! Discovery images, ignition files, and per-cluster manifests live in an
//! object store addressed by string keys. The core only depends on the
//! [`ObjectStore`] trait; deployments pick the filesystem implementation,
//! tests the in-memory one.

pub mod expirer;
pub mod fs;
pub mod mem;

pub use expirer::ImageExpirer;
pub use fs::FsStore;
pub use mem::MemStore;

use async_trait::async_trait;
use thiserror::Error;

/// Key prefix for per-cluster discovery images.
pub const DISCOVERY_IMAGE_PREFIX: &str = "discovery-image-";

/// Object key for a cluster's discovery image.
pub fn discovery_image_key(cluster_id: &str) -> String {
    format!("{DISCOVERY_IMAGE_PREFIX}{cluster_id}")
}

pub type ObjectResult<T> = Result<T, ObjectError>;

#[derive(Debug, Error)]
pub enum ObjectError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("invalid object key: {0}")]
    InvalidKey(String),

    #[error("object store I/O error: {0}")]
    Io(String),
}

/// Metadata for one stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub key: String,
    pub size: u64,
    /// Epoch seconds of the last write.
    pub last_modified: u64,
}

/// Blob store capability: put/get/list-by-prefix/exists/delete.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn upload(&self, key: &str, body: &[u8]) -> ObjectResult<()>;

    async fn download(&self, key: &str) -> ObjectResult<Vec<u8>>;

    async fn exists(&self, key: &str) -> ObjectResult<bool>;

    /// Returns whether the object existed.
    async fn delete(&self, key: &str) -> ObjectResult<bool>;

    async fn list_by_prefix(&self, prefix: &str) -> ObjectResult<Vec<ObjectMeta>>;
}
