//! In-memory object store (for testing and single-process runs).

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{ObjectError, ObjectMeta, ObjectResult, ObjectStore};
use foundry_state::epoch_secs;

#[derive(Clone)]
struct StoredObject {
    body: Vec<u8>,
    last_modified: u64,
}

/// Object store backed by a process-local map.
#[derive(Clone, Default)]
pub struct MemStore {
    objects: Arc<RwLock<BTreeMap<String, StoredObject>>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backdate an object's modification time (test helper for expiry).
    pub async fn set_last_modified(&self, key: &str, last_modified: u64) -> ObjectResult<()> {
        let mut objects = self.objects.write().await;
        match objects.get_mut(key) {
            Some(object) => {
                object.last_modified = last_modified;
                Ok(())
            }
            None => Err(ObjectError::NotFound(key.to_string())),
        }
    }
}

#[async_trait]
impl ObjectStore for MemStore {
    async fn upload(&self, key: &str, body: &[u8]) -> ObjectResult<()> {
        let mut objects = self.objects.write().await;
        objects.insert(
            key.to_string(),
            StoredObject {
                body: body.to_vec(),
                last_modified: epoch_secs(),
            },
        );
        Ok(())
    }

    async fn download(&self, key: &str) -> ObjectResult<Vec<u8>> {
        let objects = self.objects.read().await;
        objects
            .get(key)
            .map(|o| o.body.clone())
            .ok_or_else(|| ObjectError::NotFound(key.to_string()))
    }

    async fn exists(&self, key: &str) -> ObjectResult<bool> {
        Ok(self.objects.read().await.contains_key(key))
    }

    async fn delete(&self, key: &str) -> ObjectResult<bool> {
        Ok(self.objects.write().await.remove(key).is_some())
    }

    async fn list_by_prefix(&self, prefix: &str) -> ObjectResult<Vec<ObjectMeta>> {
        let objects = self.objects.read().await;
        Ok(objects
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, object)| ObjectMeta {
                key: key.clone(),
                size: object.body.len() as u64,
                last_modified: object.last_modified,
            })
            .collect())
    }
}
