//! Deletion worker — reaps soft-deleted rows and their blobs.
//!
//! Deregistration only marks rows; this worker hard-deletes clusters and
//! hosts whose soft-delete timestamp has aged past the retention window,
//! together with the cluster's objects in the blob store.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use foundry_leader::Elector;
use foundry_objectstore::{discovery_image_key, ObjectStore};
use foundry_state::{epoch_secs, StateStore};

/// Hard-deletes rows soft-deleted beyond the retention window and purges
/// events past their TTL.
pub struct DeletionWorker {
    store: StateStore,
    objects: Arc<dyn ObjectStore>,
    elector: Arc<dyn Elector>,
    retention: Duration,
    event_retention: Duration,
}

impl DeletionWorker {
    pub fn new(
        store: StateStore,
        objects: Arc<dyn ObjectStore>,
        elector: Arc<dyn Elector>,
        retention: Duration,
        event_retention: Duration,
    ) -> Self {
        Self {
            store,
            objects,
            elector,
            retention,
            event_retention,
        }
    }

    /// One reap pass. Per-row failures log and continue.
    pub async fn permanently_delete_unregistered(&self) {
        if !self.elector.is_leader() {
            return;
        }
        let cutoff = epoch_secs().saturating_sub(self.retention.as_secs());

        let clusters = match self.store.list_clusters() {
            Ok(clusters) => clusters,
            Err(e) => {
                warn!(error = %e, "deletion worker failed to list clusters");
                return;
            }
        };
        for cluster in clusters {
            let Some(deleted_at) = cluster.deleted_at else {
                continue;
            };
            if deleted_at > cutoff {
                continue;
            }
            if let Err(e) = self.delete_cluster_blobs(&cluster.id).await {
                warn!(cluster_id = %cluster.id, error = %e, "failed to delete cluster blobs");
                continue;
            }
            match self.store.delete_cluster(&cluster.id) {
                Ok(_) => info!(cluster_id = %cluster.id, "permanently deleted cluster"),
                Err(e) => warn!(cluster_id = %cluster.id, error = %e, "failed to delete cluster"),
            }
        }

        let hosts = match self.store.list_hosts() {
            Ok(hosts) => hosts,
            Err(e) => {
                warn!(error = %e, "deletion worker failed to list hosts");
                return;
            }
        };
        for host in hosts {
            let Some(deleted_at) = host.deleted_at else {
                continue;
            };
            if deleted_at > cutoff {
                continue;
            }
            match self.store.delete_host(&host.cluster_id, &host.id) {
                Ok(_) => {
                    info!(cluster_id = %host.cluster_id, host_id = %host.id, "permanently deleted host")
                }
                Err(e) => warn!(host_id = %host.id, error = %e, "failed to delete host"),
            }
        }

        let event_cutoff_millis =
            epoch_secs().saturating_sub(self.event_retention.as_secs()) * 1_000;
        match self.store.purge_events_before(event_cutoff_millis) {
            Ok(0) => {}
            Ok(purged) => info!(purged, "purged expired events"),
            Err(e) => warn!(error = %e, "failed to purge expired events"),
        }
    }

    async fn delete_cluster_blobs(&self, cluster_id: &str) -> foundry_objectstore::ObjectResult<()> {
        for object in self.objects.list_by_prefix(&format!("{cluster_id}/")).await? {
            self.objects.delete(&object.key).await?;
        }
        self.objects.delete(&discovery_image_key(cluster_id)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foundry_leader::DummyElector;
    use foundry_objectstore::MemStore;
    use foundry_state::{Cluster, Host};

    fn soft_deleted_cluster(id: &str, deleted_at: u64) -> Cluster {
        let mut cluster = Cluster::new(id.to_string(), "doomed");
        cluster.deleted_at = Some(deleted_at);
        cluster
    }

    #[tokio::test]
    async fn reaps_only_rows_past_retention() {
        let store = StateStore::open_in_memory().unwrap();
        let blobs = MemStore::new();
        store.put_cluster(&soft_deleted_cluster("old", 100)).unwrap();
        store
            .put_cluster(&soft_deleted_cluster("recent", epoch_secs()))
            .unwrap();
        store.put_cluster(&Cluster::new("live".to_string(), "live")).unwrap();
        store
            .put_host(&Host::new("h1".to_string(), "old".to_string()))
            .unwrap();
        blobs.upload("old/manifests/manifests/a.yaml", b"x").await.unwrap();
        blobs
            .upload(&discovery_image_key("old"), b"iso")
            .await
            .unwrap();

        let worker = DeletionWorker::new(
            store.clone(),
            Arc::new(blobs.clone()),
            Arc::new(DummyElector),
            Duration::from_secs(3600),
            Duration::from_secs(7 * 24 * 3600),
        );
        worker.permanently_delete_unregistered().await;

        assert!(store.get_cluster("old").unwrap().is_none());
        assert!(store.get_cluster("recent").unwrap().is_some());
        assert!(store.get_cluster("live").unwrap().is_some());
        assert!(store.list_hosts_for_cluster("old").unwrap().is_empty());
        assert!(!blobs
            .exists("old/manifests/manifests/a.yaml")
            .await
            .unwrap());
        assert!(!blobs.exists(&discovery_image_key("old")).await.unwrap());
    }

    #[tokio::test]
    async fn reaps_individually_deregistered_hosts() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_cluster(&Cluster::new("c1".to_string(), "c")).unwrap();
        let mut host = Host::new("h1".to_string(), "c1".to_string());
        host.deleted_at = Some(100);
        store.put_host(&host).unwrap();
        store
            .put_host(&Host::new("h2".to_string(), "c1".to_string()))
            .unwrap();

        let worker = DeletionWorker::new(
            store.clone(),
            Arc::new(MemStore::new()),
            Arc::new(DummyElector),
            Duration::from_secs(3600),
            Duration::from_secs(7 * 24 * 3600),
        );
        worker.permanently_delete_unregistered().await;

        assert!(store.get_host("c1", "h1").unwrap().is_none());
        assert!(store.get_host("c1", "h2").unwrap().is_some());
    }

    #[tokio::test]
    async fn purges_events_past_their_ttl() {
        let store = StateStore::open_in_memory().unwrap();
        for (message, event_time) in [("stale", 1_000), ("fresh", foundry_state::epoch_millis())] {
            store
                .append_event(&foundry_state::Event {
                    cluster_id: "c1".to_string(),
                    host_id: None,
                    severity: foundry_state::EventSeverity::Info,
                    message: message.to_string(),
                    event_time,
                    request_id: String::new(),
                })
                .unwrap();
        }

        let worker = DeletionWorker::new(
            store.clone(),
            Arc::new(MemStore::new()),
            Arc::new(DummyElector),
            Duration::from_secs(3600),
            Duration::from_secs(3600),
        );
        worker.permanently_delete_unregistered().await;

        let events = store.list_events("c1", None).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].message, "fresh");
    }
}
