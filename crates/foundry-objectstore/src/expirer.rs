//! Discovery-image expiration sweep.
//!
//! Enumerates discovery-image blobs older than the configured TTL and asks
//! the object store to delete them, emitting an event per expired image so
//! operators know a re-download will regenerate it.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use foundry_events::EventSink;
use foundry_state::{epoch_secs, EventSeverity};

use crate::{ObjectResult, ObjectStore, DISCOVERY_IMAGE_PREFIX};

/// Sweeps expired discovery images out of the object store.
pub struct ImageExpirer {
    store: Arc<dyn ObjectStore>,
    events: EventSink,
    ttl: Duration,
}

impl ImageExpirer {
    pub fn new(store: Arc<dyn ObjectStore>, events: EventSink, ttl: Duration) -> Self {
        Self { store, events, ttl }
    }

    /// Run one sweep. Returns the keys that were deleted.
    ///
    /// Per-object failures are logged and skipped so one bad blob cannot
    /// stall the sweep.
    pub async fn expire_once(&self) -> ObjectResult<Vec<String>> {
        let now = epoch_secs();
        let cutoff = now.saturating_sub(self.ttl.as_secs());
        let mut deleted = Vec::new();

        for object in self.store.list_by_prefix(DISCOVERY_IMAGE_PREFIX).await? {
            if object.last_modified >= cutoff {
                continue;
            }
            match self.store.delete(&object.key).await {
                Ok(true) => {
                    let cluster_id = object
                        .key
                        .strip_prefix(DISCOVERY_IMAGE_PREFIX)
                        .unwrap_or(&object.key);
                    if let Err(e) = self.events.add_event(
                        cluster_id,
                        None,
                        EventSeverity::Info,
                        "Deleted image from backend because it expired. It may be generated again at any time",
                        "",
                    ) {
                        warn!(key = %object.key, error = %e, "failed to record expiration event");
                    }
                    info!(key = %object.key, "expired discovery image deleted");
                    deleted.push(object.key);
                }
                Ok(false) => {}
                Err(e) => warn!(key = %object.key, error = %e, "failed to delete expired image"),
            }
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::MemStore;
    use crate::discovery_image_key;
    use foundry_metrics::MetricsRegistry;
    use foundry_state::StateStore;

    fn test_sink(store: &StateStore) -> EventSink {
        EventSink::new(store.clone(), Arc::new(MetricsRegistry::new()))
    }

    #[tokio::test]
    async fn deletes_only_stale_images() {
        let state = StateStore::open_in_memory().unwrap();
        let blobs = MemStore::new();
        blobs
            .upload(&discovery_image_key("old"), b"iso")
            .await
            .unwrap();
        blobs
            .upload(&discovery_image_key("fresh"), b"iso")
            .await
            .unwrap();
        blobs.upload("unrelated/key", b"x").await.unwrap();
        blobs
            .set_last_modified(&discovery_image_key("old"), 10)
            .await
            .unwrap();

        let expirer = ImageExpirer::new(
            Arc::new(blobs.clone()),
            test_sink(&state),
            Duration::from_secs(3600),
        );
        let deleted = expirer.expire_once().await.unwrap();

        assert_eq!(deleted, vec![discovery_image_key("old")]);
        assert!(!blobs.exists(&discovery_image_key("old")).await.unwrap());
        assert!(blobs.exists(&discovery_image_key("fresh")).await.unwrap());
        assert!(blobs.exists("unrelated/key").await.unwrap());

        let events = state.list_events("old", None).unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].message.contains("expired"));
    }
}
