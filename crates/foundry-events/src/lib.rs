//! foundry-events — append-only event sink.
//!
//! Records structured, severity-tagged events keyed by cluster and host.
//! State machines append events inside the same write transaction as the
//! transition they describe, so an aborted transition leaves no event
//! behind.

use std::sync::Arc;

use tracing::debug;

use foundry_metrics::MetricsRegistry;
use foundry_state::{epoch_millis, Event, EventSeverity, StateResult, StateStore, WriteCtx};

/// Appends and queries event records.
#[derive(Clone)]
pub struct EventSink {
    store: StateStore,
    metrics: Arc<MetricsRegistry>,
}

impl EventSink {
    pub fn new(store: StateStore, metrics: Arc<MetricsRegistry>) -> Self {
        Self { store, metrics }
    }

    /// Append an event in its own transaction.
    pub fn add_event(
        &self,
        cluster_id: &str,
        host_id: Option<&str>,
        severity: EventSeverity,
        message: &str,
        request_id: &str,
    ) -> StateResult<()> {
        self.store.with_write(|ctx| {
            self.append_in(ctx, cluster_id, host_id, severity, message, request_id)
        })
    }

    /// Append an event inside the caller's open write transaction.
    ///
    /// Used by state-machine transitions so that the event commits (or
    /// aborts) together with the row mutation it describes.
    pub fn append_in(
        &self,
        ctx: &WriteCtx<'_>,
        cluster_id: &str,
        host_id: Option<&str>,
        severity: EventSeverity,
        message: &str,
        request_id: &str,
    ) -> StateResult<()> {
        ctx.append_event(&Event {
            cluster_id: cluster_id.to_string(),
            host_id: host_id.map(str::to_string),
            severity,
            message: message.to_string(),
            event_time: epoch_millis(),
            request_id: request_id.to_string(),
        })?;
        self.metrics.events_appended.inc();
        debug!(%cluster_id, ?host_id, %severity, message, "event appended");
        Ok(())
    }

    /// List a cluster's events in append order, optionally filtered by host.
    pub fn list(&self, cluster_id: &str, host_id: Option<&str>) -> StateResult<Vec<Event>> {
        self.store.list_events(cluster_id, host_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_sink() -> EventSink {
        EventSink::new(
            StateStore::open_in_memory().unwrap(),
            Arc::new(MetricsRegistry::new()),
        )
    }

    #[test]
    fn appends_and_lists_in_order() {
        let sink = test_sink();
        sink.add_event("c1", Some("h1"), EventSeverity::Info, "first", "r1")
            .unwrap();
        sink.add_event("c1", None, EventSeverity::Warning, "second", "r2")
            .unwrap();

        let events = sink.list("c1", None).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].message, "first");
        assert_eq!(events[1].severity, EventSeverity::Warning);
        assert!(events[1].event_time >= events[0].event_time);
    }

    #[test]
    fn filters_by_host() {
        let sink = test_sink();
        sink.add_event("c1", Some("h1"), EventSeverity::Info, "for h1", "")
            .unwrap();
        sink.add_event("c1", Some("h2"), EventSeverity::Info, "for h2", "")
            .unwrap();

        let events = sink.list("c1", Some("h2")).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].message, "for h2");
    }

    #[test]
    fn counts_appended_events() {
        let metrics = Arc::new(MetricsRegistry::new());
        let sink = EventSink::new(StateStore::open_in_memory().unwrap(), metrics.clone());
        sink.add_event("c1", None, EventSeverity::Info, "x", "")
            .unwrap();
        assert_eq!(metrics.events_appended.get(), 1);
    }
}
