//! foundry-metrics — process-wide counters and Prometheus exposition.
//!
//! The registry is an explicit injected value: components receive an
//! `Arc<MetricsRegistry>` from the daemon rather than reaching for a hidden
//! singleton. Counters are append-only atomics; none hold business state.

use std::sync::atomic::{AtomicU64, Ordering};

/// A monotonically increasing counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Fixed set of service counters.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    /// Committed host state transitions.
    pub host_transitions: Counter,
    /// Committed cluster state transitions.
    pub cluster_transitions: Counter,
    /// Events appended to the sink.
    pub events_appended: Counter,
    /// Instruction batches served to agents.
    pub step_batches_served: Counter,
    /// Completed host-monitor sweeps.
    pub host_monitor_ticks: Counter,
    /// Completed cluster-monitor sweeps.
    pub cluster_monitor_ticks: Counter,
    /// API requests served.
    pub api_requests: Counter,
    /// API requests answered with an error body.
    pub api_errors: Counter,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Render all counters in the Prometheus text exposition format.
    pub fn render_prometheus(&self) -> String {
        let mut out = String::new();
        for (name, help, counter) in [
            (
                "foundry_host_transitions_total",
                "Committed host state transitions.",
                &self.host_transitions,
            ),
            (
                "foundry_cluster_transitions_total",
                "Committed cluster state transitions.",
                &self.cluster_transitions,
            ),
            (
                "foundry_events_appended_total",
                "Events appended to the sink.",
                &self.events_appended,
            ),
            (
                "foundry_step_batches_served_total",
                "Instruction batches served to agents.",
                &self.step_batches_served,
            ),
            (
                "foundry_host_monitor_ticks_total",
                "Completed host-monitor sweeps.",
                &self.host_monitor_ticks,
            ),
            (
                "foundry_cluster_monitor_ticks_total",
                "Completed cluster-monitor sweeps.",
                &self.cluster_monitor_ticks,
            ),
            (
                "foundry_api_requests_total",
                "API requests served.",
                &self.api_requests,
            ),
            (
                "foundry_api_errors_total",
                "API requests answered with an error body.",
                &self.api_errors,
            ),
        ] {
            out.push_str(&format!("# HELP {name} {help}\n"));
            out.push_str(&format!("# TYPE {name} counter\n"));
            out.push_str(&format!("{name} {}\n", counter.get()));
        }
        out
    }
}
