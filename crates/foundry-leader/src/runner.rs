//! Named periodic task runner.
//!
//! Each monitor is an independent long-lived tokio task ticking on a fixed
//! interval until the shutdown channel fires. The tick callback owns its
//! captured handles; leader gating happens inside the callback via
//! [`crate::run_with_leader`].

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

/// Spawn a named periodic monitor.
pub fn spawn_monitor<F, Fut>(
    name: &'static str,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        info!(monitor = name, ?interval, "monitor started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    tick().await;
                }
                _ = shutdown.changed() => {
                    info!(monitor = name, "monitor stopped");
                    break;
                }
            }
        }
    })
}
