//! Lease-based leader election over the state store.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use foundry_state::{epoch_millis, StateStore};

use crate::{LeaderError, LeaderResult};

/// Lease timing parameters.
#[derive(Debug, Clone)]
pub struct LeaderConfig {
    /// How long one granted lease lasts.
    pub lease_duration: Duration,
    /// How often acquisition/renewal is attempted.
    pub retry_interval: Duration,
    /// Leadership is dropped when renewal has not succeeded for this long.
    pub renew_deadline: Duration,
    /// Namespace prefix for the lease name.
    pub namespace: String,
}

impl Default for LeaderConfig {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(5),
            retry_interval: Duration::from_secs(2),
            renew_deadline: Duration::from_secs(4),
            namespace: "foundry".to_string(),
        }
    }
}

/// Observes whether this process currently leads.
#[async_trait]
pub trait Elector: Send + Sync {
    fn is_leader(&self) -> bool;

    /// Block until leadership is held, or until `shutdown` fires.
    async fn wait_for_leadership(&self, shutdown: watch::Receiver<bool>) -> LeaderResult<()>;
}

/// Elector that always holds leadership (single-process deployments).
#[derive(Debug, Default, Clone)]
pub struct DummyElector;

#[async_trait]
impl Elector for DummyElector {
    fn is_leader(&self) -> bool {
        true
    }

    async fn wait_for_leadership(&self, _shutdown: watch::Receiver<bool>) -> LeaderResult<()> {
        Ok(())
    }
}

/// Store-backed lease elector.
///
/// `start` spawns a loop that attempts to acquire or renew the named lease
/// every retry interval. Leadership lapses when renewal has failed past the
/// renew deadline, or when another holder owns an unexpired lease.
pub struct LeaseElector {
    store: StateStore,
    lease_name: String,
    /// Unique identity of this process instance.
    identity: String,
    cfg: LeaderConfig,
    leading: AtomicBool,
    last_renew_ms: AtomicU64,
}

impl LeaseElector {
    pub fn new(store: StateStore, cfg: LeaderConfig, component: &str) -> Arc<Self> {
        let lease_name = format!("{}/{component}", cfg.namespace);
        Arc::new(Self {
            store,
            lease_name,
            identity: uuid::Uuid::new_v4().to_string(),
            cfg,
            leading: AtomicBool::new(false),
            last_renew_ms: AtomicU64::new(0),
        })
    }

    /// Spawn the acquire/renew loop. Releases the lease on shutdown.
    pub fn start(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let elector = Arc::clone(self);
        tokio::spawn(async move {
            info!(lease = %elector.lease_name, identity = %elector.identity, "leader election started");
            loop {
                elector.tick();
                tokio::select! {
                    _ = tokio::time::sleep(elector.cfg.retry_interval) => {}
                    _ = shutdown.changed() => break,
                }
            }
            if elector.leading.swap(false, Ordering::SeqCst) {
                if let Err(e) = elector
                    .store
                    .release_lease(&elector.lease_name, &elector.identity)
                {
                    warn!(lease = %elector.lease_name, error = %e, "failed to release lease");
                } else {
                    info!(lease = %elector.lease_name, "lease released");
                }
            }
        })
    }

    /// One acquisition/renewal attempt.
    fn tick(&self) {
        let duration_ms = self.cfg.lease_duration.as_millis() as u64;
        match self
            .store
            .try_acquire_lease(&self.lease_name, &self.identity, duration_ms)
        {
            Ok(true) => {
                self.last_renew_ms.store(epoch_millis(), Ordering::SeqCst);
                if !self.leading.swap(true, Ordering::SeqCst) {
                    info!(lease = %self.lease_name, "leadership acquired");
                }
            }
            Ok(false) => {
                if self.leading.swap(false, Ordering::SeqCst) {
                    warn!(lease = %self.lease_name, "leadership lost to another holder");
                }
            }
            Err(e) => {
                // Keep leading until the renew deadline lapses.
                let last = self.last_renew_ms.load(Ordering::SeqCst);
                let deadline_ms = self.cfg.renew_deadline.as_millis() as u64;
                if epoch_millis().saturating_sub(last) > deadline_ms
                    && self.leading.swap(false, Ordering::SeqCst)
                {
                    warn!(lease = %self.lease_name, error = %e, "leadership dropped after renew deadline");
                } else {
                    debug!(lease = %self.lease_name, error = %e, "lease renewal attempt failed");
                }
            }
        }
    }
}

#[async_trait]
impl Elector for LeaseElector {
    fn is_leader(&self) -> bool {
        self.leading.load(Ordering::SeqCst)
    }

    async fn wait_for_leadership(&self, mut shutdown: watch::Receiver<bool>) -> LeaderResult<()> {
        loop {
            if self.is_leader() {
                return Ok(());
            }
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                _ = shutdown.changed() => return Err(LeaderError::ShutDown),
            }
        }
    }
}
