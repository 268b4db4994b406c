//! StateStore — redb-backed row store for the installation service.
//!
//! Provides typed CRUD operations over clusters, hosts, events, and leader
//! leases. All values are JSON-serialized into redb's `&[u8]` value columns.
//! The store supports both on-disk and in-memory backends (the latter for
//! testing).
//!
//! redb serializes write transactions, so all row mutations performed through
//! [`StateStore::with_write`] are atomic and totally ordered. Where the
//! caller read a row before deciding on a mutation, [`WriteCtx`] lets it
//! re-read inside the transaction and detect a lost race (optimistic
//! concurrency, see the host manager's transition retry).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableTable};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

fn ser<T: Serialize>(value: &T) -> StateResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(map_err!(Serialize))
}

fn de<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

/// Upper bound for a `{prefix}/…` key range scan. `/` is 0x2F and `0` is
/// 0x30, so every composite key under the prefix sorts below this bound.
fn prefix_end(prefix: &str) -> String {
    format!("{prefix}0")
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(CLUSTERS).map_err(map_err!(Table))?;
        txn.open_table(HOSTS).map_err(map_err!(Table))?;
        txn.open_table(EVENTS).map_err(map_err!(Table))?;
        txn.open_table(LEASES).map_err(map_err!(Table))?;
        txn.open_table(SCHEMA_MIGRATIONS).map_err(map_err!(Table))?;
        txn.open_table(META).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Run `f` inside one short-lived write transaction.
    ///
    /// If `f` returns an error the transaction is dropped without commit —
    /// no mutation reaches the store.
    pub fn with_write<T>(&self, f: impl FnOnce(&WriteCtx<'_>) -> StateResult<T>) -> StateResult<T> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let out = f(&WriteCtx { txn: &txn })?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(out)
    }

    // ── Clusters ───────────────────────────────────────────────────

    /// Insert or update a cluster row.
    pub fn put_cluster(&self, cluster: &Cluster) -> StateResult<()> {
        self.with_write(|ctx| ctx.put_cluster(cluster))
    }

    /// Fetch a cluster by ID.
    pub fn get_cluster(&self, cluster_id: &str) -> StateResult<Option<Cluster>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(CLUSTERS).map_err(map_err!(Table))?;
        match table.get(cluster_id).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(de(guard.value())?)),
            None => Ok(None),
        }
    }

    /// List all cluster rows, soft-deleted included.
    pub fn list_clusters(&self) -> StateResult<Vec<Cluster>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(CLUSTERS).map_err(map_err!(Table))?;
        let mut out = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            out.push(de(value.value())?);
        }
        Ok(out)
    }

    /// Hard-delete a cluster together with its host and event rows.
    pub fn delete_cluster(&self, cluster_id: &str) -> StateResult<bool> {
        self.with_write(|ctx| ctx.delete_cluster(cluster_id))
    }

    // ── Hosts ──────────────────────────────────────────────────────

    /// Insert or update a host row.
    pub fn put_host(&self, host: &Host) -> StateResult<()> {
        self.with_write(|ctx| ctx.put_host(host))
    }

    /// Fetch a host by (cluster_id, host_id).
    pub fn get_host(&self, cluster_id: &str, host_id: &str) -> StateResult<Option<Host>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(HOSTS).map_err(map_err!(Table))?;
        match table
            .get(host_key(cluster_id, host_id).as_str())
            .map_err(map_err!(Read))?
        {
            Some(guard) => Ok(Some(de(guard.value())?)),
            None => Ok(None),
        }
    }

    /// Find a host by its ID alone, scanning all clusters.
    ///
    /// Serves legacy agents that poll by node ID without a cluster scope.
    pub fn find_host(&self, host_id: &str) -> StateResult<Option<Host>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(HOSTS).map_err(map_err!(Table))?;
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let host: Host = de(value.value())?;
            if host.id == host_id {
                return Ok(Some(host));
            }
        }
        Ok(None)
    }

    /// List all host rows across all clusters, soft-deleted included.
    pub fn list_hosts(&self) -> StateResult<Vec<Host>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(HOSTS).map_err(map_err!(Table))?;
        let mut out = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            out.push(de(value.value())?);
        }
        Ok(out)
    }

    /// List the hosts belonging to one cluster.
    pub fn list_hosts_for_cluster(&self, cluster_id: &str) -> StateResult<Vec<Host>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(HOSTS).map_err(map_err!(Table))?;
        let start = format!("{cluster_id}/");
        let mut out = Vec::new();
        for entry in table
            .range(start.as_str()..prefix_end(cluster_id).as_str())
            .map_err(map_err!(Read))?
        {
            let (_, value) = entry.map_err(map_err!(Read))?;
            out.push(de(value.value())?);
        }
        Ok(out)
    }

    /// List all (cluster_id, host_id) keys, for batched monitor walks.
    pub fn list_host_keys(&self) -> StateResult<Vec<(ClusterId, HostId)>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(HOSTS).map_err(map_err!(Table))?;
        let mut out = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, _) = entry.map_err(map_err!(Read))?;
            if let Some((cluster_id, host_id)) = key.value().split_once('/') {
                out.push((cluster_id.to_string(), host_id.to_string()));
            }
        }
        Ok(out)
    }

    /// Hard-delete a single host row.
    pub fn delete_host(&self, cluster_id: &str, host_id: &str) -> StateResult<bool> {
        self.with_write(|ctx| ctx.delete_host(cluster_id, host_id))
    }

    // ── Events ─────────────────────────────────────────────────────

    /// Append an event record. Events are immutable once written.
    pub fn append_event(&self, event: &Event) -> StateResult<()> {
        self.with_write(|ctx| ctx.append_event(event))
    }

    /// Delete events older than `cutoff_millis` across all clusters.
    ///
    /// Returns how many rows were purged. Event rows are immutable, so TTL
    /// purging and cluster deletion are the only ways they leave the store.
    pub fn purge_events_before(&self, cutoff_millis: u64) -> StateResult<usize> {
        self.with_write(|ctx| {
            let mut table = ctx.txn.open_table(EVENTS).map_err(map_err!(Table))?;
            let stale: Vec<String> = table
                .iter()
                .map_err(map_err!(Read))?
                .filter_map(|entry| match entry {
                    Ok((key, value)) => match de::<Event>(value.value()) {
                        Ok(event) if event.event_time < cutoff_millis => {
                            Some(Ok(key.value().to_string()))
                        }
                        Ok(_) => None,
                        Err(e) => Some(Err(e)),
                    },
                    Err(e) => Some(Err(StateError::Read(e.to_string()))),
                })
                .collect::<StateResult<_>>()?;
            for key in &stale {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
            Ok(stale.len())
        })
    }

    /// List a cluster's events in append order, optionally filtered by host.
    pub fn list_events(
        &self,
        cluster_id: &str,
        host_id: Option<&str>,
    ) -> StateResult<Vec<Event>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(EVENTS).map_err(map_err!(Table))?;
        let start = format!("{cluster_id}/");
        let mut out = Vec::new();
        for entry in table
            .range(start.as_str()..prefix_end(cluster_id).as_str())
            .map_err(map_err!(Read))?
        {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let event: Event = de(value.value())?;
            if let Some(filter) = host_id {
                if event.host_id.as_deref() != Some(filter) {
                    continue;
                }
            }
            out.push(event);
        }
        Ok(out)
    }

    // ── Leases ─────────────────────────────────────────────────────

    /// Read a lease by name.
    pub fn get_lease(&self, name: &str) -> StateResult<Option<LeaseRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(LEASES).map_err(map_err!(Table))?;
        match table.get(name).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(de(guard.value())?)),
            None => Ok(None),
        }
    }

    /// Acquire or renew a lease under the store's write lock.
    ///
    /// Succeeds when the lease is free, lapsed, or already held by
    /// `holder`. Returns whether `holder` owns the lease afterwards.
    pub fn try_acquire_lease(
        &self,
        name: &str,
        holder: &str,
        duration_ms: u64,
    ) -> StateResult<bool> {
        self.with_write(|ctx| {
            let table = ctx.txn.open_table(LEASES).map_err(map_err!(Table))?;
            let now = epoch_millis();
            let current: Option<LeaseRecord> = match table.get(name).map_err(map_err!(Read))? {
                Some(guard) => Some(de(guard.value())?),
                None => None,
            };
            drop(table);
            let ours = match current {
                Some(lease) if lease.holder != holder && lease.expires_at > now => false,
                other => {
                    let record = LeaseRecord {
                        holder: holder.to_string(),
                        expires_at: now + duration_ms,
                        acquired_at: other
                            .filter(|l| l.holder == holder)
                            .map(|l| l.acquired_at)
                            .unwrap_or(now),
                    };
                    let mut table = ctx.txn.open_table(LEASES).map_err(map_err!(Table))?;
                    table
                        .insert(name, ser(&record)?.as_slice())
                        .map_err(map_err!(Write))?;
                    true
                }
            };
            Ok(ours)
        })
    }

    /// Release a lease if held by `holder`.
    pub fn release_lease(&self, name: &str, holder: &str) -> StateResult<()> {
        self.with_write(|ctx| {
            let mut table = ctx.txn.open_table(LEASES).map_err(map_err!(Table))?;
            let held = match table.get(name).map_err(map_err!(Read))? {
                Some(guard) => de::<LeaseRecord>(guard.value())?.holder == holder,
                None => false,
            };
            if held {
                table.remove(name).map_err(map_err!(Write))?;
            }
            Ok(())
        })
    }

    // ── Meta ───────────────────────────────────────────────────────

    /// Read a store-wide metadata value.
    pub fn get_meta(&self, key: &str) -> StateResult<Option<String>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(META).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(de(guard.value())?)),
            None => Ok(None),
        }
    }

    /// Write a store-wide metadata value.
    pub fn put_meta(&self, key: &str, value: &str) -> StateResult<()> {
        self.with_write(|ctx| ctx.put_meta(key, value))
    }

    pub(crate) fn db(&self) -> &Database {
        &self.db
    }
}

/// Handle to one open write transaction.
///
/// All mutations through one `WriteCtx` commit atomically.
pub struct WriteCtx<'a> {
    pub(crate) txn: &'a redb::WriteTransaction,
}

impl WriteCtx<'_> {
    /// Re-read a cluster inside the transaction.
    pub fn get_cluster(&self, cluster_id: &str) -> StateResult<Option<Cluster>> {
        let table = self.txn.open_table(CLUSTERS).map_err(map_err!(Table))?;
        let result = match table.get(cluster_id).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(de(guard.value())?)),
            None => Ok(None),
        };
        result
    }

    /// Insert or update a cluster row.
    pub fn put_cluster(&self, cluster: &Cluster) -> StateResult<()> {
        let mut table = self.txn.open_table(CLUSTERS).map_err(map_err!(Table))?;
        table
            .insert(cluster.id.as_str(), ser(cluster)?.as_slice())
            .map_err(map_err!(Write))?;
        Ok(())
    }

    /// Hard-delete a cluster with its hosts and events.
    pub fn delete_cluster(&self, cluster_id: &str) -> StateResult<bool> {
        let mut clusters = self.txn.open_table(CLUSTERS).map_err(map_err!(Table))?;
        let existed = clusters
            .remove(cluster_id)
            .map_err(map_err!(Write))?
            .is_some();
        drop(clusters);
        self.remove_prefix(HOSTS, cluster_id)?;
        self.remove_prefix(EVENTS, cluster_id)?;
        Ok(existed)
    }

    /// Re-read a host inside the transaction.
    pub fn get_host(&self, cluster_id: &str, host_id: &str) -> StateResult<Option<Host>> {
        let table = self.txn.open_table(HOSTS).map_err(map_err!(Table))?;
        let result = match table
            .get(host_key(cluster_id, host_id).as_str())
            .map_err(map_err!(Read))?
        {
            Some(guard) => Ok(Some(de(guard.value())?)),
            None => Ok(None),
        };
        result
    }

    /// Insert or update a host row.
    pub fn put_host(&self, host: &Host) -> StateResult<()> {
        let mut table = self.txn.open_table(HOSTS).map_err(map_err!(Table))?;
        table
            .insert(host.table_key().as_str(), ser(host)?.as_slice())
            .map_err(map_err!(Write))?;
        Ok(())
    }

    /// Hard-delete a single host row.
    pub fn delete_host(&self, cluster_id: &str, host_id: &str) -> StateResult<bool> {
        let mut table = self.txn.open_table(HOSTS).map_err(map_err!(Table))?;
        let result = table
            .remove(host_key(cluster_id, host_id).as_str())
            .map_err(map_err!(Write))?
            .is_some();
        Ok(result)
    }

    /// Append an event record within the transaction.
    pub fn append_event(&self, event: &Event) -> StateResult<()> {
        let seq = self.bump_event_seq()?;
        let key = format!("{}/{seq:012}", event.cluster_id);
        let mut table = self.txn.open_table(EVENTS).map_err(map_err!(Table))?;
        table
            .insert(key.as_str(), ser(event)?.as_slice())
            .map_err(map_err!(Write))?;
        Ok(())
    }

    /// Write a store-wide metadata value.
    pub fn put_meta(&self, key: &str, value: &str) -> StateResult<()> {
        let mut table = self.txn.open_table(META).map_err(map_err!(Table))?;
        table
            .insert(key, ser(&value.to_string())?.as_slice())
            .map_err(map_err!(Write))?;
        Ok(())
    }

    fn bump_event_seq(&self) -> StateResult<u64> {
        let mut table = self.txn.open_table(META).map_err(map_err!(Table))?;
        let seq: u64 = match table.get("next_event_seq").map_err(map_err!(Read))? {
            Some(guard) => de(guard.value())?,
            None => 0,
        };
        table
            .insert("next_event_seq", ser(&(seq + 1))?.as_slice())
            .map_err(map_err!(Write))?;
        Ok(seq)
    }

    fn remove_prefix(
        &self,
        def: redb::TableDefinition<'_, &str, &[u8]>,
        prefix: &str,
    ) -> StateResult<()> {
        let mut table = self.txn.open_table(def).map_err(map_err!(Table))?;
        let start = format!("{prefix}/");
        let keys: Vec<String> = table
            .range(start.as_str()..prefix_end(prefix).as_str())
            .map_err(map_err!(Read))?
            .map(|entry| entry.map(|(k, _)| k.value().to_string()))
            .collect::<Result<_, _>>()
            .map_err(map_err!(Read))?;
        for key in keys {
            table.remove(key.as_str()).map_err(map_err!(Write))?;
        }
        Ok(())
    }
}
