//! Versioned schema migrations with a persistent ledger.
//!
//! redb tables are schemaless, so a migration here rewrites rows and/or the
//! declared column-type metadata the service reports for its relational
//! surface. Applied migration IDs are recorded in the `schema_migrations`
//! ledger; `migrate` applies the registered set in ID order and is
//! idempotent.

use serde::{Deserialize, Serialize};

use crate::error::StateResult;
use crate::store::StateStore;
use crate::tables::SCHEMA_MIGRATIONS;
use crate::types::epoch_secs;

/// Meta key holding the declared type of the install-config overrides column.
pub const OVERRIDES_COLUMN_TYPE_KEY: &str = "install_config_overrides_type";

/// A single reversible migration.
pub struct Migration {
    /// Sortable timestamp ID, e.g. `20201019194303`.
    pub id: &'static str,
    pub name: &'static str,
    pub up: fn(&StateStore) -> StateResult<()>,
    pub down: fn(&StateStore) -> StateResult<()>,
}

#[derive(Debug, Serialize, Deserialize)]
struct LedgerEntry {
    id: String,
    applied_at: u64,
}

/// All registered migrations, sorted by ID.
pub fn all() -> Vec<Migration> {
    let mut migrations = vec![change_overrides_to_text()];
    migrations.sort_by_key(|m| m.id);
    migrations
}

/// Apply every registered migration that the ledger has not seen yet.
pub fn migrate(store: &StateStore) -> StateResult<()> {
    let done = applied(store)?;
    for migration in all() {
        if done.iter().any(|id| id == migration.id) {
            continue;
        }
        tracing::info!(id = migration.id, name = migration.name, "applying migration");
        (migration.up)(store)?;
        record(store, migration.id)?;
    }
    Ok(())
}

/// Roll a single migration back and drop it from the ledger.
pub fn rollback(store: &StateStore, migration: &Migration) -> StateResult<()> {
    tracing::info!(id = migration.id, name = migration.name, "rolling back migration");
    (migration.down)(store)?;
    store.with_write(|ctx| {
        let mut table = ctx
            .txn
            .open_table(SCHEMA_MIGRATIONS)
            .map_err(|e| crate::error::StateError::Table(e.to_string()))?;
        table
            .remove(migration.id)
            .map_err(|e| crate::error::StateError::Write(e.to_string()))?;
        Ok(())
    })
}

/// IDs recorded in the ledger.
pub fn applied(store: &StateStore) -> StateResult<Vec<String>> {
    use redb::ReadableTable;
    let txn = store
        .db()
        .begin_read()
        .map_err(|e| crate::error::StateError::Transaction(e.to_string()))?;
    let table = txn
        .open_table(SCHEMA_MIGRATIONS)
        .map_err(|e| crate::error::StateError::Table(e.to_string()))?;
    let mut out = Vec::new();
    for entry in table
        .iter()
        .map_err(|e| crate::error::StateError::Read(e.to_string()))?
    {
        let (key, _) = entry.map_err(|e| crate::error::StateError::Read(e.to_string()))?;
        out.push(key.value().to_string());
    }
    Ok(out)
}

/// The declared column type for install-config overrides.
///
/// `varchar(2048)` before `20201019194303` is applied, `text` after.
pub fn overrides_column_type(store: &StateStore) -> StateResult<String> {
    Ok(store
        .get_meta(OVERRIDES_COLUMN_TYPE_KEY)?
        .unwrap_or_else(|| "varchar(2048)".to_string()))
}

fn record(store: &StateStore, id: &str) -> StateResult<()> {
    let entry = LedgerEntry {
        id: id.to_string(),
        applied_at: epoch_secs(),
    };
    store.with_write(|ctx| {
        let mut table = ctx
            .txn
            .open_table(SCHEMA_MIGRATIONS)
            .map_err(|e| crate::error::StateError::Table(e.to_string()))?;
        table
            .insert(
                id,
                serde_json::to_vec(&entry)
                    .map_err(|e| crate::error::StateError::Serialize(e.to_string()))?
                    .as_slice(),
            )
            .map_err(|e| crate::error::StateError::Write(e.to_string()))?;
        Ok(())
    })
}

/// Widen install-config overrides from `varchar(2048)` to `text`.
///
/// Stored values are already free-form strings; only the declared type
/// changes. Down narrows the declared type back without touching values.
pub fn change_overrides_to_text() -> Migration {
    Migration {
        id: "20201019194303",
        name: "change_overrides_to_text",
        up: |store| store.put_meta(OVERRIDES_COLUMN_TYPE_KEY, "text"),
        down: |store| store.put_meta(OVERRIDES_COLUMN_TYPE_KEY, "varchar(2048)"),
    }
}
