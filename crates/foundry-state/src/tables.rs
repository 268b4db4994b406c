//! redb table definitions for the foundry state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain
//! types). Composite keys follow the pattern `{cluster_id}/{child}`.

use redb::TableDefinition;

/// Cluster rows keyed by `{cluster_id}`.
pub const CLUSTERS: TableDefinition<&str, &[u8]> = TableDefinition::new("clusters");

/// Host rows keyed by `{cluster_id}/{host_id}`.
pub const HOSTS: TableDefinition<&str, &[u8]> = TableDefinition::new("hosts");

/// Event rows keyed by `{cluster_id}/{seq:012}`.
///
/// The zero-padded per-store sequence makes the key order equal the append
/// order within a cluster prefix.
pub const EVENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("events");

/// Leader leases keyed by lease name.
pub const LEASES: TableDefinition<&str, &[u8]> = TableDefinition::new("leases");

/// Applied schema migrations keyed by migration ID.
pub const SCHEMA_MIGRATIONS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("schema_migrations");

/// Store-wide metadata (counters, declared column types) keyed by name.
pub const META: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");
