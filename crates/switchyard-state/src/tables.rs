//! redb table definitions for the Switchyard state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain
//! types). Replica set ids embed the service name so a prefix scan over
//! `{service}:` finds all sets of one service.

use redb::TableDefinition;

/// Build artifacts keyed by `{revision_id}`.
pub const ARTIFACTS: TableDefinition<&str, &[u8]> = TableDefinition::new("artifacts");

/// Replica sets keyed by `{set_id}` (`{service}:{revision}:{epoch}`).
pub const REPLICA_SETS: TableDefinition<&str, &[u8]> = TableDefinition::new("replica_sets");

/// Routing singletons keyed by `{service}`.
pub const ROUTING: TableDefinition<&str, &[u8]> = TableDefinition::new("routing");

/// Pipeline runs keyed by `{run_id}`.
pub const RUNS: TableDefinition<&str, &[u8]> = TableDefinition::new("runs");

/// Approval decisions keyed by `{run_id}`.
pub const APPROVALS: TableDefinition<&str, &[u8]> = TableDefinition::new("approvals");
