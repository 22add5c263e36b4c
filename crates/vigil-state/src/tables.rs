//! redb table definitions for the Vigil state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Service records keyed by service id.
pub const SERVICES: TableDefinition<&str, &[u8]> = TableDefinition::new("services");

/// Incidents keyed by incident id (`{service_id}-{seq}`).
pub const INCIDENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("incidents");

/// Notification dedup index: dedup key → incident id.
pub const DEDUP: TableDefinition<&str, &str> = TableDefinition::new("notification_dedup");
