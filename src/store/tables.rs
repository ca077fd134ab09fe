use redb::{MultimapTableDefinition, TableDefinition};

/// Counters table: counter key -> current value
pub const COUNTERS: TableDefinition<&str, i64> = TableDefinition::new("counters");

/// Values table: storage key -> opaque serialized record
pub const VALUES: TableDefinition<&str, &[u8]> = TableDefinition::new("kv");

/// Sets table: set key -> members
/// Used for the secondary index over live record keys
pub const SETS: MultimapTableDefinition<&str, &str> = MultimapTableDefinition::new("sets");
