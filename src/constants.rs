// =============================================================================
// Storage Keys
// =============================================================================

/// Counter key used to allocate user ids
pub const USER_ID_COUNTER: &str = "user:id";

/// Prefix of the storage key holding one serialized user
pub const USER_KEY_PREFIX: &str = "users:";

/// Index set whose members are the storage keys of live users
pub const USER_INDEX_SET: &str = "users";

// =============================================================================
// Configuration Defaults
// =============================================================================

/// Default location of the redb file
pub const DEFAULT_DATABASE_PATH: &str = "./data/users.redb";

/// Default bound on a single repository operation (5 seconds)
pub const DEFAULT_OP_TIMEOUT_MS: u64 = 5_000;
