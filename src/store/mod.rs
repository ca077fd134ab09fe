//! Key-value store contract used by the user repository.
//!
//! The repository only ever talks to a [`KvStore`]: atomic counters, opaque
//! values under string keys, string sets, and an all-or-nothing [`Batch`] of
//! write commands. Three backends are provided: [`RedbStore`] on a redb file,
//! [`RedisStore`] on a Redis server, and [`MemoryStore`] for tests and
//! ephemeral use.

pub mod memory;
pub mod redb_store;
pub mod redis_store;
pub mod tables;

pub use memory::MemoryStore;
pub use redb_store::RedbStore;
pub use redis_store::RedisStore;

use std::time::Duration;
use thiserror::Error;

/// Store-level error type
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("Storage error: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),

    #[error("Operation timed out after {0:?}")]
    TimedOut(Duration),

    #[error("Condition failed for key {key}")]
    ConditionFailed { key: String },

    #[error("Key {key} holds the wrong kind of value")]
    WrongType { key: String },

    #[error("Counter {key} overflowed")]
    CounterOverflow { key: String },

    #[error("Injected failure on {0:?}")]
    Injected(Op),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// The store may or may not have applied the work: the caller stopped
    /// waiting, the task was lost, or the connection failed mid-call.
    pub fn outcome_unknown(&self) -> bool {
        match self {
            StoreError::TimedOut(_) | StoreError::TaskJoin(_) => true,
            StoreError::Redis(e) => e.is_io_error() || e.is_timeout() || e.is_connection_dropped(),
            _ => false,
        }
    }
}

/// Result type alias for store primitives
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Names of the store primitives, used for logging and fault injection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Incr,
    Get,
    Set,
    SetIfAbsent,
    SetIfPresent,
    Delete,
    SetAdd,
    SetRemove,
    SetMembers,
}

/// A single write command inside a [`Batch`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Unconditional overwrite
    Set { key: String, value: Vec<u8> },
    /// Write only if the key holds no value, otherwise abort the batch
    SetIfAbsent { key: String, value: Vec<u8> },
    /// Write only if the key already holds a value, otherwise abort the batch
    SetIfPresent { key: String, value: Vec<u8> },
    Delete { key: String },
    SetAdd { set: String, member: String },
    SetRemove { set: String, member: String },
}

impl Command {
    pub fn op(&self) -> Op {
        match self {
            Command::Set { .. } => Op::Set,
            Command::SetIfAbsent { .. } => Op::SetIfAbsent,
            Command::SetIfPresent { .. } => Op::SetIfPresent,
            Command::Delete { .. } => Op::Delete,
            Command::SetAdd { .. } => Op::SetAdd,
            Command::SetRemove { .. } => Op::SetRemove,
        }
    }

    /// Conditional commands abort their batch when the condition does not hold
    pub fn is_conditional(&self) -> bool {
        matches!(
            self,
            Command::SetIfAbsent { .. } | Command::SetIfPresent { .. }
        )
    }

    /// The value key or set key this command writes to
    pub fn target(&self) -> &str {
        match self {
            Command::Set { key, .. }
            | Command::SetIfAbsent { key, .. }
            | Command::SetIfPresent { key, .. }
            | Command::Delete { key } => key,
            Command::SetAdd { set, .. } | Command::SetRemove { set, .. } => set,
        }
    }
}

/// Ordered list of commands executed atomically by [`KvStore::exec`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    commands: Vec<Command>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: impl Into<String>, value: Vec<u8>) -> Self {
        self.commands.push(Command::Set {
            key: key.into(),
            value,
        });
        self
    }

    pub fn set_if_absent(mut self, key: impl Into<String>, value: Vec<u8>) -> Self {
        self.commands.push(Command::SetIfAbsent {
            key: key.into(),
            value,
        });
        self
    }

    pub fn set_if_present(mut self, key: impl Into<String>, value: Vec<u8>) -> Self {
        self.commands.push(Command::SetIfPresent {
            key: key.into(),
            value,
        });
        self
    }

    pub fn delete(mut self, key: impl Into<String>) -> Self {
        self.commands.push(Command::Delete { key: key.into() });
        self
    }

    pub fn set_add(mut self, set: impl Into<String>, member: impl Into<String>) -> Self {
        self.commands.push(Command::SetAdd {
            set: set.into(),
            member: member.into(),
        });
        self
    }

    pub fn set_remove(mut self, set: impl Into<String>, member: impl Into<String>) -> Self {
        self.commands.push(Command::SetRemove {
            set: set.into(),
            member: member.into(),
        });
        self
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }
}

impl From<Vec<Command>> for Batch {
    fn from(commands: Vec<Command>) -> Self {
        Self { commands }
    }
}

impl IntoIterator for Batch {
    type Item = Command;
    type IntoIter = std::vec::IntoIter<Command>;

    fn into_iter(self) -> Self::IntoIter {
        self.commands.into_iter()
    }
}

/// Capabilities the repository requires from a backing store.
///
/// Primitives are synchronous; callers on an async runtime run them on the
/// blocking pool. Every primitive and every [`exec`](KvStore::exec) call opens
/// and releases its own transaction.
pub trait KvStore: Send + Sync + 'static {
    /// Atomically increment `counter` and return the new value (first call yields 1)
    fn incr(&self, counter: &str) -> StoreResult<i64>;

    fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    fn set(&self, key: &str, value: &[u8]) -> StoreResult<()>;

    /// Returns `true` if the value was written
    fn set_if_absent(&self, key: &str, value: &[u8]) -> StoreResult<bool>;

    /// Returns `true` if a value was removed
    fn delete(&self, key: &str) -> StoreResult<bool>;

    /// Returns `true` if the member was newly added
    fn set_add(&self, set: &str, member: &str) -> StoreResult<bool>;

    /// Returns `true` if the member was present
    fn set_remove(&self, set: &str, member: &str) -> StoreResult<bool>;

    fn set_members(&self, set: &str) -> StoreResult<Vec<String>>;

    /// Execute `batch` all-or-nothing.
    ///
    /// On success returns one flag per command reporting whether it changed
    /// anything. On any error nothing from the batch is visible.
    fn exec(&self, batch: Batch) -> StoreResult<Vec<bool>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_builder_keeps_order() {
        let batch = Batch::new()
            .set_if_absent("users:1", b"a".to_vec())
            .set_add("users", "users:1");

        assert_eq!(batch.len(), 2);
        assert_eq!(batch.commands()[0].op(), Op::SetIfAbsent);
        assert_eq!(batch.commands()[1].op(), Op::SetAdd);
    }

    #[test]
    fn test_command_targets() {
        let batch = Batch::new()
            .set_if_present("users:7", Vec::new())
            .delete("users:8")
            .set_remove("users", "users:8");

        let targets: Vec<&str> = batch.commands().iter().map(Command::target).collect();
        assert_eq!(targets, vec!["users:7", "users:8", "users"]);
        assert!(batch.commands()[0].is_conditional());
        assert!(!batch.commands()[1].is_conditional());
    }

    #[test]
    fn test_outcome_unknown() {
        assert!(StoreError::TimedOut(Duration::from_millis(50)).outcome_unknown());
        assert!(!StoreError::ConditionFailed { key: "users:1".to_string() }.outcome_unknown());
        assert!(!StoreError::Injected(Op::SetAdd).outcome_unknown());
    }

    #[test]
    fn test_empty_batch() {
        let batch = Batch::new();
        assert!(batch.is_empty());
        assert_eq!(batch.into_iter().count(), 0);
    }
}
