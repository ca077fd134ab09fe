use redb::{Database, MultimapTable, ReadableDatabase, ReadableTable, Table};
use std::path::Path;
use std::sync::Arc;

use super::{Batch, Command, KvStore, StoreError, StoreResult, tables};

/// Durable [`KvStore`] backed by a redb database file
///
/// Every primitive runs in its own redb transaction, and a [`Batch`] runs in a
/// single write transaction that is only committed once every command has
/// applied. redb serializes write transactions, which is what makes
/// [`incr`](KvStore::incr) safe under concurrent callers.
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
}

impl RedbStore {
    /// Open or create the redb database at the given path
    ///
    /// Creates all required tables on first run.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        tracing::info!("Opening store at: {:?}", path.as_ref());

        // Create parent directory if it doesn't exist
        if let Some(parent) = path.as_ref().parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                tracing::error!("Failed to create store directory: {}", e);
                StoreError::Io(e)
            })?;
        }

        let db = Database::create(path)?;
        Self::from_database(Arc::new(db))
    }

    /// Wrap an already opened database, creating missing tables
    pub fn from_database(db: Arc<Database>) -> StoreResult<Self> {
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(tables::COUNTERS)?;
            let _ = write_txn.open_table(tables::VALUES)?;
            let _ = write_txn.open_multimap_table(tables::SETS)?;
        }
        write_txn.commit()?;

        tracing::info!("Store initialized successfully");

        Ok(Self { db })
    }

    /// Run `batch` in one write transaction.
    ///
    /// With `strict` set, an unmet condition aborts the transaction; otherwise
    /// it is reported as an unchanged command.
    fn run(&self, batch: Batch, strict: bool) -> StoreResult<Vec<bool>> {
        let write_txn = self.db.begin_write()?;
        let mut changed = Vec::with_capacity(batch.len());
        {
            let mut values = write_txn.open_table(tables::VALUES)?;
            let mut sets = write_txn.open_multimap_table(tables::SETS)?;

            for command in batch.commands() {
                let applied = apply(&mut values, &mut sets, command)?;
                if strict && command.is_conditional() && !applied {
                    tracing::debug!("Condition failed on {}, aborting batch", command.target());
                    // Dropping the transaction discards every command applied so far
                    return Err(StoreError::ConditionFailed {
                        key: command.target().to_string(),
                    });
                }
                changed.push(applied);
            }
        }
        write_txn.commit()?;

        Ok(changed)
    }

    fn run_one(&self, command: Command) -> StoreResult<bool> {
        let changed = self.run(Batch::from(vec![command]), false)?;
        Ok(changed.first().copied().unwrap_or(false))
    }
}

fn apply(
    values: &mut Table<'_, &'static str, &'static [u8]>,
    sets: &mut MultimapTable<'_, &'static str, &'static str>,
    command: &Command,
) -> StoreResult<bool> {
    let applied = match command {
        Command::Set { key, value } => {
            values.insert(key.as_str(), value.as_slice())?;
            true
        }
        Command::SetIfAbsent { key, value } => {
            let exists = values.get(key.as_str())?.is_some();
            if !exists {
                values.insert(key.as_str(), value.as_slice())?;
            }
            !exists
        }
        Command::SetIfPresent { key, value } => {
            let exists = values.get(key.as_str())?.is_some();
            if exists {
                values.insert(key.as_str(), value.as_slice())?;
            }
            exists
        }
        Command::Delete { key } => values.remove(key.as_str())?.is_some(),
        // insert reports whether the pair was already present
        Command::SetAdd { set, member } => !sets.insert(set.as_str(), member.as_str())?,
        Command::SetRemove { set, member } => sets.remove(set.as_str(), member.as_str())?,
    };

    Ok(applied)
}

impl KvStore for RedbStore {
    fn incr(&self, counter: &str) -> StoreResult<i64> {
        let write_txn = self.db.begin_write()?;
        let next = {
            let mut counters = write_txn.open_table(tables::COUNTERS)?;
            let current = counters.get(counter)?.map(|v| v.value()).unwrap_or(0);
            let next = current
                .checked_add(1)
                .ok_or_else(|| StoreError::CounterOverflow {
                    key: counter.to_string(),
                })?;
            counters.insert(counter, next)?;
            next
        };
        write_txn.commit()?;

        Ok(next)
    }

    fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let read_txn = self.db.begin_read()?;
        let values = read_txn.open_table(tables::VALUES)?;
        let value = values.get(key)?.map(|v| v.value().to_vec());

        Ok(value)
    }

    fn set(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        self.run_one(Command::Set {
            key: key.to_string(),
            value: value.to_vec(),
        })?;
        Ok(())
    }

    fn set_if_absent(&self, key: &str, value: &[u8]) -> StoreResult<bool> {
        self.run_one(Command::SetIfAbsent {
            key: key.to_string(),
            value: value.to_vec(),
        })
    }

    fn delete(&self, key: &str) -> StoreResult<bool> {
        self.run_one(Command::Delete {
            key: key.to_string(),
        })
    }

    fn set_add(&self, set: &str, member: &str) -> StoreResult<bool> {
        self.run_one(Command::SetAdd {
            set: set.to_string(),
            member: member.to_string(),
        })
    }

    fn set_remove(&self, set: &str, member: &str) -> StoreResult<bool> {
        self.run_one(Command::SetRemove {
            set: set.to_string(),
            member: member.to_string(),
        })
    }

    fn set_members(&self, set: &str) -> StoreResult<Vec<String>> {
        let read_txn = self.db.begin_read()?;
        let sets = read_txn.open_multimap_table(tables::SETS)?;

        let mut members = Vec::new();
        for member in sets.get(set)? {
            members.push(member?.value().to_string());
        }

        Ok(members)
    }

    fn exec(&self, batch: Batch) -> StoreResult<Vec<bool>> {
        self.run(batch, true)
    }
}
