use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Mutex, RwLock};

use super::{Batch, Command, KvStore, Op, StoreError, StoreResult};

#[derive(Debug, Clone, Default)]
struct State {
    counters: HashMap<String, i64>,
    values: HashMap<String, Vec<u8>>,
    sets: HashMap<String, BTreeSet<String>>,
}

impl State {
    fn apply(&mut self, command: &Command) -> bool {
        match command {
            Command::Set { key, value } => {
                self.values.insert(key.clone(), value.clone());
                true
            }
            Command::SetIfAbsent { key, value } => {
                if self.values.contains_key(key) {
                    return false;
                }
                self.values.insert(key.clone(), value.clone());
                true
            }
            Command::SetIfPresent { key, value } => match self.values.get_mut(key) {
                Some(existing) => {
                    *existing = value.clone();
                    true
                }
                None => false,
            },
            Command::Delete { key } => self.values.remove(key).is_some(),
            Command::SetAdd { set, member } => self
                .sets
                .entry(set.clone())
                .or_default()
                .insert(member.clone()),
            Command::SetRemove { set, member } => {
                let Some(members) = self.sets.get_mut(set) else {
                    return false;
                };
                let removed = members.remove(member);
                if members.is_empty() {
                    self.sets.remove(set);
                }
                removed
            }
        }
    }
}

/// In-process [`KvStore`] for tests and ephemeral deployments
///
/// A batch is applied to a staged copy of the state which replaces the live
/// state only when every command succeeded. Faults registered with
/// [`fail_on`](MemoryStore::fail_on) make the named primitive fail wherever it
/// runs, including inside a batch.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<State>,
    faults: Mutex<HashSet<Op>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent use of `op` fail until [`clear_faults`](MemoryStore::clear_faults)
    pub fn fail_on(&self, op: Op) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.insert(op);
        }
    }

    pub fn clear_faults(&self) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.clear();
        }
    }

    fn check(&self, op: Op) -> StoreResult<()> {
        let faults = self
            .faults
            .lock()
            .map_err(|_| StoreError::Unavailable("fault registry lock poisoned".to_string()))?;
        if faults.contains(&op) {
            tracing::debug!("Injected failure on {:?}", op);
            return Err(StoreError::Injected(op));
        }
        Ok(())
    }

    fn read(&self) -> StoreResult<std::sync::RwLockReadGuard<'_, State>> {
        self.state
            .read()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }

    fn write(&self) -> StoreResult<std::sync::RwLockWriteGuard<'_, State>> {
        self.state
            .write()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }

    fn run_one(&self, command: Command) -> StoreResult<bool> {
        self.check(command.op())?;
        Ok(self.write()?.apply(&command))
    }
}

impl KvStore for MemoryStore {
    fn incr(&self, counter: &str) -> StoreResult<i64> {
        self.check(Op::Incr)?;
        let mut state = self.write()?;
        let value = state.counters.entry(counter.to_string()).or_insert(0);
        *value = value
            .checked_add(1)
            .ok_or_else(|| StoreError::CounterOverflow {
                key: counter.to_string(),
            })?;
        Ok(*value)
    }

    fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        self.check(Op::Get)?;
        Ok(self.read()?.values.get(key).cloned())
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
        self.check(Op::SetMembers)?;
        let state = self.read()?;
        Ok(state
            .sets
            .get(set)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn exec(&self, batch: Batch) -> StoreResult<Vec<bool>> {
        let mut state = self.write()?;
        let mut staged = State::clone(&state);
        let mut changed = Vec::with_capacity(batch.len());

        for command in batch.commands() {
            self.check(command.op())?;
            let applied = staged.apply(command);
            if command.is_conditional() && !applied {
                return Err(StoreError::ConditionFailed {
                    key: command.target().to_string(),
                });
            }
            changed.push(applied);
        }

        *state = staged;
        Ok(changed)
    }
}
