use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use crate::constants::{DEFAULT_OP_TIMEOUT_MS, USER_ID_COUNTER, USER_INDEX_SET};
use crate::error::{RepoError, Result};
use crate::models::{NewUser, User, user_key};
use crate::store::{Batch, KvStore, StoreError, StoreResult};

/// Result of [`UserRepository::update`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The stored value was replaced
    Updated(User),
    /// No user is stored under that id; nothing was written
    NotFound,
}

impl UpdateOutcome {
    pub fn is_updated(&self) -> bool {
        matches!(self, UpdateOutcome::Updated(_))
    }
}

/// Users resolved by a lenient listing, plus the index entries it skipped
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Listing {
    pub users: Vec<User>,
    /// Index members with no stored value
    pub orphaned: Vec<String>,
    /// Index members whose value failed to decode
    pub undecodable: Vec<String>,
}

impl Listing {
    pub fn skipped(&self) -> usize {
        self.orphaned.len() + self.undecodable.len()
    }
}

/// User persistence over a [`KvStore`]
///
/// Users live under `users:<id>` keys, ids come from the `user:id` counter,
/// and the `users` set indexes every live key. Insert and delete change the
/// value and its index membership in one atomic batch.
///
/// Store calls run on the blocking pool and each operation is bounded by the
/// repository timeout. A timed-out batch may still commit, so a timeout is
/// reported as store unavailability, never as an aborted transaction.
pub struct UserRepository<S> {
    store: Arc<S>,
    timeout: Duration,
}

impl<S> Clone for UserRepository<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            timeout: self.timeout,
        }
    }
}

impl<S: KvStore> UserRepository<S> {
    pub fn new(store: S) -> Self {
        Self::with_shared(Arc::new(store))
    }

    pub fn with_shared(store: Arc<S>) -> Self {
        Self {
            store,
            timeout: Duration::from_millis(DEFAULT_OP_TIMEOUT_MS),
        }
    }

    /// Bound every subsequent operation by `timeout`
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Run store work on the blocking pool, bounded by the operation timeout
    async fn blocking<T, F>(&self, work: F) -> StoreResult<T>
    where
        F: FnOnce(&S) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.store);
        let task = tokio::task::spawn_blocking(move || work(&*store));

        match tokio::time::timeout(self.timeout, task).await {
            Ok(joined) => joined?,
            Err(_) => Err(StoreError::TimedOut(self.timeout)),
        }
    }

    /// Allocate a fresh user id from the store counter
    ///
    /// Ids are unique and increasing but not gap-free: an id whose insert
    /// aborts is never handed out again.
    pub async fn allocate_id(&self) -> Result<i64> {
        self.blocking(|store| store.incr(USER_ID_COUNTER))
            .await
            .map_err(|source| {
                tracing::error!("ID allocation failed: {:?}", source);
                RepoError::IdAllocation {
                    key: USER_ID_COUNTER.to_string(),
                    source,
                }
            })
    }

    /// Insert a new user and return it with its allocated id
    ///
    /// The value write and the index registration commit together or not at
    /// all. The id is allocated before the batch runs, so a failed insert
    /// burns it.
    pub async fn insert(&self, new_user: NewUser) -> Result<User> {
        let id = self.allocate_id().await?;
        let user = new_user.with_id(id);
        let key = user.key();

        let payload = user.encode().map_err(|source| {
            tracing::warn!("Encoding user failed, id {} burned", id);
            RepoError::Encode {
                op: "insert",
                key: key.clone(),
                source,
            }
        })?;

        let batch = Batch::new()
            .set_if_absent(key.clone(), payload)
            .set_add(USER_INDEX_SET, key.clone());

        match self.blocking(move |store| store.exec(batch)).await {
            Ok(_) => {
                tracing::info!("Inserted user {}", key);
                Ok(user)
            }
            Err(source) if source.outcome_unknown() => {
                tracing::warn!("Insert of {} outcome unknown: {}", key, source);
                Err(batch_failed("insert", key, source))
            }
            Err(source) => {
                tracing::warn!("Insert of {} failed, id {} burned", key, id);
                Err(batch_failed("insert", key, source))
            }
        }
    }

    /// Read every indexed user
    ///
    /// Fails as a whole on the first index entry that is missing its value or
    /// cannot be decoded. Order follows the store's set enumeration.
    pub async fn read_all(&self) -> Result<Vec<User>> {
        let entries = self.scan("read_all").await?;

        let mut users = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            let Some(bytes) = value else {
                tracing::warn!("Orphaned index entry: {}", key);
                return Err(RepoError::Orphaned { key });
            };
            let user = User::decode(&bytes).map_err(|source| RepoError::Decode {
                op: "read_all",
                key,
                source,
            })?;
            users.push(user);
        }

        Ok(users)
    }

    /// Read every indexed user, skipping entries that do not resolve
    pub async fn read_all_lenient(&self) -> Result<Listing> {
        let entries = self.scan("read_all_lenient").await?;

        let mut listing = Listing::default();
        for (key, value) in entries {
            match value.map(|bytes| User::decode(&bytes)) {
                Some(Ok(user)) => listing.users.push(user),
                Some(Err(e)) => {
                    tracing::warn!("Skipping undecodable entry {}: {}", key, e);
                    listing.undecodable.push(key);
                }
                None => {
                    tracing::warn!("Skipping orphaned index entry: {}", key);
                    listing.orphaned.push(key);
                }
            }
        }

        if listing.skipped() > 0 {
            tracing::info!(
                "Lenient listing resolved {} users, skipped {}",
                listing.users.len(),
                listing.skipped()
            );
        }

        Ok(listing)
    }

    /// Snapshot the index, then look each member up on its own
    async fn scan(&self, op: &'static str) -> Result<Vec<(String, Option<Vec<u8>>)>> {
        self.blocking(|store| {
            let members = store.set_members(USER_INDEX_SET)?;
            let mut entries = Vec::with_capacity(members.len());
            for key in members {
                let value = store.get(&key)?;
                entries.push((key, value));
            }
            Ok(entries)
        })
        .await
        .map_err(|source| RepoError::unavailable(op, USER_INDEX_SET, source))
    }

    /// Read one user by id
    pub async fn read_by_id(&self, id: i64) -> Result<User> {
        let key = user_key(id);
        let lookup = key.clone();

        let value = self
            .blocking(move |store| store.get(&lookup))
            .await
            .map_err(|source| RepoError::unavailable("read_by_id", key.clone(), source))?;

        let Some(bytes) = value else {
            tracing::debug!("No user stored at {}", key);
            return Err(RepoError::NotFound { key });
        };

        User::decode(&bytes).map_err(|source| RepoError::Decode {
            op: "read_by_id",
            key,
            source,
        })
    }

    /// First user with the given username
    ///
    /// Usernames are not unique at this layer; this scans the strict listing.
    pub async fn find_by_username(&self, username: &str) -> Result<Option<User>> {
        let users = self.read_all().await?;
        Ok(users.into_iter().find(|u| u.username == username))
    }

    /// Replace the stored value of an existing user
    ///
    /// Never creates a user: if nothing is stored under `user.id` the write is
    /// discarded and [`UpdateOutcome::NotFound`] is returned. The index is not
    /// touched.
    pub async fn update(&self, user: User) -> Result<UpdateOutcome> {
        let key = user.key();
        let payload = user.encode().map_err(|source| RepoError::Encode {
            op: "update",
            key: key.clone(),
            source,
        })?;

        let batch = Batch::new().set_if_present(key.clone(), payload);

        match self.blocking(move |store| store.exec(batch)).await {
            Ok(_) => {
                tracing::info!("Updated user {}", key);
                Ok(UpdateOutcome::Updated(user))
            }
            Err(StoreError::ConditionFailed { .. }) => {
                tracing::warn!("Update of missing user {} rejected", key);
                Ok(UpdateOutcome::NotFound)
            }
            Err(source) => Err(batch_failed("update", key, source)),
        }
    }

    /// Record a login at `at` for the given user
    pub async fn touch_login(&self, id: i64, at: DateTime<Utc>) -> Result<UpdateOutcome> {
        let mut user = match self.read_by_id(id).await {
            Ok(user) => user,
            Err(e) if e.is_not_found() => return Ok(UpdateOutcome::NotFound),
            Err(e) => return Err(e),
        };
        user.last_login = at;
        self.update(user).await
    }

    /// Remove a user and its index membership in one atomic batch
    ///
    /// Also clears an index entry left behind without a value. Returns
    /// [`RepoError::NotFound`] when neither existed.
    pub async fn delete(&self, id: i64) -> Result<()> {
        let key = user_key(id);
        let batch = Batch::new()
            .delete(key.clone())
            .set_remove(USER_INDEX_SET, key.clone());

        let changed = self
            .blocking(move |store| store.exec(batch))
            .await
            .map_err(|source| batch_failed("delete", key.clone(), source))?;

        match changed.as_slice() {
            [true, _] => {
                tracing::info!("Deleted user {}", key);
                Ok(())
            }
            [false, true] => {
                tracing::warn!("Removed orphaned index entry {}", key);
                Ok(())
            }
            _ => Err(RepoError::NotFound { key }),
        }
    }

    /// Remove index entries that have no stored value
    ///
    /// Returns the number of entries removed.
    pub async fn prune_orphans(&self) -> Result<usize> {
        let listing = self.read_all_lenient().await?;
        if listing.orphaned.is_empty() {
            return Ok(0);
        }

        let batch = listing
            .orphaned
            .iter()
            .fold(Batch::new(), |batch, key| batch.set_remove(USER_INDEX_SET, key.clone()));

        let changed = self
            .blocking(move |store| store.exec(batch))
            .await
            .map_err(|source| batch_failed("prune_orphans", USER_INDEX_SET, source))?;

        let removed = changed.into_iter().filter(|c| *c).count();
        tracing::info!("Pruned {} orphaned index entries", removed);

        Ok(removed)
    }
}

/// Classify a failed batch. A timeout, lost task or dropped connection leaves
/// the outcome unknown, so only failures the store reported count as aborted.
fn batch_failed(op: &'static str, key: impl Into<String>, source: StoreError) -> RepoError {
    if source.outcome_unknown() {
        RepoError::unavailable(op, key, source)
    } else {
        RepoError::aborted(op, key, source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::store::{MemoryStore, Op};
    use chrono::TimeZone;

    fn repo() -> UserRepository<MemoryStore> {
        UserRepository::new(MemoryStore::new())
    }

    fn new_user(username: &str) -> NewUser {
        let at = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        NewUser::new(username, format!("hash-of-{username}"), at)
    }

    #[tokio::test]
    async fn test_insert_assigns_sequential_ids() {
        let repo = repo();
        let alice = repo.insert(new_user("alice")).await.unwrap();
        let bob = repo.insert(new_user("bob")).await.unwrap();

        assert_eq!(alice.id, 1);
        assert_eq!(bob.id, 2);
        assert_eq!(repo.store().set_members(USER_INDEX_SET).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_id_allocation_failure() {
        let repo = repo();
        repo.store().fail_on(Op::Incr);

        let err = repo.insert(new_user("alice")).await.unwrap_err();
        assert!(matches!(err, RepoError::IdAllocation { .. }));
        assert_eq!(err.kind(), ErrorKind::StoreUnavailable);
    }

    #[tokio::test]
    async fn test_key_collision_aborts_insert() {
        let repo = repo();
        // Occupy the key the counter will hand out next
        repo.store().set("users:1", b"squatter").unwrap();

        let err = repo.insert(new_user("alice")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransactionAborted);
        assert!(repo.store().set_members(USER_INDEX_SET).unwrap().is_empty());

        // The burned id is skipped
        let bob = repo.insert(new_user("bob")).await.unwrap();
        assert_eq!(bob.id, 2);
    }

    #[tokio::test]
    async fn test_delete_reports_missing_user() {
        let repo = repo();
        let err = repo.delete(99).await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(err.key(), "users:99");
    }

    #[tokio::test]
    async fn test_delete_clears_orphaned_entry() {
        let repo = repo();
        repo.store().set_add(USER_INDEX_SET, "users:5").unwrap();

        repo.delete(5).await.unwrap();
        assert!(repo.store().set_members(USER_INDEX_SET).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_touch_login() {
        let repo = repo();
        let alice = repo.insert(new_user("alice")).await.unwrap();
        let later = alice.last_login + chrono::Duration::days(1);

        let outcome = repo.touch_login(alice.id, later).await.unwrap();
        assert!(outcome.is_updated());
        assert_eq!(repo.read_by_id(alice.id).await.unwrap().last_login, later);

        let outcome = repo.touch_login(42, later).await.unwrap();
        assert_eq!(outcome, UpdateOutcome::NotFound);
    }
}
