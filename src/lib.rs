//! Indexed user repository over a key-value store
//!
//! This module exports the core types and functions for testing and reuse.

pub mod config;
pub mod constants;
pub mod error;
pub mod models;
pub mod repo;
pub mod store;

pub use config::{Config, StoreBackend};
pub use error::{ErrorKind, RepoError, Result};
pub use models::{NewUser, User};
pub use repo::{Listing, UpdateOutcome, UserRepository};
pub use store::{KvStore, MemoryStore, RedbStore, RedisStore};
