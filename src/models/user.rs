use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::USER_KEY_PREFIX;

const BINCODE_CONFIG: bincode::config::Configuration = bincode::config::standard();

/// User fields supplied by the caller on insert
///
/// Carries no id: ids are only ever allocated by the repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewUser {
    pub username: String,
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
    pub last_login: DateTime<Utc>,
}

impl NewUser {
    /// New user whose creation and last login are both `now`
    pub fn new(
        username: impl Into<String>,
        password_hash: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            username: username.into(),
            password_hash: password_hash.into(),
            created_at: now,
            last_login: now,
        }
    }

    /// Decorate with the id allocated by the repository
    pub fn with_id(self, id: i64) -> User {
        User {
            id,
            username: self.username,
            password_hash: self.password_hash,
            created_at: self.created_at,
            last_login: self.last_login,
        }
    }
}

/// Stored user record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
    pub last_login: DateTime<Utc>,
}

impl User {
    /// Storage key of this user
    pub fn key(&self) -> String {
        user_key(self.id)
    }

    /// Serialize to the opaque payload stored under [`User::key`]
    pub fn encode(&self) -> Result<Vec<u8>, bincode::error::EncodeError> {
        bincode::serde::encode_to_vec(self, BINCODE_CONFIG)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::error::DecodeError> {
        let (user, _): (User, _) = bincode::serde::decode_from_slice(bytes, BINCODE_CONFIG)?;
        Ok(user)
    }
}

/// Derive the storage key for a user id
pub fn user_key(id: i64) -> String {
    format!("{USER_KEY_PREFIX}{id}")
}
