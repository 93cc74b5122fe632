//! Key-value backend abstraction.
//!
//! The store only relies on primitives a Redis-compatible backend executes
//! atomically: list push/trim/range/length, set add/members, and key probing.

#[cfg(test)]
mod faulty;
mod memory;
mod rest;

#[cfg(test)]
pub(crate) use faulty::{FaultyBackend, FAIL_ALWAYS};

pub use memory::MemoryBackend;
pub use rest::RestBackend;

use async_trait::async_trait;
use std::fmt;

use crate::error::StoreError;

/// Storage type of a key as reported by `TYPE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyType {
    None,
    String,
    List,
    Set,
    Other(String),
}

impl KeyType {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "none" => Self::None,
            "string" => Self::String,
            "list" => Self::List,
            "set" => Self::Set,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::None => "none",
            Self::String => "string",
            Self::List => "list",
            Self::Set => "set",
            Self::Other(raw) => raw,
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn key_type(&self, key: &str) -> Result<KeyType, StoreError>;
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn del(&self, key: &str) -> Result<(), StoreError>;
    /// Rename `from` to `to`. Returns `false` when `from` does not exist.
    async fn rename(&self, from: &str, to: &str) -> Result<bool, StoreError>;

    /// Prepend one value and trim the list to `max_len`, as one transaction.
    async fn lpush_capped(&self, key: &str, value: &str, max_len: usize)
        -> Result<(), StoreError>;
    /// Append values to the tail in order. Returns the new length.
    async fn rpush(&self, key: &str, values: &[String]) -> Result<usize, StoreError>;
    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> Result<(), StoreError>;
    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, StoreError>;
    async fn llen(&self, key: &str) -> Result<usize, StoreError>;

    /// Add members to a set. Returns how many were newly added.
    async fn sadd(&self, key: &str, members: &[String]) -> Result<usize, StoreError>;
    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError>;
    /// Remove members from a set. Returns how many were present.
    async fn srem(&self, key: &str, members: &[String]) -> Result<usize, StoreError>;
}
