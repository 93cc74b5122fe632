use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use super::{KeyType, KvBackend, MemoryBackend};
use crate::error::StoreError;

/// Number of failures meaning "fail every call".
pub(crate) const FAIL_ALWAYS: u32 = u32::MAX;

/// A [`MemoryBackend`] whose named commands fail with a transient error a
/// given number of times before going through.
#[derive(Default)]
pub(crate) struct FaultyBackend {
    inner: MemoryBackend,
    faults: Mutex<HashMap<&'static str, u32>>,
}

impl FaultyBackend {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn fail(self, command: &'static str, times: u32) -> Self {
        self.faults
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(command, times);
        self
    }

    pub(crate) fn inner(&self) -> &MemoryBackend {
        &self.inner
    }

    fn check(&self, command: &'static str) -> Result<(), StoreError> {
        let mut faults = self.faults.lock().unwrap_or_else(|e| e.into_inner());
        match faults.get_mut(command) {
            Some(0) | None => Ok(()),
            Some(left) => {
                if *left != FAIL_ALWAYS {
                    *left -= 1;
                }
                Err(StoreError::unavailable(format!("{command} timed out")))
            }
        }
    }
}

#[async_trait]
impl KvBackend for FaultyBackend {
    async fn key_type(&self, key: &str) -> Result<KeyType, StoreError> {
        self.check("TYPE")?;
        self.inner.key_type(key).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check("GET")?;
        self.inner.get(key).await
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        self.check("DEL")?;
        self.inner.del(key).await
    }

    async fn rename(&self, from: &str, to: &str) -> Result<bool, StoreError> {
        self.check("RENAME")?;
        self.inner.rename(from, to).await
    }

    async fn lpush_capped(
        &self,
        key: &str,
        value: &str,
        max_len: usize,
    ) -> Result<(), StoreError> {
        self.check("LPUSH")?;
        self.inner.lpush_capped(key, value, max_len).await
    }

    async fn rpush(&self, key: &str, values: &[String]) -> Result<usize, StoreError> {
        self.check("RPUSH")?;
        self.inner.rpush(key, values).await
    }

    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> Result<(), StoreError> {
        self.check("LTRIM")?;
        self.inner.ltrim(key, start, stop).await
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, StoreError> {
        self.check("LRANGE")?;
        self.inner.lrange(key, start, stop).await
    }

    async fn llen(&self, key: &str) -> Result<usize, StoreError> {
        self.check("LLEN")?;
        self.inner.llen(key).await
    }

    async fn sadd(&self, key: &str, members: &[String]) -> Result<usize, StoreError> {
        self.check("SADD")?;
        self.inner.sadd(key, members).await
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.check("SMEMBERS")?;
        self.inner.smembers(key).await
    }

    async fn srem(&self, key: &str, members: &[String]) -> Result<usize, StoreError> {
        self.check("SREM")?;
        self.inner.srem(key, members).await
    }
}
