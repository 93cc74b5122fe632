use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Mutex;

use super::{KeyType, KvBackend};
use crate::error::StoreError;

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    List(VecDeque<String>),
    Set(BTreeSet<String>),
}

/// In-process backend with Redis semantics for the commands the store uses:
/// type errors on mismatched keys, and lists/sets vanish once empty.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    data: Mutex<HashMap<String, Value>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a plain string value, as older writers did with `SET`.
    pub fn set_string(&self, key: &str, value: impl Into<String>) {
        self.lock()
            .insert(key.to_string(), Value::Str(value.into()));
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Value>> {
        // A poisoned map is still structurally valid.
        self.data.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::ShapeMismatch {
        key: key.to_string(),
    }
}

/// Resolve Redis-style inclusive range bounds against a length.
fn range_bounds(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    let len = len as i64;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len {
        None
    } else {
        Some((start as usize, stop as usize))
    }
}

fn trim_list(list: &mut VecDeque<String>, start: i64, stop: i64) {
    match range_bounds(list.len(), start, stop) {
        Some((from, to)) => {
            list.truncate(to + 1);
            list.drain(..from);
        }
        None => list.clear(),
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn key_type(&self, key: &str) -> Result<KeyType, StoreError> {
        Ok(match self.lock().get(key) {
            None => KeyType::None,
            Some(Value::Str(_)) => KeyType::String,
            Some(Value::List(_)) => KeyType::List,
            Some(Value::Set(_)) => KeyType::Set,
        })
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match self.lock().get(key) {
            None => Ok(None),
            Some(Value::Str(s)) => Ok(Some(s.clone())),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        self.lock().remove(key);
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<bool, StoreError> {
        let mut data = self.lock();
        match data.remove(from) {
            Some(value) => {
                data.insert(to.to_string(), value);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn lpush_capped(
        &self,
        key: &str,
        value: &str,
        max_len: usize,
    ) -> Result<(), StoreError> {
        let mut data = self.lock();
        let entry = data
            .entry(key.to_string())
            .or_insert_with(|| Value::List(VecDeque::new()));
        match entry {
            Value::List(list) => {
                list.push_front(value.to_string());
                list.truncate(max_len.max(1));
                Ok(())
            }
            _ => Err(wrong_type(key)),
        }
    }

    async fn rpush(&self, key: &str, values: &[String]) -> Result<usize, StoreError> {
        let mut data = self.lock();
        if values.is_empty() {
            return match data.get(key) {
                None => Ok(0),
                Some(Value::List(list)) => Ok(list.len()),
                Some(_) => Err(wrong_type(key)),
            };
        }
        let entry = data
            .entry(key.to_string())
            .or_insert_with(|| Value::List(VecDeque::new()));
        match entry {
            Value::List(list) => {
                list.extend(values.iter().cloned());
                Ok(list.len())
            }
            _ => Err(wrong_type(key)),
        }
    }

    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> Result<(), StoreError> {
        let mut data = self.lock();
        let emptied = match data.get_mut(key) {
            None => return Ok(()),
            Some(Value::List(list)) => {
                trim_list(list, start, stop);
                list.is_empty()
            }
            Some(_) => return Err(wrong_type(key)),
        };
        if emptied {
            data.remove(key);
        }
        Ok(())
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, StoreError> {
        match self.lock().get(key) {
            None => Ok(Vec::new()),
            Some(Value::List(list)) => Ok(match range_bounds(list.len(), start, stop) {
                Some((from, to)) => list.range(from..=to).cloned().collect(),
                None => Vec::new(),
            }),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn llen(&self, key: &str) -> Result<usize, StoreError> {
        match self.lock().get(key) {
            None => Ok(0),
            Some(Value::List(list)) => Ok(list.len()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn sadd(&self, key: &str, members: &[String]) -> Result<usize, StoreError> {
        let mut data = self.lock();
        if members.is_empty() {
            return Ok(0);
        }
        let entry = data
            .entry(key.to_string())
            .or_insert_with(|| Value::Set(BTreeSet::new()));
        match entry {
            Value::Set(set) => Ok(members
                .iter()
                .filter(|m| set.insert((*m).clone()))
                .count()),
            _ => Err(wrong_type(key)),
        }
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        match self.lock().get(key) {
            None => Ok(Vec::new()),
            Some(Value::Set(set)) => Ok(set.iter().cloned().collect()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn srem(&self, key: &str, members: &[String]) -> Result<usize, StoreError> {
        let mut data = self.lock();
        let (removed, emptied) = match data.get_mut(key) {
            None => return Ok(0),
            Some(Value::Set(set)) => {
                let removed = members.iter().filter(|m| set.remove(m.as_str())).count();
                (removed, set.is_empty())
            }
            Some(_) => return Err(wrong_type(key)),
        };
        if emptied {
            data.remove(key);
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn lpush_capped_keeps_newest_at_head() {
        let kv = MemoryBackend::new();
        for v in ["a", "b", "c", "d"] {
            kv.lpush_capped("k", v, 3).await.unwrap();
        }
        assert_eq!(kv.lrange("k", 0, -1).await.unwrap(), strings(&["d", "c", "b"]));
        assert_eq!(kv.llen("k").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn list_commands_on_a_string_key_fail_with_wrong_type() {
        let kv = MemoryBackend::new();
        kv.set_string("k", "[]");
        assert_eq!(kv.key_type("k").await.unwrap(), KeyType::String);
        let err = kv.lpush_capped("k", "x", 10).await.unwrap_err();
        assert!(matches!(err, StoreError::ShapeMismatch { .. }));
        assert!(kv.lrange("k", 0, -1).await.is_err());
    }

    #[tokio::test]
    async fn ranges_follow_redis_bounds() {
        let kv = MemoryBackend::new();
        kv.rpush("k", &strings(&["a", "b", "c", "d", "e"])).await.unwrap();
        assert_eq!(kv.lrange("k", 1, 2).await.unwrap(), strings(&["b", "c"]));
        assert_eq!(kv.lrange("k", -2, -1).await.unwrap(), strings(&["d", "e"]));
        assert_eq!(kv.lrange("k", 3, 100).await.unwrap(), strings(&["d", "e"]));
        assert!(kv.lrange("k", 7, 9).await.unwrap().is_empty());

        kv.ltrim("k", 5, 9).await.unwrap();
        assert_eq!(kv.key_type("k").await.unwrap(), KeyType::None);
    }

    #[tokio::test]
    async fn rename_reports_missing_source() {
        let kv = MemoryBackend::new();
        kv.set_string("a", "1");
        assert!(kv.rename("a", "b").await.unwrap());
        assert!(!kv.rename("a", "c").await.unwrap());
        assert_eq!(kv.get("b").await.unwrap().as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn sadd_counts_only_new_members() {
        let kv = MemoryBackend::new();
        assert_eq!(kv.sadd("s", &strings(&["x", "y"])).await.unwrap(), 2);
        assert_eq!(kv.sadd("s", &strings(&["y", "z"])).await.unwrap(), 1);
        assert_eq!(kv.smembers("s").await.unwrap(), strings(&["x", "y", "z"]));
    }

    #[tokio::test]
    async fn srem_drops_empty_sets() {
        let kv = MemoryBackend::new();
        kv.sadd("s", &strings(&["x", "y"])).await.unwrap();
        assert_eq!(kv.srem("s", &strings(&["x", "nope"])).await.unwrap(), 1);
        assert_eq!(kv.srem("s", &strings(&["y"])).await.unwrap(), 1);
        assert_eq!(kv.key_type("s").await.unwrap(), KeyType::None);
        assert_eq!(kv.srem("s", &strings(&["y"])).await.unwrap(), 0);
    }
}
