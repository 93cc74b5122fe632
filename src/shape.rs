//! Self-healing of keys written by older generations of the receiver.
//!
//! Before the current list/set layout, logs and the registry were stored as a
//! single string holding a JSON array. A guard probes the key before every
//! store operation and converts such keys in place.
//!
//! Conversion claims the key with an atomic `RENAME` to a unique side key, so
//! when several requests race only one of them converts; the others find the
//! key absent or already in the expected shape and do nothing.
//!
//! Every claim is recorded in [`PENDING_KEY`] before the rename and removed
//! once its entries are back under the original key. A conversion that fails
//! releases its claim, and the next guard run for that key resumes it. A claim
//! whose owner vanished mid-conversion becomes resumable after
//! [`CLAIM_LEASE_MS`].

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::future::Future;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::StoreError;
use crate::kv::{KeyType, KvBackend};

/// Set of in-flight claims, as `{claimed_at_millis}|{claim_key}`. Not under
/// the `webhook:` prefix, so no source id maps onto it.
pub const PENDING_KEY: &str = "webhook-legacy:pending";

/// How long a claim belongs to the request that made it.
pub const CLAIM_LEASE_MS: i64 = 60_000;

const CLAIM_INFIX: &str = ":legacy:";

/// What a migration attempt did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Migration {
    /// The key was absent or already in the expected shape.
    NotNeeded,
    /// Legacy entries were re-inserted under the original key.
    Migrated { entries: usize },
    /// The legacy value could not be converted and was moved aside.
    Parked { parked_at: String },
}

impl Migration {
    fn merge(self, next: Migration) -> Migration {
        match (self, next) {
            (Self::Migrated { entries: a }, Self::Migrated { entries: b }) => {
                Self::Migrated { entries: a + b }
            }
            (done, Self::NotNeeded) => done,
            (_, next) => next,
        }
    }
}

#[async_trait]
pub trait ShapeGuard: Send + Sync {
    fn expected_shape(&self) -> KeyType;

    /// Put claimed legacy entries back under `key` in the expected shape.
    /// Returns how many were kept.
    async fn reinsert(
        &self,
        kv: &dyn KvBackend,
        key: &str,
        entries: Vec<String>,
    ) -> Result<usize, StoreError>;

    async fn migrate_if_needed(
        &self,
        kv: &dyn KvBackend,
        key: &str,
    ) -> Result<Migration, StoreError> {
        migrate(self, kv, key).await
    }
}

/// Per-source logs: newest-first list capped at `capacity`.
#[derive(Debug, Clone, Copy)]
pub struct ListShape {
    pub capacity: usize,
}

/// The source registry: a set of ids.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetShape;

/// A side key this request owns, with its entry in [`PENDING_KEY`].
#[derive(Debug)]
struct Claim {
    key: String,
    member: String,
}

enum Legacy {
    Gone,
    Unconvertible,
    Entries(Vec<String>),
}

fn pending_member(claim_key: &str, claimed_at: i64) -> String {
    format!("{claimed_at}|{claim_key}")
}

/// Split a pending member into claim time, claim key and original key.
fn parse_member(member: &str) -> Option<(i64, &str, &str)> {
    let (claimed_at, claim_key) = member.split_once('|')?;
    let (origin, _) = claim_key.rsplit_once(CLAIM_INFIX)?;
    Some((claimed_at.parse().ok()?, claim_key, origin))
}

/// Move `from` under a fresh claim key for `origin`. `None` when `from` no
/// longer exists, i.e. another request got there first.
async fn take(kv: &dyn KvBackend, origin: &str, from: &str) -> Result<Option<Claim>, StoreError> {
    let key = format!("{origin}{CLAIM_INFIX}{}", Uuid::new_v4().simple());
    let member = pending_member(&key, Utc::now().timestamp_millis());
    kv.sadd(PENDING_KEY, std::slice::from_ref(&member)).await?;
    if kv.rename(from, &key).await? {
        Ok(Some(Claim { key, member }))
    } else {
        kv.srem(PENDING_KEY, &[member]).await?;
        Ok(None)
    }
}

/// Claims for `key` that nobody is working on: released ones and ones whose
/// lease ran out.
async fn resumable(kv: &dyn KvBackend, key: &str) -> Result<Vec<(String, String)>, StoreError> {
    let now = Utc::now().timestamp_millis();
    Ok(kv
        .smembers(PENDING_KEY)
        .await?
        .into_iter()
        .filter_map(|member| {
            let claim_key = match parse_member(&member) {
                Some((claimed_at, claim_key, origin))
                    if origin == key && now - claimed_at >= CLAIM_LEASE_MS =>
                {
                    claim_key.to_string()
                }
                _ => return None,
            };
            Some((member, claim_key))
        })
        .collect())
}

async fn read_legacy(kv: &dyn KvBackend, claim_key: &str) -> Result<Legacy, StoreError> {
    Ok(match kv.key_type(claim_key).await? {
        KeyType::None => Legacy::Gone,
        KeyType::String => match kv.get(claim_key).await?.as_deref().and_then(parse_blob) {
            Some(entries) => Legacy::Entries(entries),
            None => Legacy::Unconvertible,
        },
        KeyType::List => Legacy::Entries(kv.lrange(claim_key, 0, -1).await?),
        KeyType::Set => Legacy::Entries(kv.smembers(claim_key).await?),
        KeyType::Other(_) => Legacy::Unconvertible,
    })
}

/// A legacy blob is a JSON array; elements are kept as stored strings, or
/// re-serialized when they were embedded as objects.
fn parse_blob(blob: &str) -> Option<Vec<String>> {
    match serde_json::from_str::<Value>(blob).ok()? {
        Value::Array(items) => Some(
            items
                .into_iter()
                .map(|item| match item {
                    Value::String(s) => s,
                    other => other.to_string(),
                })
                .collect(),
        ),
        _ => None,
    }
}

/// Hand a claim back for immediate resumption. If even that fails, the claim
/// is picked up once its lease expires.
async fn release(kv: &dyn KvBackend, claim: &Claim) {
    let released = pending_member(&claim.key, 0);
    let result: Result<usize, StoreError> = async {
        kv.sadd(PENDING_KEY, &[released]).await?;
        kv.srem(PENDING_KEY, std::slice::from_ref(&claim.member))
            .await
    }
    .await;
    if let Err(e) = result {
        warn!(claimed = %claim.key, error = %e, "failed to release legacy claim");
    }
}

async fn convert<G: ShapeGuard + ?Sized>(
    guard: &G,
    kv: &dyn KvBackend,
    key: &str,
    claim: Claim,
) -> Result<Migration, StoreError> {
    let result: Result<Migration, StoreError> = async {
        match read_legacy(kv, &claim.key).await? {
            Legacy::Gone => Ok(Migration::NotNeeded),
            Legacy::Unconvertible => {
                warn!(key, parked_at = %claim.key, "legacy value is not convertible, left parked");
                Ok(Migration::Parked {
                    parked_at: claim.key.clone(),
                })
            }
            Legacy::Entries(entries) => {
                let entries = guard.reinsert(kv, key, entries).await?;
                kv.del(&claim.key).await?;
                Ok(Migration::Migrated { entries })
            }
        }
    }
    .await;

    match result {
        Ok(outcome) => {
            kv.srem(PENDING_KEY, &[claim.member]).await?;
            Ok(outcome)
        }
        Err(e) => {
            release(kv, &claim).await;
            Err(e)
        }
    }
}

async fn migrate<G: ShapeGuard + ?Sized>(
    guard: &G,
    kv: &dyn KvBackend,
    key: &str,
) -> Result<Migration, StoreError> {
    let mut outcome = Migration::NotNeeded;

    for (member, claim_key) in resumable(kv, key).await? {
        warn!(key, claimed = %claim_key, "resuming interrupted legacy migration");
        let claim = take(kv, key, &claim_key).await?;
        kv.srem(PENDING_KEY, &[member]).await?;
        if let Some(claim) = claim {
            outcome = outcome.merge(convert(guard, kv, key, claim).await?);
        }
    }

    let found = kv.key_type(key).await?;
    let expected = guard.expected_shape();
    if found == KeyType::None || found == expected {
        return Ok(outcome);
    }
    let Some(claim) = take(kv, key, key).await? else {
        return Ok(outcome);
    };
    warn!(key, found = %found, expected = %expected, claimed = %claim.key, "legacy key shape detected");
    Ok(outcome.merge(convert(guard, kv, key, claim).await?))
}

#[async_trait]
impl ShapeGuard for ListShape {
    fn expected_shape(&self) -> KeyType {
        KeyType::List
    }

    async fn reinsert(
        &self,
        kv: &dyn KvBackend,
        key: &str,
        mut entries: Vec<String>,
    ) -> Result<usize, StoreError> {
        // Legacy entries are older than anything pushed since the claim, so
        // they go to the tail in their stored (newest-first) order.
        entries.truncate(self.capacity);
        kv.rpush(key, &entries).await?;
        // The next capped push trims as well.
        if let Err(e) = kv.ltrim(key, 0, self.capacity as i64 - 1).await {
            warn!(key, error = %e, "trim after migration failed");
        }
        info!(key, entries = entries.len(), "migrated legacy log to list");
        Ok(entries.len())
    }
}

#[async_trait]
impl ShapeGuard for SetShape {
    fn expected_shape(&self) -> KeyType {
        KeyType::Set
    }

    async fn reinsert(
        &self,
        kv: &dyn KvBackend,
        key: &str,
        entries: Vec<String>,
    ) -> Result<usize, StoreError> {
        kv.sadd(key, &entries).await?;
        info!(key, entries = entries.len(), "migrated legacy registry to set");
        Ok(entries.len())
    }
}

/// Run the guard, logging instead of failing: a key that cannot be healed
/// is treated as empty by the operation that follows.
pub async fn heal(guard: &dyn ShapeGuard, kv: &dyn KvBackend, key: &str) {
    if let Err(e) = guard.migrate_if_needed(kv, key).await {
        warn!(key, error = %e, "shape migration failed");
    }
}

/// Heal `key`, run `op`, and if the backend still reports a type error (a
/// legacy writer raced the probe) heal once more and retry.
pub async fn guarded<T, F, Fut>(
    guard: &dyn ShapeGuard,
    kv: &dyn KvBackend,
    key: &str,
    op: F,
) -> Result<T, StoreError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    heal(guard, kv, key).await;
    match op().await {
        Err(StoreError::ShapeMismatch { .. }) => {
            heal(guard, kv, key).await;
            op().await
        }
        other => other,
    }
}
