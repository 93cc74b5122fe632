use std::sync::Arc;
use tracing::warn;

use crate::error::StoreError;
use crate::kv::KvBackend;
use crate::shape::{guarded, ListShape};
use crate::source::SourceId;
use crate::types::EventRecord;

/// Retention cap per source. Older entries are dropped, never archived.
pub const N_MAX: usize = 100;

/// Per-source bounded log, newest first.
///
/// Every write is a single backend transaction (push to head, trim to the
/// cap), so concurrent deliveries for the same source never overwrite each
/// other.
#[derive(Clone)]
pub struct EventLogStore {
    kv: Arc<dyn KvBackend>,
    shape: ListShape,
}

impl EventLogStore {
    pub fn new(kv: Arc<dyn KvBackend>) -> Self {
        Self::with_capacity(kv, N_MAX)
    }

    pub fn with_capacity(kv: Arc<dyn KvBackend>, capacity: usize) -> Self {
        Self {
            kv,
            shape: ListShape {
                capacity: capacity.max(1),
            },
        }
    }

    pub fn capacity(&self) -> usize {
        self.shape.capacity
    }

    pub async fn append(&self, source: &SourceId, record: &EventRecord) -> Result<(), StoreError> {
        let key = source.log_key();
        let value = serde_json::to_string(record)?;
        let capacity = self.shape.capacity;
        guarded(&self.shape, self.kv.as_ref(), &key, || {
            self.kv.lpush_capped(&key, &value, capacity)
        })
        .await
    }

    /// Up to `limit` records from the current head. A source with no log
    /// reads as empty; undecodable entries come back as placeholders.
    pub async fn read(&self, source: &SourceId, limit: usize) -> Result<Vec<EventRecord>, StoreError> {
        let limit = limit.min(self.shape.capacity);
        if limit == 0 {
            return Ok(Vec::new());
        }

        let key = source.log_key();
        let stop = limit as i64 - 1;
        let raw = match guarded(&self.shape, self.kv.as_ref(), &key, || {
            self.kv.lrange(&key, 0, stop)
        })
        .await
        {
            Ok(raw) => raw,
            Err(StoreError::ShapeMismatch { .. }) => {
                warn!(key = %key, "log still has the wrong shape, reading as empty");
                Vec::new()
            }
            Err(e) => return Err(e),
        };

        Ok(raw
            .iter()
            .enumerate()
            .map(|(index, entry)| {
                EventRecord::decode(entry, source.as_str()).unwrap_or_else(|e| {
                    warn!(source_id = %source, index, error = %e, "corrupt log entry");
                    EventRecord::placeholder(source.as_str(), index, &e.to_string())
                })
            })
            .collect())
    }

    pub async fn count(&self, source: &SourceId) -> Result<usize, StoreError> {
        let key = source.log_key();
        match guarded(&self.shape, self.kv.as_ref(), &key, || self.kv.llen(&key)).await {
            Err(StoreError::ShapeMismatch { .. }) => Ok(0),
            other => other,
        }
    }

    /// Most recent record, if any.
    pub async fn head(&self, source: &SourceId) -> Result<Option<EventRecord>, StoreError> {
        Ok(self.read(source, 1).await?.into_iter().next())
    }
}
