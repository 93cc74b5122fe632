//! Delivery ingestion: accept (build the record and acknowledgment), then
//! commit (append to the log, register the source).
//!
//! The sender always gets a success acknowledgment. The upstream platform
//! treats failure statuses as a reason to redeliver, so persistence failures
//! are reported in the body and logged instead.

use chrono::Utc;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::StoreError;
use crate::retry::RetryPolicy;
use crate::source::SourceId;
use crate::state::Storage;
use crate::types::{EventRecord, IngestAck, TransportMeta};

pub const NOTE_NOT_CONFIGURED: &str = "Database not configured";
pub const NOTE_FAILED: &str = "Failed to save";
pub const NOTE_INVALID_SOURCE: &str = "Invalid source, not persisted";
pub const NOTE_BODY_REJECTED: &str = "Payload rejected, not persisted";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum CommitMode {
    /// Commit before answering; the acknowledgment reports the outcome.
    #[default]
    Inline,
    /// Answer first, commit on a spawned task.
    Background,
}

/// An inbound delivery, already detached from the HTTP request.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub source: SourceId,
    pub method: String,
    pub payload: Value,
    pub transport_meta: TransportMeta,
}

#[derive(Debug, Clone)]
pub struct Accepted {
    pub record: EventRecord,
    pub ack: IngestAck,
}

/// Result of [`Ingestor::ingest`]. `pending` is set in background mode and
/// resolves once the commit finished.
pub struct Ingested {
    pub ack: IngestAck,
    pub pending: Option<JoinHandle<Result<(), StoreError>>>,
}

#[derive(Clone)]
pub struct Ingestor {
    storage: Option<Storage>,
    retry: RetryPolicy,
    mode: CommitMode,
}

pub fn new_event_id() -> String {
    // UUIDv7: millisecond timestamp prefix, random tail.
    format!("evt_{}", Uuid::now_v7().simple())
}

impl Ingestor {
    pub fn new(storage: Option<Storage>, retry: RetryPolicy, mode: CommitMode) -> Self {
        Self {
            storage,
            retry,
            mode,
        }
    }

    pub fn storage(&self) -> Option<&Storage> {
        self.storage.as_ref()
    }

    /// Build the record and the acknowledgment. No I/O.
    pub fn accept(&self, delivery: Delivery) -> Accepted {
        let record = EventRecord {
            id: new_event_id(),
            source_id: delivery.source.as_str().to_string(),
            received_at: Utc::now(),
            method: delivery.method,
            payload: delivery.payload,
            transport_meta: delivery.transport_meta,
            diagnostic: None,
        };
        let ack = IngestAck {
            status: "ok".to_string(),
            endpoint: record.source_id.clone(),
            received_at: record.received_at,
            event_id: Some(record.id.clone()),
            note: None,
            error: None,
        };
        Accepted { record, ack }
    }

    pub async fn ingest(&self, delivery: Delivery) -> Ingested {
        let source = delivery.source.clone();
        let Accepted { record, mut ack } = self.accept(delivery);

        let Some(storage) = self.storage.clone() else {
            warn!(source_id = %source, "backend not configured, event not persisted");
            ack.event_id = None;
            ack.note = Some(NOTE_NOT_CONFIGURED.to_string());
            return Ingested { ack, pending: None };
        };

        match self.mode {
            CommitMode::Inline => {
                if let Err(e) = commit(&storage, &self.retry, &source, &record).await {
                    ack.note = Some(NOTE_FAILED.to_string());
                    ack.error = Some(e.to_string());
                }
                Ingested { ack, pending: None }
            }
            CommitMode::Background => {
                let retry = self.retry;
                let pending = tokio::spawn(async move {
                    commit(&storage, &retry, &source, &record).await
                });
                Ingested {
                    ack,
                    pending: Some(pending),
                }
            }
        }
    }
}

/// Acknowledgment for a delivery that is answered but never reaches storage,
/// e.g. an unaddressable source or an unreadable body.
pub fn not_persisted(endpoint: &str, note: &str, error: String) -> IngestAck {
    IngestAck {
        status: "ok".to_string(),
        endpoint: endpoint.to_string(),
        received_at: Utc::now(),
        event_id: None,
        note: Some(note.to_string()),
        error: Some(error),
    }
}

/// Append then register, each retried on transient failures. The source is
/// only registered once its event is stored.
pub async fn commit(
    storage: &Storage,
    retry: &RetryPolicy,
    source: &SourceId,
    record: &EventRecord,
) -> Result<(), StoreError> {
    let result = async {
        retry
            .run("append", || storage.log.append(source, record))
            .await?;
        retry
            .run("register", || storage.registry.register(source))
            .await
    }
    .await;

    match &result {
        Ok(()) => info!(source_id = %source, event_id = %record.id, "event stored"),
        Err(e) => error!(source_id = %source, event_id = %record.id, error = %e, "failed to store event"),
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{FaultyBackend, KeyType, KvBackend, MemoryBackend, FAIL_ALWAYS};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    /// Fails every call with a transient error.
    struct DownBackend {
        calls: AtomicU32,
    }

    impl DownBackend {
        fn fail(&self) -> StoreError {
            self.calls.fetch_add(1, Ordering::SeqCst);
            StoreError::unavailable("connection refused")
        }
    }

    #[async_trait]
    impl KvBackend for DownBackend {
        async fn key_type(&self, _: &str) -> Result<KeyType, StoreError> {
            Err(self.fail())
        }
        async fn get(&self, _: &str) -> Result<Option<String>, StoreError> {
            Err(self.fail())
        }
        async fn del(&self, _: &str) -> Result<(), StoreError> {
            Err(self.fail())
        }
        async fn rename(&self, _: &str, _: &str) -> Result<bool, StoreError> {
            Err(self.fail())
        }
        async fn lpush_capped(&self, _: &str, _: &str, _: usize) -> Result<(), StoreError> {
            Err(self.fail())
        }
        async fn rpush(&self, _: &str, _: &[String]) -> Result<usize, StoreError> {
            Err(self.fail())
        }
        async fn ltrim(&self, _: &str, _: i64, _: i64) -> Result<(), StoreError> {
            Err(self.fail())
        }
        async fn lrange(&self, _: &str, _: i64, _: i64) -> Result<Vec<String>, StoreError> {
            Err(self.fail())
        }
        async fn llen(&self, _: &str) -> Result<usize, StoreError> {
            Err(self.fail())
        }
        async fn sadd(&self, _: &str, _: &[String]) -> Result<usize, StoreError> {
            Err(self.fail())
        }
        async fn smembers(&self, _: &str) -> Result<Vec<String>, StoreError> {
            Err(self.fail())
        }
        async fn srem(&self, _: &str, _: &[String]) -> Result<usize, StoreError> {
            Err(self.fail())
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 2,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        }
    }

    fn delivery(source: &str, payload: Value) -> Delivery {
        Delivery {
            source: SourceId::parse(source).unwrap(),
            method: "POST".to_string(),
            payload,
            transport_meta: TransportMeta::default(),
        }
    }

    #[test]
    fn event_ids_are_unique_and_prefixed() {
        let a = new_event_id();
        let b = new_event_id();
        assert!(a.starts_with("evt_"));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn inline_commit_stores_and_registers() {
        let storage = Storage::new(Arc::new(MemoryBackend::new()));
        let ingestor = Ingestor::new(Some(storage.clone()), fast_retry(), CommitMode::Inline);

        let out = ingestor
            .ingest(delivery("orders", json!({"event_name": "order.created"})))
            .await;
        assert!(out.pending.is_none());
        assert_eq!(out.ack.status, "ok");
        assert_eq!(out.ack.endpoint, "orders");
        assert!(out.ack.error.is_none());

        let source = SourceId::parse("orders").unwrap();
        let page = storage.log.read(&source, 100).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(Some(page[0].id.clone()), out.ack.event_id);
        assert!(storage.registry.list().await.unwrap().contains("orders"));
    }

    #[tokio::test]
    async fn inline_failure_still_acknowledges() {
        let kv = Arc::new(DownBackend {
            calls: AtomicU32::new(0),
        });
        let storage = Storage::new(kv.clone());
        let ingestor = Ingestor::new(Some(storage), fast_retry(), CommitMode::Inline);

        let out = ingestor.ingest(delivery("orders", json!({}))).await;
        assert_eq!(out.ack.status, "ok");
        assert_eq!(out.ack.note.as_deref(), Some(NOTE_FAILED));
        assert!(out.ack.error.unwrap().contains("connection refused"));
        // The append was attempted once per retry; register never ran.
        assert!(kv.calls.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn failed_shape_probe_does_not_block_the_write() {
        let kv = Arc::new(
            FaultyBackend::new()
                .fail("TYPE", FAIL_ALWAYS)
                .fail("RENAME", FAIL_ALWAYS),
        );
        let storage = Storage::new(kv);
        let ingestor = Ingestor::new(Some(storage.clone()), fast_retry(), CommitMode::Inline);

        let out = ingestor.ingest(delivery("orders", json!({"n": 1}))).await;
        assert!(out.ack.error.is_none());
        assert!(out.ack.note.is_none());

        let source = SourceId::parse("orders").unwrap();
        let page = storage.log.read(&source, 100).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(Some(page[0].id.clone()), out.ack.event_id);
        assert!(storage.registry.list().await.unwrap().contains("orders"));
    }

    #[tokio::test]
    async fn background_commit_failure_after_acknowledgment() {
        let kv = Arc::new(DownBackend {
            calls: AtomicU32::new(0),
        });
        let ingestor = Ingestor::new(
            Some(Storage::new(kv)),
            fast_retry(),
            CommitMode::Background,
        );

        let out = ingestor.ingest(delivery("orders", json!({"n": 1}))).await;
        assert_eq!(out.ack.status, "ok");
        assert!(out.ack.event_id.is_some());
        assert!(out.ack.error.is_none());

        let commit = out.pending.expect("background commit").await.unwrap();
        assert!(matches!(commit, Err(StoreError::BackendUnavailable { .. })));
    }

    #[tokio::test]
    async fn background_commit_eventually_stores() {
        let storage = Storage::new(Arc::new(MemoryBackend::new()));
        let ingestor = Ingestor::new(Some(storage.clone()), fast_retry(), CommitMode::Background);

        let out = ingestor.ingest(delivery("orders", json!({"n": 1}))).await;
        out.pending.unwrap().await.unwrap().unwrap();

        let source = SourceId::parse("orders").unwrap();
        assert_eq!(storage.log.count(&source).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn missing_storage_acknowledges_with_note() {
        let ingestor = Ingestor::new(None, fast_retry(), CommitMode::Inline);
        let out = ingestor.ingest(delivery("orders", json!({}))).await;
        assert_eq!(out.ack.status, "ok");
        assert_eq!(out.ack.note.as_deref(), Some(NOTE_NOT_CONFIGURED));
        assert!(out.ack.event_id.is_none());
    }
}
