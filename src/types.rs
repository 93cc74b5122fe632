use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Request metadata kept alongside a delivery, informational only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransportMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

/// One stored webhook delivery. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: String,
    pub source_id: String,
    pub received_at: DateTime<Utc>,
    pub method: String,
    pub payload: Value,
    #[serde(default)]
    pub transport_meta: TransportMeta,
    /// Set only on placeholders standing in for entries that failed to decode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
}

impl EventRecord {
    /// Stand-in for a stored entry that could not be decoded.
    pub fn placeholder(source_id: &str, index: usize, reason: &str) -> Self {
        Self {
            id: format!("corrupt_{index}"),
            source_id: source_id.to_string(),
            received_at: Utc::now(),
            method: String::new(),
            payload: Value::Object(Default::default()),
            transport_meta: TransportMeta::default(),
            diagnostic: Some(format!("parse error: {reason}")),
        }
    }

    /// Decode a stored entry, accepting the shape older writers used.
    pub fn decode(raw: &str, source_id: &str) -> Result<Self, serde_json::Error> {
        match serde_json::from_str::<StoredRecord>(raw)? {
            StoredRecord::Current(record) => Ok(record),
            StoredRecord::Legacy(legacy) => Ok(legacy.into_record(source_id)),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StoredRecord {
    Current(EventRecord),
    Legacy(LegacyRecord),
}

/// `{timestamp, endpoint?, body, headers?}` as written by the previous
/// generation of the receiver.
#[derive(Deserialize)]
struct LegacyRecord {
    timestamp: DateTime<Utc>,
    #[serde(default)]
    endpoint: Option<String>,
    #[serde(default)]
    body: Value,
    #[serde(default)]
    headers: Option<Value>,
}

impl LegacyRecord {
    fn into_record(self, source_id: &str) -> EventRecord {
        let header = |name: &str| {
            self.headers
                .as_ref()
                .and_then(|h| h.get(name))
                .and_then(Value::as_str)
                .map(str::to_string)
        };
        let transport_meta = TransportMeta {
            user_agent: header("user-agent"),
            content_type: header("content-type"),
        };
        EventRecord {
            id: format!("legacy_{}", self.timestamp.timestamp_millis()),
            source_id: self
                .endpoint
                .clone()
                .unwrap_or_else(|| source_id.to_string()),
            received_at: self.timestamp,
            method: "POST".to_string(),
            payload: self.body,
            transport_meta,
            diagnostic: None,
        }
    }
}

/// Per-source aggregate for the summary view.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceSummary {
    pub source_id: String,
    pub event_count: usize,
    pub most_recent: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Summary {
    pub sources: Vec<SourceSummary>,
    pub total_sources: usize,
    pub total_events: usize,
}

/// Body returned to the webhook sender for every delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestAck {
    pub status: String,
    pub endpoint: String,
    pub received_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
