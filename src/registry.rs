use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::kv::KvBackend;
use crate::shape::{guarded, SetShape};
use crate::source::{SourceId, REGISTRY_KEY};

/// Set of every source that has produced at least one event.
#[derive(Clone)]
pub struct SourceRegistry {
    kv: Arc<dyn KvBackend>,
    shape: SetShape,
}

impl SourceRegistry {
    pub fn new(kv: Arc<dyn KvBackend>) -> Self {
        Self { kv, shape: SetShape }
    }

    /// Idempotent: registering an id again leaves the set unchanged.
    pub async fn register(&self, source: &SourceId) -> Result<(), StoreError> {
        let member = [source.as_str().to_string()];
        let added = guarded(&self.shape, self.kv.as_ref(), REGISTRY_KEY, || {
            self.kv.sadd(REGISTRY_KEY, &member)
        })
        .await?;
        if added > 0 {
            debug!(source_id = %source, "registered new source");
        }
        Ok(())
    }

    pub async fn list(&self) -> Result<BTreeSet<String>, StoreError> {
        match guarded(&self.shape, self.kv.as_ref(), REGISTRY_KEY, || {
            self.kv.smembers(REGISTRY_KEY)
        })
        .await
        {
            Ok(members) => Ok(members.into_iter().collect()),
            Err(StoreError::ShapeMismatch { .. }) => {
                warn!("registry still has the wrong shape, reading as empty");
                Ok(BTreeSet::new())
            }
            Err(e) => Err(e),
        }
    }
}
