use std::sync::Arc;

use crate::config::Config;
use crate::ingest::Ingestor;
use crate::kv::KvBackend;
use crate::log_store::EventLogStore;
use crate::registry::SourceRegistry;

/// The log store and registry over one shared backend handle.
#[derive(Clone)]
pub struct Storage {
    pub log: EventLogStore,
    pub registry: SourceRegistry,
}

impl Storage {
    pub fn new(kv: Arc<dyn KvBackend>) -> Self {
        Self {
            log: EventLogStore::new(kv.clone()),
            registry: SourceRegistry::new(kv),
        }
    }
}

/// Immutable per-process state handed to every request handler.
#[derive(Clone)]
pub struct AppState {
    pub default_source: String,
    pub max_body_bytes: usize,
    pub ingestor: Ingestor,
}

impl AppState {
    pub fn new(config: &Config, storage: Option<Storage>) -> Self {
        Self {
            default_source: config.default_source.clone(),
            max_body_bytes: config.max_body_bytes,
            ingestor: Ingestor::new(storage, config.retry_policy(), config.commit_mode),
        }
    }

    pub fn storage(&self) -> Option<&Storage> {
        self.ingestor.storage()
    }
}
