//! Webhook receiver that keeps a bounded, newest-first event log per source
//! in a Redis-compatible backend.

pub mod config;
pub mod error;
pub mod http_server;
pub mod ingest;
pub mod kv;
pub mod log_store;
pub mod query;
pub mod registry;
pub mod retry;
pub mod shape;
pub mod source;
pub mod state;
pub mod types;

pub use config::Config;
pub use error::{ApiError, StoreError};
pub use state::{AppState, Storage};
