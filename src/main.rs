use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use webhook_log::kv::RestBackend;
use webhook_log::{http_server, AppState, Config, Storage};

// ─── Entry point ─────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("webhook_log=info,tower_http=info"));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let config = Config::load().context("invalid configuration")?;

    let storage = match &config.backend {
        Some(backend) => {
            let kv = RestBackend::new(&backend.url, &backend.token, config.kv_timeout)
                .context("failed to create backend client")?;
            info!(url = %kv.base_url(), "backend configured");
            Some(Storage::new(Arc::new(kv)))
        }
        None => {
            warn!("KV_REST_API_URL / KV_REST_API_TOKEN not set, deliveries will not be persisted");
            None
        }
    };

    info!(
        addr = %config.addr,
        default_source = %config.default_source,
        commit_mode = ?config.commit_mode,
        retry_attempts = config.retry_attempts,
        "starting webhook-log"
    );

    let state = AppState::new(&config, storage);
    http_server::serve(config.addr, state, shutdown_signal())
        .await
        .context("HTTP server failed")?;

    info!("shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
