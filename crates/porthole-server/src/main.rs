mod api;
mod config;
mod conn;
mod error;
mod handler;
mod list;
mod notifier;
mod poller;
mod upstream;

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;
use tracing_subscriber::EnvFilter;

use porthole_store::Database;

use crate::api::AppState;
use crate::config::ServerConfig;
use crate::handler::SyncHandler;
use crate::notifier::Notifier;
use crate::poller::PollerMap;
use crate::upstream::HttpUpstream;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,porthole_server=debug")),
        )
        .init();

    info!(
        "Starting Porthole sync proxy v{}",
        env!("CARGO_PKG_VERSION")
    );

    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    let db = match &config.db_path {
        Some(path) => Database::open_at(path)?,
        None => Database::new()?,
    };
    let store = Arc::new(Mutex::new(db));

    let upstream = Arc::new(HttpUpstream::new(config.upstream_url.clone()));
    let notifier = Notifier::new(store.clone(), config.long_poll_timeout);
    let handler = SyncHandler::new(store.clone(), notifier.clone(), upstream.clone());
    let poller_map = PollerMap::new(upstream, handler.clone(), config.poll_timeout);

    handler.load_joined_users().await?;

    // Idle connection eviction
    let evict_notifier = notifier.clone();
    let idle_after = config.conn_idle_evict;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(idle_after / 4);
        loop {
            interval.tick().await;
            let evicted = evict_notifier.evict_idle(idle_after);
            if evicted > 0 {
                tracing::debug!(evicted, "evicted idle connections");
            }
        }
    });

    // Unreferenced snapshot sweep
    let gc_store = store.clone();
    let gc_interval = config.snapshot_gc_interval;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(gc_interval);
        loop {
            interval.tick().await;
            match gc_store.lock().await.gc_unreferenced_snapshots() {
                Ok(0) => {}
                Ok(deleted) => tracing::debug!(deleted, "collected unreferenced snapshots"),
                Err(e) => tracing::warn!(error = %e, "snapshot GC failed"),
            }
        }
    });

    let app_state = AppState {
        handler,
        poller_map: poller_map.clone(),
    };

    tokio::select! {
        result = api::serve(app_state, config.http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                poller_map.shutdown().await;
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    poller_map.shutdown().await;

    Ok(())
}
