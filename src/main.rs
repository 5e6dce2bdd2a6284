//! kn-collab-server — composition root for the sync engine.
//!
//! Wires the version store, room registry, WebSocket gateway, and HTTP
//! inspection API together from environment configuration:
//!
//! - `KN_COLLAB_BIND`        WebSocket bind address (default 127.0.0.1:9090)
//! - `KN_COLLAB_HTTP_BIND`   inspection API bind address (default 127.0.0.1:9091)
//! - `KN_COLLAB_DATA_DIR`    snapshot store path (unset = no persistence)
//! - `KN_COLLAB_AUTH_TOKEN`  shared bearer token (unset = no auth gate)
//! - `KN_COLLAB_DEBOUNCE_MS` snapshot debounce window (default 1500)

use std::env;
use std::sync::Arc;
use std::time::Duration;

use kn_collab::registry::{RegistryConfig, RoomRegistry};
use kn_collab::server::{ServerConfig, SyncServer};
use kn_collab::storage::{StoreConfig, VersionStore};
use kn_collab::{http, DEFAULT_DEBOUNCE};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let bind_addr = env::var("KN_COLLAB_BIND").unwrap_or_else(|_| "127.0.0.1:9090".to_string());
    let http_bind = env::var("KN_COLLAB_HTTP_BIND").unwrap_or_else(|_| "127.0.0.1:9091".to_string());
    let auth_token = env::var("KN_COLLAB_AUTH_TOKEN").ok();
    let debounce = env::var("KN_COLLAB_DEBOUNCE_MS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_DEBOUNCE);

    let store = match env::var("KN_COLLAB_DATA_DIR") {
        Ok(path) => {
            let config = StoreConfig {
                path: path.into(),
                ..StoreConfig::default()
            };
            Some(Arc::new(VersionStore::open(config)?))
        }
        Err(_) => {
            log::warn!("KN_COLLAB_DATA_DIR unset — running without snapshot persistence");
            None
        }
    };

    let registry = Arc::new(RoomRegistry::new(
        store,
        RegistryConfig {
            debounce,
            ..RegistryConfig::default()
        },
    ));
    let _sweep = registry.spawn_eviction_sweep();

    let gateway = SyncServer::new(
        ServerConfig {
            bind_addr,
            auth_token,
        },
        registry.clone(),
    );

    let http_registry = registry.clone();
    let http_task = tokio::spawn(async move {
        if let Err(e) = http::serve(http_registry, &http_bind).await {
            log::error!("inspection api failed: {e}");
        }
    });

    let result = tokio::select! {
        r = gateway.run() => r,
        _ = tokio::signal::ctrl_c() => {
            log::info!("shutdown signal received");
            Ok(())
        }
    };

    http_task.abort();
    registry.shutdown().await;
    result
}
