//! # beacond
//!
//! Distributed realtime presence and pub/sub relay node.
//!
//! ## Usage
//!
//! ```bash
//! # Run with environment variables
//! BEACON_MESH_ID=node-eu-1 BEACON_PORT=8443 beacond
//!
//! # Or drop a beacond.toml next to the binary (see config.rs)
//! ```

mod config;
mod diagnostics;
mod metrics;

use anyhow::Result;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use beacon_core::{NoopMeshBridge, RealmRegistry};
use beacon_transport::{StaticAuthenticator, WebSocketServer, WebSocketServerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "beacond=debug,beacon_core=info,beacon_transport=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load and validate configuration; a missing mesh node id is fatal here
    let config = config::Config::load()?;
    config.validate()?;

    tracing::info!(
        "starting beacond node {} on {}:{}",
        config.mesh.node_id,
        config.host,
        config.port
    );

    if config.metrics.enabled {
        metrics::init_metrics();
        if let Err(err) = metrics::start_metrics_server(config.metrics.port) {
            tracing::error!("failed to start metrics server: {err}");
        }
    }

    // The mesh transport is an external collaborator; embedders inject a real
    // bridge through RealmRegistry::new. The stock binary runs local-only.
    let registry = Arc::new(RealmRegistry::new(
        config.mesh.node_id.clone(),
        Arc::new(NoopMeshBridge::new()),
    ));

    if config.diagnostics.enabled {
        tokio::spawn(diagnostics::run(
            registry.clone(),
            config.diagnostics.clone(),
        ));
    }

    let auth = Arc::new(StaticAuthenticator::new(
        config.auth.app_id.clone(),
        config.auth.credential.clone(),
    ));

    if config.transport.webtransport {
        start_webtransport(&config, registry.clone(), auth.clone()).await;
    }

    let ws_config = WebSocketServerConfig {
        bind_addr: config.bind_addr(),
        endpoint_path: config.transport.websocket_path.clone(),
        ping_interval: config.ping_interval(),
        max_message_size: config.limits.max_message_size,
    };
    let server = WebSocketServer::bind(ws_config, registry, auth).await?;

    tracing::info!(
        "signalling endpoint: ws://{}{}",
        config.bind_addr(),
        config.transport.websocket_path
    );
    server.run().await?;

    Ok(())
}

#[cfg(feature = "webtransport")]
async fn start_webtransport(
    config: &config::Config,
    registry: Arc<RealmRegistry>,
    auth: Arc<StaticAuthenticator>,
) {
    use beacon_transport::webtransport::{WebTransportServer, WebTransportServerConfig};

    let wt_config = WebTransportServerConfig {
        bind_addr: config.bind_addr(),
        cert_path: config.transport.cert_file.clone(),
        key_path: config.transport.key_file.clone(),
        endpoint_path: config.transport.websocket_path.clone(),
    };

    match WebTransportServer::bind(wt_config, registry, auth).await {
        Ok(server) => {
            tokio::spawn(async move {
                if let Err(err) = server.run().await {
                    tracing::error!("webtransport listener failed: {err}");
                }
            });
        }
        Err(err) => tracing::error!("webtransport setup failed: {err}"),
    }
}

#[cfg(not(feature = "webtransport"))]
async fn start_webtransport(
    _config: &config::Config,
    _registry: Arc<RealmRegistry>,
    _auth: Arc<StaticAuthenticator>,
) {
    tracing::warn!("webtransport requested but this build lacks the `webtransport` feature");
}
