//! WebTransport transport (experimental).
//!
//! Datagram-oriented: every inbound datagram is one signalling message, every
//! application write is one datagram prefixed with `0x00` to distinguish it
//! from transport-maintenance traffic.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use wtransport::endpoint::endpoint_side::Server;
use wtransport::endpoint::IncomingSession;
use wtransport::{Endpoint, Identity, ServerConfig};

use beacon_core::{Connection, ConnectionError, RealmRegistry};

use crate::auth::Authenticator;
use crate::TransportError;

/// WebTransport listener configuration.
#[derive(Debug, Clone)]
pub struct WebTransportServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Path to the TLS certificate chain (PEM).
    pub cert_path: String,
    /// Path to the TLS private key (PEM).
    pub key_path: String,
    /// Endpoint path clients must request.
    pub endpoint_path: String,
}

impl Default for WebTransportServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8443".parse().expect("valid bind address"),
            cert_path: "cert.pem".to_string(),
            key_path: "key.pem".to_string(),
            endpoint_path: "/v1".to_string(),
        }
    }
}

/// WebTransport listener.
pub struct WebTransportServer {
    endpoint: Endpoint<Server>,
    config: WebTransportServerConfig,
    registry: Arc<RealmRegistry>,
    auth: Arc<dyn Authenticator>,
}

impl WebTransportServer {
    /// Load the TLS identity and bind the endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the identity cannot be loaded or the socket
    /// cannot be bound.
    pub async fn bind(
        config: WebTransportServerConfig,
        registry: Arc<RealmRegistry>,
        auth: Arc<dyn Authenticator>,
    ) -> Result<Self, TransportError> {
        let identity = Identity::load_pemfiles(&config.cert_path, &config.key_path)
            .await
            .map_err(|err| TransportError::Other(format!("tls identity: {err}")))?;

        let server_config = ServerConfig::builder()
            .with_bind_address(config.bind_addr)
            .with_identity(identity)
            .build();

        let endpoint =
            Endpoint::server(server_config).map_err(|err| TransportError::Other(err.to_string()))?;

        info!("WebTransport listener on {}", config.bind_addr);
        Ok(Self {
            endpoint,
            config,
            registry,
            auth,
        })
    }

    /// Accept sessions until the endpoint fails.
    pub async fn run(self) -> Result<(), TransportError> {
        loop {
            let incoming = self.endpoint.accept().await;
            let registry = self.registry.clone();
            let auth = self.auth.clone();
            let endpoint_path = self.config.endpoint_path.clone();
            tokio::spawn(async move {
                if let Err(err) = handle_session(incoming, registry, auth, endpoint_path).await {
                    debug!(error = %err, "webtransport session ended with error");
                }
            });
        }
    }
}

async fn handle_session(
    incoming: IncomingSession,
    registry: Arc<RealmRegistry>,
    auth: Arc<dyn Authenticator>,
    endpoint_path: String,
) -> Result<(), TransportError> {
    let request = incoming
        .await
        .map_err(|err| TransportError::Handshake(err.to_string()))?;

    let (path, query) = request
        .path()
        .split_once('?')
        .map_or((request.path().to_string(), String::new()), |(p, q)| {
            (p.to_string(), q.to_string())
        });

    if path != endpoint_path {
        warn!(%path, "webtransport request for unknown path");
        request.not_found().await;
        return Ok(());
    }

    let cid = query_value(&query, "id");
    let public_key = query_value(&query, "publickey");
    if cid.is_empty() || public_key.is_empty() {
        request.forbidden().await;
        return Ok(());
    }

    let Some(grant) = auth.authenticate(&public_key) else {
        warn!("webtransport session rejected: illegal public key");
        request.forbidden().await;
        return Ok(());
    };

    let session = request
        .accept()
        .await
        .map_err(|err| TransportError::Handshake(err.to_string()))?;

    metrics::counter!("beacon_connections_total").increment(1);
    metrics::gauge!("beacon_connections_active").increment(1.0);
    info!(remote = %session.remote_address(), cid = %cid, app_id = %grant.app_id, "webtransport session authenticated");

    let realm = registry.get_or_create(&grant.app_id, &grant.credential).await;
    let session = Arc::new(session);
    let conn = Arc::new(WebTransportConnection::new(session.clone()));
    let peer = realm.add_peer(conn, cid);

    loop {
        match session.receive_datagram().await {
            Ok(datagram) => {
                metrics::counter!("beacon_messages_total", "direction" => "inbound").increment(1);
                if let Err(err) = peer.handle_signal(&datagram).await {
                    debug!(sid = %peer.sid(), error = %err, "undecodable datagram dropped");
                }
            }
            Err(err) => {
                debug!(sid = %peer.sid(), error = %err, "webtransport session closed");
                break;
            }
        }
    }

    peer.disconnect().await;
    metrics::gauge!("beacon_connections_active").decrement(1.0);
    Ok(())
}

fn query_value(query: &str, name: &str) -> String {
    query
        .split('&')
        .find_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            (key == name).then(|| value.to_string())
        })
        .unwrap_or_default()
}

/// One WebTransport client, addressed by datagrams.
pub struct WebTransportConnection {
    remote_addr: String,
    session: Arc<wtransport::Connection>,
    /// Serializes writers per the connection contract; datagram sends are
    /// whole-message so this guards ordering, not framing.
    write_lock: Mutex<()>,
}

impl WebTransportConnection {
    fn new(session: Arc<wtransport::Connection>) -> Self {
        Self {
            remote_addr: session.remote_address().to_string(),
            session,
            write_lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl Connection for WebTransportConnection {
    fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    async fn write(&self, msg: &[u8]) -> Result<(), ConnectionError> {
        let _guard = self.write_lock.lock().await;
        metrics::counter!("beacon_messages_total", "direction" => "outbound").increment(1);

        let mut buf = Vec::with_capacity(msg.len() + 1);
        buf.push(0x00);
        buf.extend_from_slice(msg);
        self.session
            .send_datagram(buf)
            .map_err(|err| ConnectionError::SendFailed(err.to_string()))
    }

    async fn raw_write(&self, buf: &[u8]) -> Result<usize, ConnectionError> {
        let _guard = self.write_lock.lock().await;
        self.session
            .send_datagram(buf)
            .map_err(|err| ConnectionError::SendFailed(err.to_string()))?;
        Ok(buf.len())
    }
}
