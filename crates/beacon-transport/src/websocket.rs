//! WebSocket transport.
//!
//! One task per connection runs the read/decode/dispatch loop, one more runs
//! transport keep-alives; they share nothing but the peer state and stop
//! independently on disconnect.

use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

use beacon_core::{Connection, ConnectionError, RealmRegistry};

use crate::auth::Authenticator;
use crate::TransportError;

/// WebSocket listener configuration.
#[derive(Debug, Clone)]
pub struct WebSocketServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Endpoint path clients must request.
    pub endpoint_path: String,
    /// Interval between server-initiated Pings.
    pub ping_interval: Duration,
    /// Maximum inbound message size in bytes.
    pub max_message_size: usize,
}

impl Default for WebSocketServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8443".parse().expect("valid bind address"),
            endpoint_path: "/v1".to_string(),
            ping_interval: Duration::from_secs(10),
            max_message_size: 64 * 1024, // 64 KB
        }
    }
}

/// WebSocket listener.
pub struct WebSocketServer {
    listener: TcpListener,
    config: WebSocketServerConfig,
    registry: Arc<RealmRegistry>,
    auth: Arc<dyn Authenticator>,
}

impl WebSocketServer {
    /// Bind the listener.
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the address fails.
    pub async fn bind(
        config: WebSocketServerConfig,
        registry: Arc<RealmRegistry>,
        auth: Arc<dyn Authenticator>,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        info!("WebSocket listener on {}", config.bind_addr);
        Ok(Self {
            listener,
            config,
            registry,
            auth,
        })
    }

    /// The local address this listener is bound to.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }

    /// Accept connections until the listener fails.
    ///
    /// # Errors
    ///
    /// Returns an error when accepting fails at the socket level.
    pub async fn run(self) -> Result<(), TransportError> {
        loop {
            let (stream, addr) = self.listener.accept().await?;
            debug!(%addr, "accepted tcp connection");

            let registry = self.registry.clone();
            let auth = self.auth.clone();
            let config = self.config.clone();
            tokio::spawn(async move {
                if let Err(err) = handle_connection(stream, addr, registry, auth, config).await {
                    debug!(%addr, error = %err, "connection ended with error");
                }
            });
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    registry: Arc<RealmRegistry>,
    auth: Arc<dyn Authenticator>,
    config: WebSocketServerConfig,
) -> Result<(), TransportError> {
    let mesh_id = registry.mesh_id().to_string();
    let mut cid = String::new();
    let mut grant = None;

    let callback = |req: &Request, mut resp: Response| -> Result<Response, ErrorResponse> {
        let uri = req.uri();
        if uri.path() != config.endpoint_path {
            return Err(reject(StatusCode::NOT_FOUND, "path not allowed"));
        }

        let query = uri.query().unwrap_or("");
        match query_param(query, "id") {
            Some(id) if !id.is_empty() => cid = id,
            _ => return Err(reject(StatusCode::UNAUTHORIZED, "id must not be empty")),
        }
        let public_key = match query_param(query, "publickey") {
            Some(key) if !key.is_empty() => key,
            _ => {
                return Err(reject(
                    StatusCode::UNAUTHORIZED,
                    "publickey must not be empty",
                ))
            }
        };

        match auth.authenticate(&public_key) {
            Some(granted) => grant = Some(granted),
            None => return Err(reject(StatusCode::FORBIDDEN, "illegal public key")),
        }

        resp.headers_mut().insert(
            "x-beacon-version",
            HeaderValue::from_static(env!("CARGO_PKG_VERSION")),
        );
        if let Ok(value) = HeaderValue::from_str(&mesh_id) {
            resp.headers_mut().insert("x-beacon-mesh-id", value);
        }
        Ok(resp)
    };

    let ws = tokio_tungstenite::accept_hdr_async(stream, callback)
        .await
        .map_err(|err| TransportError::Handshake(err.to_string()))?;

    let Some(grant) = grant else {
        return Err(TransportError::Handshake(
            "upgrade completed without a grant".to_string(),
        ));
    };

    metrics::counter!("beacon_connections_total").increment(1);
    metrics::gauge!("beacon_connections_active").increment(1.0);
    info!(%addr, cid = %cid, app_id = %grant.app_id, "websocket session authenticated");

    let realm = registry.get_or_create(&grant.app_id, &grant.credential).await;

    let (sink, mut stream) = ws.split();
    let conn = Arc::new(WebSocketConnection::new(addr.to_string(), sink));
    let peer = realm.add_peer(conn.clone(), cid);

    // RFC 6455 5.5.2: browsers never Ping first; the server keeps the
    // connection alive and the browser answers Pong automatically.
    let (done_tx, mut done_rx) = watch::channel(false);
    let keepalive_conn = conn.clone();
    let keepalive_sid = peer.sid().to_string();
    let ping_interval = config.ping_interval;
    let keepalive = tokio::spawn(async move {
        let start = tokio::time::Instant::now() + ping_interval;
        let mut ticker = tokio::time::interval_at(start, ping_interval);
        loop {
            tokio::select! {
                _ = done_rx.changed() => {
                    debug!(sid = %keepalive_sid, "keepalive stopped");
                    break;
                }
                _ = ticker.tick() => {
                    if keepalive_conn.raw_write(&ping_payload()).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Binary(data)) => {
                if data.len() > config.max_message_size {
                    warn!(sid = %peer.sid(), len = data.len(), "message exceeds size limit, closing");
                    break;
                }
                metrics::counter!("beacon_messages_total", "direction" => "inbound").increment(1);

                if let Err(err) = peer.handle_signal(&data).await {
                    // only this message is lost; a stream gone bad shows up
                    // as a read error on the next iteration
                    debug!(sid = %peer.sid(), error = %err, "undecodable message dropped");
                }
            }
            Ok(Message::Ping(payload)) => {
                if let Err(err) = conn.pong(payload).await {
                    debug!(sid = %peer.sid(), error = %err, "pong failed");
                    break;
                }
            }
            Ok(Message::Pong(payload)) => {
                if let Some(rtt) = pong_rtt_millis(&payload) {
                    debug!(sid = %peer.sid(), rtt_ms = rtt, "PONG");
                }
            }
            Ok(Message::Text(_)) => {
                warn!(sid = %peer.sid(), "text frame on a binary-only protocol, closing");
                break;
            }
            Ok(Message::Close(_)) => {
                debug!(sid = %peer.sid(), "client sent close");
                break;
            }
            Ok(Message::Frame(_)) => {}
            Err(err) => {
                debug!(sid = %peer.sid(), error = %err, "websocket read error");
                break;
            }
        }
    }

    let _ = done_tx.send(true);
    peer.disconnect().await;
    let _ = keepalive.await;

    metrics::gauge!("beacon_connections_active").decrement(1.0);
    debug!(%addr, "websocket session closed");
    Ok(())
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut resp = ErrorResponse::new(Some(reason.to_string()));
    *resp.status_mut() = status;
    resp
}

fn query_param(query: &str, name: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == name).then(|| value.to_string())
    })
}

/// Ping payload: current time as big-endian milliseconds, echoed back in the
/// Pong so the round trip can be measured.
fn ping_payload() -> [u8; 8] {
    now_millis().to_be_bytes()
}

fn pong_rtt_millis(payload: &[u8]) -> Option<u64> {
    let sent = u64::from_be_bytes(payload.try_into().ok()?);
    Some(now_millis().saturating_sub(sent))
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// The write half of one WebSocket client.
pub struct WebSocketConnection {
    remote_addr: String,
    /// One in-flight write at a time; Peer fan-out and the keep-alive task
    /// both go through this lock.
    sink: Mutex<WsSink>,
}

impl WebSocketConnection {
    fn new(remote_addr: String, sink: WsSink) -> Self {
        Self {
            remote_addr,
            sink: Mutex::new(sink),
        }
    }

    async fn pong(&self, payload: Vec<u8>) -> Result<(), ConnectionError> {
        self.sink
            .lock()
            .await
            .send(Message::Pong(payload))
            .await
            .map_err(|err| ConnectionError::SendFailed(err.to_string()))
    }
}

#[async_trait]
impl Connection for WebSocketConnection {
    fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    async fn write(&self, msg: &[u8]) -> Result<(), ConnectionError> {
        metrics::counter!("beacon_messages_total", "direction" => "outbound").increment(1);
        self.sink
            .lock()
            .await
            .send(Message::Binary(msg.to_vec()))
            .await
            .map_err(|err| {
                error!(remote = %self.remote_addr, error = %err, "websocket write failed");
                ConnectionError::SendFailed(err.to_string())
            })
    }

    /// Keep-alive traffic rides a Ping control frame, outside application
    /// message framing.
    async fn raw_write(&self, buf: &[u8]) -> Result<usize, ConnectionError> {
        self.sink
            .lock()
            .await
            .send(Message::Ping(buf.to_vec()))
            .await
            .map_err(|err| ConnectionError::SendFailed(err.to_string()))?;
        Ok(buf.len())
    }
}
