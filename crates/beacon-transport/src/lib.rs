//! # beacon-transport
//!
//! Physical transports for the Beacon presence relay.
//!
//! Each transport owns its accept loop and produces one
//! [`beacon_core::Connection`] per client, authenticated at accept time
//! through the [`Authenticator`] contract before any peer or realm state is
//! touched:
//!
//! - **WebSocket** - the standard, works everywhere (default feature)
//! - **WebTransport** - HTTP/3 + QUIC datagrams (feature `webtransport`)

use thiserror::Error;

pub mod auth;

#[cfg(feature = "websocket")]
pub mod websocket;

#[cfg(feature = "webtransport")]
pub mod webtransport;

pub use auth::{AuthGrant, Authenticator, StaticAuthenticator};

#[cfg(feature = "websocket")]
pub use websocket::{WebSocketServer, WebSocketServerConfig};

/// Errors from listener setup and connection handling.
#[derive(Debug, Error)]
pub enum TransportError {
    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The client handshake could not be completed.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}
