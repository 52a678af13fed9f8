//! Transport-agnostic connection handle.

use async_trait::async_trait;
use std::io;
use thiserror::Error;

/// Connection errors surfaced by a transport implementation.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The connection is closed.
    #[error("connection closed")]
    Closed,

    /// Failed to send data.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Handle for sending bytes to one client, independent of the physical
/// transport.
///
/// Implementations keep at most one in-flight write to the underlying
/// transport: both write paths serialize behind an internal lock, so two
/// concurrent writers never interleave partial frames.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Stable per-connection identifier. Used as the owning peer's `sid`.
    fn remote_addr(&self) -> &str;

    /// Send one fully-formed application message.
    async fn write(&self, msg: &[u8]) -> Result<(), ConnectionError>;

    /// Send bytes at the lowest level the transport allows, bypassing
    /// application message framing. Carries transport-maintenance traffic
    /// such as keep-alives.
    async fn raw_write(&self, buf: &[u8]) -> Result<usize, ConnectionError>;
}

/// Connection that accepts and discards every write.
///
/// Test double and benchmark harness; also useful as a placeholder peer for
/// backend-originated sessions.
#[derive(Debug, Clone)]
pub struct NoopConnection {
    remote_addr: String,
}

impl NoopConnection {
    /// Create a no-op connection with the given identifier.
    #[must_use]
    pub fn new(remote_addr: impl Into<String>) -> Self {
        Self {
            remote_addr: remote_addr.into(),
        }
    }
}

#[async_trait]
impl Connection for NoopConnection {
    fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    async fn write(&self, _msg: &[u8]) -> Result<(), ConnectionError> {
        Ok(())
    }

    async fn raw_write(&self, buf: &[u8]) -> Result<usize, ConnectionError> {
        Ok(buf.len())
    }
}
