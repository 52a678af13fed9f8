//! Shared doubles for this crate's tests.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use beacon_protocol::{codec, MeshTag, Signalling};

use crate::connection::{Connection, ConnectionError};
use crate::mesh::{MeshBridge, MeshError, MeshHandler, MeshSender, NoopMeshBridge};
use crate::realm::RealmRegistry;

/// Fresh registry on a no-op mesh, one per test.
pub(crate) fn new_local_registry() -> RealmRegistry {
    RealmRegistry::new("node-test", Arc::new(NoopMeshBridge::new()))
}

/// Connection that records every application write for assertions.
pub(crate) struct RecordingConnection {
    remote_addr: String,
    writes: Mutex<Vec<Vec<u8>>>,
    raw_writes: Mutex<Vec<Vec<u8>>>,
}

impl RecordingConnection {
    pub(crate) fn new(remote_addr: &str) -> Arc<Self> {
        Arc::new(Self {
            remote_addr: remote_addr.to_string(),
            writes: Mutex::new(Vec::new()),
            raw_writes: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn write_count(&self) -> usize {
        self.writes.lock().unwrap().len()
    }

    /// Every application write decoded back into a signalling message.
    pub(crate) fn received(&self) -> Vec<Signalling> {
        self.writes
            .lock()
            .unwrap()
            .iter()
            .map(|buf| codec::decode(buf).expect("recorded write was not a signalling message"))
            .collect()
    }

    #[allow(dead_code)]
    pub(crate) fn raw_write_count(&self) -> usize {
        self.raw_writes.lock().unwrap().len()
    }
}

#[async_trait]
impl Connection for RecordingConnection {
    fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    async fn write(&self, msg: &[u8]) -> Result<(), ConnectionError> {
        self.writes.lock().unwrap().push(msg.to_vec());
        Ok(())
    }

    async fn raw_write(&self, buf: &[u8]) -> Result<usize, ConnectionError> {
        self.raw_writes.lock().unwrap().push(buf.to_vec());
        Ok(buf.len())
    }
}

/// Connection whose application writes never complete.
pub(crate) struct StalledConnection {
    remote_addr: String,
}

impl StalledConnection {
    pub(crate) fn new(remote_addr: &str) -> Arc<Self> {
        Arc::new(Self {
            remote_addr: remote_addr.to_string(),
        })
    }
}

#[async_trait]
impl Connection for StalledConnection {
    fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    async fn write(&self, _msg: &[u8]) -> Result<(), ConnectionError> {
        std::future::pending::<Result<(), ConnectionError>>().await
    }

    async fn raw_write(&self, buf: &[u8]) -> Result<usize, ConnectionError> {
        Ok(buf.len())
    }
}

/// Bridge that refuses the first connection attempt and accepts the rest.
pub(crate) struct FlakyMeshBridge {
    attempts: AtomicUsize,
}

impl FlakyMeshBridge {
    pub(crate) fn failing_once() -> Self {
        Self {
            attempts: AtomicUsize::new(0),
        }
    }

    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MeshBridge for FlakyMeshBridge {
    async fn connect(
        &self,
        _realm_id: &str,
        _credential: &str,
        _observe: &[MeshTag],
        _handler: MeshHandler,
    ) -> Result<Arc<dyn MeshSender>, MeshError> {
        if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(MeshError::Unavailable("induced failure".to_string()));
        }
        Ok(Arc::new(DiscardSender))
    }
}

struct DiscardSender;

#[async_trait]
impl MeshSender for DiscardSender {
    async fn send(&self, _tag: MeshTag, _data: Bytes) -> Result<(), MeshError> {
        Ok(())
    }
}
