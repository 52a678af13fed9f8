//! Mesh bridge contract.
//!
//! The mesh is the external transport that moves signalling between nodes.
//! The core only consumes it: one outbound sender and one inbound handler per
//! realm, established once per realm lifetime. Delivery is assumed
//! at-least-once and unordered across nodes; the core does not deduplicate.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, trace};

use beacon_protocol::MeshTag;

/// Mesh bridge errors.
#[derive(Debug, Error)]
pub enum MeshError {
    /// The bridge could not be reached or refused the connection.
    #[error("mesh bridge unavailable: {0}")]
    Unavailable(String),

    /// An established sender failed to push a message.
    #[error("mesh send failed: {0}")]
    SendFailed(String),

    /// The realm already holds an established sender/receiver pair.
    #[error("realm is already connected to the mesh")]
    AlreadyConnected,
}

/// Callback invoked by the bridge for every inbound message destined for
/// this node.
///
/// The handler must not block the bridge's own delivery loop for long; hand
/// real work off to a task.
pub type MeshHandler = Arc<dyn Fn(MeshTag, Bytes) + Send + Sync>;

/// Outbound half of the mesh: pushes one tagged message to every other node.
#[async_trait]
pub trait MeshSender: Send + Sync {
    /// Send `data` on the logical mesh channel identified by `tag`.
    async fn send(&self, tag: MeshTag, data: Bytes) -> Result<(), MeshError>;
}

/// The mesh bridge a realm connects to exactly once.
#[async_trait]
pub trait MeshBridge: Send + Sync {
    /// Establish the outbound sender and register the inbound handler for
    /// one realm. `observe` lists the mesh tags the realm wants delivered.
    async fn connect(
        &self,
        realm_id: &str,
        credential: &str,
        observe: &[MeshTag],
        handler: MeshHandler,
    ) -> Result<Arc<dyn MeshSender>, MeshError>;
}

/// Bridge for single-node deployments: connecting always succeeds, sends are
/// discarded, nothing is ever delivered inbound.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMeshBridge;

impl NoopMeshBridge {
    /// Create a no-op bridge.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MeshBridge for NoopMeshBridge {
    async fn connect(
        &self,
        realm_id: &str,
        _credential: &str,
        _observe: &[MeshTag],
        _handler: MeshHandler,
    ) -> Result<Arc<dyn MeshSender>, MeshError> {
        debug!(realm = %realm_id, "mesh bridge disabled, node runs local-only");
        Ok(Arc::new(NoopMeshSender))
    }
}

struct NoopMeshSender;

#[async_trait]
impl MeshSender for NoopMeshSender {
    async fn send(&self, tag: MeshTag, data: Bytes) -> Result<(), MeshError> {
        trace!(tag, len = data.len(), "mesh send discarded");
        Ok(())
    }
}

/// In-process mesh connecting several registries inside one process.
///
/// Every send is delivered to every *other* registered node whose observed
/// tags include the message tag, and never echoed back to the sender. This
/// is the test double for cross-node scenarios; clones share the same bus.
#[derive(Clone, Default)]
pub struct InMemoryMesh {
    state: Arc<MeshState>,
}

#[derive(Default)]
struct MeshState {
    nodes: Mutex<Vec<NodeRegistration>>,
    next_id: AtomicUsize,
}

struct NodeRegistration {
    id: usize,
    observe: Vec<MeshTag>,
    handler: MeshHandler,
}

impl InMemoryMesh {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered nodes.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.state.nodes.lock().unwrap().len()
    }
}

impl MeshState {
    fn deliver(&self, from: usize, tag: MeshTag, data: &Bytes) -> usize {
        // Snapshot matching handlers so none runs under the bus lock.
        let handlers: Vec<MeshHandler> = self
            .nodes
            .lock()
            .unwrap()
            .iter()
            .filter(|node| node.id != from && node.observe.contains(&tag))
            .map(|node| node.handler.clone())
            .collect();

        for handler in &handlers {
            handler(tag, data.clone());
        }
        handlers.len()
    }
}

#[async_trait]
impl MeshBridge for InMemoryMesh {
    async fn connect(
        &self,
        realm_id: &str,
        _credential: &str,
        observe: &[MeshTag],
        handler: MeshHandler,
    ) -> Result<Arc<dyn MeshSender>, MeshError> {
        let id = self.state.next_id.fetch_add(1, Ordering::Relaxed);
        self.state.nodes.lock().unwrap().push(NodeRegistration {
            id,
            observe: observe.to_vec(),
            handler,
        });
        debug!(realm = %realm_id, node = id, "registered on in-memory mesh");

        Ok(Arc::new(InMemoryMeshSender {
            id,
            state: self.state.clone(),
        }))
    }
}

struct InMemoryMeshSender {
    id: usize,
    state: Arc<MeshState>,
}

#[async_trait]
impl MeshSender for InMemoryMeshSender {
    async fn send(&self, tag: MeshTag, data: Bytes) -> Result<(), MeshError> {
        let delivered = self.state.deliver(self.id, tag, &data);
        trace!(tag, delivered, len = data.len(), "mesh send");
        Ok(())
    }
}
