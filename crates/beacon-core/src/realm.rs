//! Realm: the per-appID registry of channels and peers on one node, plus the
//! process-wide realm registry.

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};
use tracing::{debug, error, info, trace, warn};

use beacon_protocol::codec::{self, tags};
use beacon_protocol::{MeshTag, Signalling};

use crate::channel::Channel;
use crate::connection::Connection;
use crate::mesh::{MeshBridge, MeshError, MeshHandler, MeshSender};
use crate::peer::Peer;

/// One realm per appID: owns this node's channels and peers for that
/// application, and the bridge to the cross-node mesh.
///
/// The realm is the only entity that creates or deletes channels and peers;
/// channels and peers hold only non-owning back-references to it.
pub struct Realm {
    id: String,
    mesh_id: String,
    channels: DashMap<String, Arc<Channel>>,
    peers: DashMap<String, Arc<Peer>>,
    /// Outbound mesh half; established at most once per realm lifetime.
    mesh: OnceLock<Arc<dyn MeshSender>>,
}

impl Realm {
    pub(crate) fn new(id: impl Into<String>, mesh_id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            mesh_id: mesh_id.into(),
            channels: DashMap::new(),
            peers: DashMap::new(),
            mesh: OnceLock::new(),
        })
    }

    /// The appID this realm serves.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The mesh identity of this node.
    #[must_use]
    pub fn mesh_id(&self) -> &str {
        &self.mesh_id
    }

    /// Construct and register a peer for an accepted, authenticated
    /// connection. The peer's `sid` is the connection's remote address.
    pub fn add_peer(
        self: &Arc<Self>,
        conn: Arc<dyn Connection>,
        cid: impl Into<String>,
    ) -> Arc<Peer> {
        let peer = Arc::new(Peer::new(conn, cid, Arc::downgrade(self)));
        debug!(app_id = %self.id, sid = %peer.sid(), cid = %peer.cid(), "realm.add_peer");
        self.peers.insert(peer.sid().to_string(), peer.clone());
        peer
    }

    /// Deregister a peer by session id.
    pub fn remove_peer(&self, sid: &str) {
        if self.peers.remove(sid).is_some() {
            info!(app_id = %self.id, sid = %sid, "realm.remove_peer");
        }
    }

    /// Resolve a peer by session id.
    #[must_use]
    pub fn peer(&self, sid: &str) -> Option<Arc<Peer>> {
        self.peers.get(sid).map(|e| e.value().clone())
    }

    /// Number of registered peers on this node.
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Load or create a channel; two concurrent callers for the same new
    /// name observe exactly one instance.
    pub fn get_or_add_channel(self: &Arc<Self>, name: &str) -> Arc<Channel> {
        if let Some(channel) = self.channels.get(name) {
            return channel.clone();
        }

        self.channels
            .entry(name.to_string())
            .or_insert_with(|| {
                info!(app_id = %self.id, channel = %name, "create channel");
                Arc::new(Channel::new(name, Arc::downgrade(self)))
            })
            .value()
            .clone()
    }

    /// Resolve a channel by name.
    #[must_use]
    pub fn find_channel(&self, name: &str) -> Option<Arc<Channel>> {
        let found = self.channels.get(name).map(|e| e.value().clone());
        if found.is_none() {
            debug!(app_id = %self.id, channel = %name, "channel not found");
        }
        found
    }

    /// Number of channels on this node.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Drop the registry entry for `name` if its member map is empty.
    ///
    /// The emptiness check runs under the map shard lock, so a concurrent
    /// join either sees the channel before removal or re-creates it through
    /// its own retry. Returns whether the channel was reclaimed.
    pub fn reclaim_channel_if_empty(&self, name: &str) -> bool {
        let removed = self
            .channels
            .remove_if(name, |_, channel| channel.member_count() == 0)
            .is_some();
        if removed {
            debug!(app_id = %self.id, channel = %name, "reclaimed empty channel");
        }
        removed
    }

    /// Establish the outbound sender and inbound receiver against the mesh
    /// bridge, exactly once per realm.
    ///
    /// The inbound handler decodes each mesh payload and dispatches it into
    /// the matching local channel on a spawned task, so the bridge's own
    /// delivery loop is never held up.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::AlreadyConnected`] on a second call, or the
    /// bridge's own error when the connection cannot be established.
    pub async fn connect_to_mesh(
        self: &Arc<Self>,
        bridge: Arc<dyn MeshBridge>,
        credential: &str,
    ) -> Result<(), MeshError> {
        if self.mesh.get().is_some() {
            return Err(MeshError::AlreadyConnected);
        }

        let weak = Arc::downgrade(self);
        let handler: MeshHandler = Arc::new(move |tag, data| {
            let Some(realm) = weak.upgrade() else {
                return;
            };
            tokio::spawn(async move {
                realm.dispatch_from_mesh(tag, data).await;
            });
        });

        let sender = bridge
            .connect(&self.id, credential, &[tags::PRESENCE, tags::BACKEND], handler)
            .await?;

        self.mesh
            .set(sender)
            .map_err(|_| MeshError::AlreadyConnected)?;
        info!(app_id = %self.id, mesh_id = %self.mesh_id, "connected to mesh");
        Ok(())
    }

    /// Decode an inbound mesh payload and deliver it to local members only.
    ///
    /// A message for a channel that does not exist locally is dropped, not
    /// queued or retried.
    pub async fn dispatch_from_mesh(&self, tag: MeshTag, data: Bytes) {
        let sig = match codec::decode(&data) {
            Ok(sig) => sig,
            Err(err) => {
                warn!(app_id = %self.id, tag, error = %err, "mesh payload decode failed, dropped");
                return;
            }
        };

        match self.find_channel(&sig.channel) {
            Some(channel) => {
                let delivered = channel.dispatch(sig).await;
                trace!(app_id = %self.id, tag, delivered, "mesh message dispatched");
            }
            None => {
                debug!(app_id = %self.id, channel = %sig.channel, "mesh message for absent channel, dropped");
            }
        }
    }

    /// Encode and push a message to the mesh for every other node.
    ///
    /// Fail-open: a missing bridge or a failed send degrades cross-node
    /// propagation, never local delivery, and nothing surfaces to the
    /// message originator.
    pub async fn broadcast_to_mesh(&self, sig: Signalling) {
        let Some(sender) = self.mesh.get().cloned() else {
            debug!(app_id = %self.id, "mesh not connected, presence stays local");
            return;
        };

        let buf = match codec::encode(&sig) {
            Ok(buf) => buf,
            Err(err) => {
                error!(app_id = %self.id, error = %err, "mesh encode failed");
                return;
            }
        };

        if let Err(err) = sender.send(tags::PRESENCE, buf).await {
            error!(app_id = %self.id, error = %err, "mesh send failed, message dropped");
        }
    }

    fn snapshot(&self) -> RealmSnapshot {
        RealmSnapshot {
            app_id: self.id.clone(),
            channels: self
                .channels
                .iter()
                .map(|entry| ChannelSnapshot {
                    name: entry.key().clone(),
                    member_count: entry.value().member_count(),
                    members: entry
                        .value()
                        .member_identities()
                        .into_iter()
                        .map(|(sid, cid)| PeerIdentity { sid, cid })
                        .collect(),
                })
                .collect(),
        }
    }
}

/// Identity pair of one member, for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct PeerIdentity {
    /// Node-local session id.
    pub sid: String,
    /// Client-assigned identity.
    pub cid: String,
}

/// Point-in-time view of one channel.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelSnapshot {
    /// Channel name.
    pub name: String,
    /// Member count at snapshot time.
    pub member_count: usize,
    /// Member identities at snapshot time.
    pub members: Vec<PeerIdentity>,
}

/// Point-in-time view of one realm.
#[derive(Debug, Clone, Serialize)]
pub struct RealmSnapshot {
    /// The appID the realm serves.
    pub app_id: String,
    /// The realm's channels.
    pub channels: Vec<ChannelSnapshot>,
}

/// Process-wide registry of realms, keyed by appID.
///
/// Constructed once at process start and passed into every component that
/// needs it (transport listeners, diagnostics); there is no ambient global
/// state, which keeps the core testable with a fresh registry per test.
pub struct RealmRegistry {
    realms: DashMap<String, Arc<Realm>>,
    bridge: Arc<dyn MeshBridge>,
    mesh_id: String,
}

impl RealmRegistry {
    /// Create a registry for the node identified by `mesh_id`, using
    /// `bridge` for every realm's mesh connection.
    #[must_use]
    pub fn new(mesh_id: impl Into<String>, bridge: Arc<dyn MeshBridge>) -> Self {
        Self {
            realms: DashMap::new(),
            bridge,
            mesh_id: mesh_id.into(),
        }
    }

    /// The mesh identity of this node.
    #[must_use]
    pub fn mesh_id(&self) -> &str {
        &self.mesh_id
    }

    /// Load or create the realm for `app_id`.
    ///
    /// On creation the realm attempts its mesh connection. If that fails the
    /// realm is still returned so clients can transact locally, but its
    /// registry entry is removed: the next arrival for the same appID
    /// retries the mesh connection.
    pub async fn get_or_create(&self, app_id: &str, credential: &str) -> Arc<Realm> {
        if let Some(realm) = self.realms.get(app_id) {
            return realm.clone();
        }

        let realm = Realm::new(app_id, &self.mesh_id);
        match self.realms.entry(app_id.to_string()) {
            Entry::Occupied(existing) => return existing.get().clone(),
            Entry::Vacant(slot) => {
                debug!(app_id = %app_id, "create realm");
                slot.insert(realm.clone());
            }
        }

        if let Err(err) = realm.connect_to_mesh(self.bridge.clone(), credential).await {
            warn!(app_id = %app_id, error = %err, "mesh connection failed, realm degraded to local-only");
            self.realms.remove(app_id);
        }

        realm
    }

    /// Resolve an existing realm without creating one.
    #[must_use]
    pub fn get(&self, app_id: &str) -> Option<Arc<Realm>> {
        self.realms.get(app_id).map(|e| e.value().clone())
    }

    /// Number of registered realms.
    #[must_use]
    pub fn realm_count(&self) -> usize {
        self.realms.len()
    }

    /// Point-in-time view of every realm, its channels, and their members.
    #[must_use]
    pub fn snapshot(&self) -> Vec<RealmSnapshot> {
        self.realms
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect()
    }

    /// Channel memberships per appID, for the periodic connections report.
    #[must_use]
    pub fn connection_counts(&self) -> HashMap<String, usize> {
        let mut counter = HashMap::new();
        for realm in self.realms.iter() {
            let total: usize = realm
                .value()
                .snapshot()
                .channels
                .iter()
                .map(|channel| channel.member_count)
                .sum();
            *counter.entry(realm.key().clone()).or_insert(0) += total;
        }
        counter
    }

    /// Print the realm/channel/peer tree to the log.
    pub fn dump(&self) {
        info!("realm dump start --------");
        for snapshot in self.snapshot() {
            info!(app_id = %snapshot.app_id, "realm");
            for channel in &snapshot.channels {
                info!(channel = %channel.name, members = channel.member_count, "  channel");
                for member in &channel.members {
                    info!(sid = %member.sid, cid = %member.cid, "    peer");
                }
            }
        }
        info!("realm dump done --------");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::{InMemoryMesh, NoopMeshBridge};
    use crate::test_support::{new_local_registry, FlakyMeshBridge, RecordingConnection};
    use beacon_protocol::{opcode, SigType};
    use std::time::Duration;

    async fn settle() {
        // let spawned relay/dispatch tasks drain
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_get_or_add_channel_is_race_free() {
        let registry = new_local_registry();
        let realm = registry.get_or_create("app", "").await;

        let r1 = realm.clone();
        let r2 = realm.clone();
        let (a, b) = tokio::join!(
            tokio::spawn(async move { r1.get_or_add_channel("x") }),
            tokio::spawn(async move { r2.get_or_add_channel("x") }),
        );

        assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
        assert_eq!(realm.channel_count(), 1);
    }

    #[tokio::test]
    async fn test_registry_load_or_create() {
        let registry = new_local_registry();
        let first = registry.get_or_create("app", "").await;
        let second = registry.get_or_create("app", "").await;

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.realm_count(), 1);
        assert_eq!(first.mesh_id(), "node-test");
    }

    #[tokio::test]
    async fn test_registry_retries_mesh_after_failure() {
        let bridge = Arc::new(FlakyMeshBridge::failing_once());
        let registry = RealmRegistry::new("node-test", bridge.clone());

        // first attempt: bridge refuses, realm is usable but not registered
        let degraded = registry.get_or_create("app", "").await;
        assert_eq!(degraded.id(), "app");
        assert!(registry.get("app").is_none());

        // next arrival retries and sticks
        let connected = registry.get_or_create("app", "").await;
        assert!(!Arc::ptr_eq(&degraded, &connected));
        assert!(registry.get("app").is_some());
        assert_eq!(bridge.attempts(), 2);
    }

    #[tokio::test]
    async fn test_connect_to_mesh_is_once_only() {
        let registry = new_local_registry();
        let realm = registry.get_or_create("app", "").await;

        let again = realm
            .connect_to_mesh(Arc::new(NoopMeshBridge::new()), "")
            .await;
        assert!(matches!(again, Err(MeshError::AlreadyConnected)));
    }

    #[tokio::test]
    async fn test_mesh_message_for_absent_channel_is_dropped() {
        let registry = new_local_registry();
        let realm = registry.get_or_create("app", "").await;

        let sig = Signalling::data("ghost-room", b"boo".to_vec(), "remote").unwrap();
        realm
            .dispatch_from_mesh(tags::PRESENCE, codec::encode(&sig).unwrap())
            .await;

        // and malformed payloads are equally non-fatal
        realm
            .dispatch_from_mesh(tags::PRESENCE, Bytes::from_static(b"\xc1garbage"))
            .await;

        assert_eq!(realm.channel_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_channel_is_reclaimed_and_rejoinable() {
        let registry = new_local_registry();
        let realm = registry.get_or_create("app", "").await;
        let peer = realm.add_peer(RecordingConnection::new("sid-a"), "alice");

        peer.join("room1").await;
        assert!(realm.find_channel("room1").is_some());

        peer.leave("room1").await;
        assert!(realm.find_channel("room1").is_none());

        peer.join("room1").await;
        let channel = realm.find_channel("room1").unwrap();
        assert_eq!(channel.member_count(), 1);
        assert!(peer.is_member("room1"));
    }

    #[tokio::test]
    async fn test_scenario_two_peers_one_node() {
        let registry = new_local_registry();
        let realm = registry.get_or_create("app", "").await;

        let conn_a = RecordingConnection::new("sid-a");
        let conn_b = RecordingConnection::new("sid-b");
        let alice = realm.add_peer(conn_a.clone(), "alice");
        let bob = realm.add_peer(conn_b.clone(), "bob");

        alice.join("room1").await;
        assert_eq!(realm.find_channel("room1").unwrap().member_count(), 1);

        bob.join("room1").await;
        assert_eq!(realm.find_channel("room1").unwrap().member_count(), 2);

        // alice sees bob arrive
        let online: Vec<Signalling> = conn_a
            .received()
            .into_iter()
            .filter(|sig| sig.opcode.as_deref() == Some(opcode::PEER_ONLINE))
            .collect();
        assert_eq!(online.len(), 1);
        assert_eq!(online[0].cid, "bob");

        // alice publishes data, bob receives it under alice's client id
        alice
            .handle_signal(
                &codec::encode(&Signalling::data("room1", b"hi bob".to_vec(), "").unwrap())
                    .unwrap(),
            )
            .await
            .unwrap();
        let data: Vec<Signalling> = conn_b
            .received()
            .into_iter()
            .filter(|sig| sig.sig_type == SigType::Data)
            .collect();
        assert_eq!(data.len(), 1);
        assert_eq!(data[0].cid, "alice");

        // alice leaves the node entirely
        alice.disconnect().await;
        assert_eq!(realm.find_channel("room1").unwrap().member_count(), 1);
        assert!(realm.peer("sid-a").is_none());

        let offline: Vec<Signalling> = conn_b
            .received()
            .into_iter()
            .filter(|sig| sig.opcode.as_deref() == Some(opcode::PEER_OFFLINE))
            .collect();
        assert_eq!(offline.len(), 1);
        assert_eq!(offline[0].sid, "sid-a");
        assert_eq!(offline[0].cid, "alice");
    }

    #[tokio::test]
    async fn test_scenario_two_nodes_over_mesh() {
        let mesh = InMemoryMesh::new();
        let node_a = RealmRegistry::new("node-a", Arc::new(mesh.clone()));
        let node_b = RealmRegistry::new("node-b", Arc::new(mesh.clone()));

        let realm_a = node_a.get_or_create("app", "").await;
        let realm_b = node_b.get_or_create("app", "").await;

        let conn_a = RecordingConnection::new("sid-a");
        let conn_b = RecordingConnection::new("sid-b");
        let alice = realm_a.add_peer(conn_a.clone(), "alice");
        let bob = realm_b.add_peer(conn_b.clone(), "bob");

        alice.join("room1").await;
        bob.join("room1").await;
        settle().await;

        // alice saw bob arrive from the other node
        let online: Vec<Signalling> = conn_a
            .received()
            .into_iter()
            .filter(|sig| sig.opcode.as_deref() == Some(opcode::PEER_ONLINE))
            .collect();
        assert_eq!(online.len(), 1);
        assert_eq!(online[0].cid, "bob");
        assert_eq!(online[0].mesh_id, "node-b");

        // data published on node a reaches bob on node b exactly once
        alice
            .broadcast_to_channel(Signalling::data("room1", b"cross-node".to_vec(), "").unwrap())
            .await;
        settle().await;

        let data: Vec<Signalling> = conn_b
            .received()
            .into_iter()
            .filter(|sig| sig.sig_type == SigType::Data)
            .collect();
        assert_eq!(data.len(), 1, "no duplicate and no relay loop");
        assert_eq!(data[0].cid, "alice");
        assert_eq!(data[0].app_id, "app");

        // the sender never hears its own broadcast back
        let echoed = conn_a
            .received()
            .iter()
            .filter(|sig| sig.sig_type == SigType::Data)
            .count();
        assert_eq!(echoed, 0);
    }

    #[tokio::test]
    async fn test_connection_counts() {
        let registry = new_local_registry();
        let realm = registry.get_or_create("app", "").await;

        let alice = realm.add_peer(RecordingConnection::new("sid-a"), "alice");
        let bob = realm.add_peer(RecordingConnection::new("sid-b"), "bob");
        alice.join("room1").await;
        alice.join("room2").await;
        bob.join("room1").await;

        let counts = registry.connection_counts();
        assert_eq!(counts.get("app"), Some(&3));

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].channels.len(), 2);
    }
}
