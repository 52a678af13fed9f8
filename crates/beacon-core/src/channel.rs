//! Channel: a named group of peers on one node, the local fan-out unit.

use dashmap::DashMap;
use futures_util::future::join_all;
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

use beacon_protocol::Signalling;

use crate::peer::Peer;
use crate::realm::Realm;

/// A named group of [`Peer`]s within one realm.
///
/// The member map and the realm back-reference are the only state; all
/// mutation goes through [`add_peer`](Channel::add_peer) and
/// [`remove_peer`](Channel::remove_peer), concurrent-safe from any peer task.
pub struct Channel {
    name: String,
    /// Members by session id.
    members: DashMap<String, Arc<Peer>>,
    /// Non-owning: the realm owns this channel's lifetime.
    realm: Weak<Realm>,
}

impl Channel {
    pub(crate) fn new(name: impl Into<String>, realm: Weak<Realm>) -> Self {
        Self {
            name: name.into(),
            members: DashMap::new(),
            realm,
        }
    }

    /// Channel name, unique within its realm.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a peer as a member.
    pub fn add_peer(&self, peer: &Arc<Peer>) {
        self.members.insert(peer.sid().to_string(), peer.clone());
        debug!(channel = %self.name, sid = %peer.sid(), "channel.add_peer");
    }

    /// Remove a member by session id. Returns whether it was present.
    pub fn remove_peer(&self, sid: &str) -> bool {
        let removed = self.members.remove(sid).is_some();
        if removed {
            debug!(channel = %self.name, sid = %sid, "channel.remove_peer");
        }
        removed
    }

    /// Whether `sid` is currently a member.
    #[must_use]
    pub fn is_member(&self, sid: &str) -> bool {
        self.members.contains_key(sid)
    }

    /// Current member count. Diagnostics only, never a control input.
    #[must_use]
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// `(sid, cid)` of every current member, for diagnostics.
    #[must_use]
    pub fn member_identities(&self) -> Vec<(String, String)> {
        self.members
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().cid()))
            .collect()
    }

    /// Fan a message out to this channel everywhere: stamp the realm's
    /// identifiers, relay to the mesh for the other nodes, deliver locally.
    ///
    /// Mesh relay is fire-and-forget: cross-node connectivity issues degrade
    /// presence propagation, never local delivery.
    pub async fn broadcast(&self, mut sig: Signalling) {
        if let Some(realm) = self.realm.upgrade() {
            sig.app_id = realm.id().to_string();
            sig.mesh_id = realm.mesh_id().to_string();

            let relay = sig.clone();
            tokio::spawn(async move {
                realm.broadcast_to_mesh(relay).await;
            });
        }

        self.dispatch(sig).await;
    }

    /// Deliver a message to local members only.
    ///
    /// This is the entry point for messages arriving from the mesh; it never
    /// re-forwards to the mesh, which is what prevents relay loops. The
    /// member whose sid matches the message sid is skipped: an originator
    /// never receives its own broadcast.
    ///
    /// Members are snapshotted at call time and each receives its own clone;
    /// deliveries run concurrently, so one stalled connection delays only its
    /// own delivery. Returns the number of members delivered to.
    pub async fn dispatch(&self, sig: Signalling) -> usize {
        let members: Vec<Arc<Peer>> = self
            .members
            .iter()
            .filter(|entry| entry.key().as_str() != sig.sid)
            .map(|entry| entry.value().clone())
            .collect();

        let count = members.len();
        trace!(channel = %self.name, count, sig = %sig, "channel.dispatch");

        join_all(members.into_iter().map(|peer| {
            let copy = sig.clone();
            async move {
                peer.notify_back(&copy).await;
            }
        }))
        .await;

        count
    }
}
