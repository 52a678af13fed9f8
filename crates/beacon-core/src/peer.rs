//! Peer: per-connection session state and the signal dispatch table.

use dashmap::DashMap;
use std::sync::{Arc, RwLock, Weak};
use tracing::{error, info, trace, warn};

use beacon_protocol::{codec, opcode, ProtocolError, SigType, Signalling};

use crate::channel::Channel;
use crate::connection::Connection;
use crate::realm::Realm;

/// Server-side state for one connected client.
///
/// `sid` is derived from the connection's remote address and unique per
/// node; `cid` is the client-assigned identity and may be rebound through a
/// peer-state signal. The peer is created after a connection is accepted and
/// authenticated, and destroyed by [`disconnect`](Peer::disconnect).
pub struct Peer {
    sid: String,
    cid: RwLock<String>,
    /// Channels this peer has joined, by name.
    channels: DashMap<String, Arc<Channel>>,
    conn: Arc<dyn Connection>,
    /// Non-owning: the realm owns this peer's lifetime.
    realm: Weak<Realm>,
}

impl Peer {
    pub(crate) fn new(
        conn: Arc<dyn Connection>,
        cid: impl Into<String>,
        realm: Weak<Realm>,
    ) -> Self {
        Self {
            sid: conn.remote_addr().to_string(),
            cid: RwLock::new(cid.into()),
            channels: DashMap::new(),
            conn,
            realm,
        }
    }

    /// Node-local session id.
    #[must_use]
    pub fn sid(&self) -> &str {
        &self.sid
    }

    /// Client-assigned identity.
    #[must_use]
    pub fn cid(&self) -> String {
        self.cid.read().unwrap().clone()
    }

    fn rebind_cid(&self, cid: &str) {
        *self.cid.write().unwrap() = cid.to_string();
        info!(sid = %self.sid, cid = %cid, "peer state rebound client id");
    }

    /// Whether this peer has joined `channel_name`.
    #[must_use]
    pub fn is_member(&self, channel_name: &str) -> bool {
        self.channels.contains_key(channel_name)
    }

    /// Names of every channel this peer has joined.
    #[must_use]
    pub fn channel_names(&self) -> Vec<String> {
        self.channels.iter().map(|e| e.key().clone()).collect()
    }

    /// Join a channel on the owning realm, creating it if needed.
    ///
    /// Re-joining an already-joined channel leaves the membership untouched
    /// but still acknowledges, so a retrying client always observes the ACK.
    /// The remaining members are notified with a peer-online signal.
    pub async fn join(self: &Arc<Self>, channel_name: &str) {
        let Some(realm) = self.realm.upgrade() else {
            warn!(sid = %self.sid, "join after realm was dropped");
            return;
        };

        if !self.channels.contains_key(channel_name) {
            let channel = loop {
                let channel = realm.get_or_add_channel(channel_name);
                channel.add_peer(self);
                // An empty-channel reclamation may race the insert; re-check
                // that we joined the instance the registry still holds.
                match realm.find_channel(channel_name) {
                    Some(current) if Arc::ptr_eq(&current, &channel) => break channel,
                    _ => {
                        channel.remove_peer(&self.sid);
                    }
                }
            };
            self.channels
                .insert(channel_name.to_string(), channel.clone());

            channel
                .broadcast(Signalling::peer_online(channel_name, &self.sid, self.cid()))
                .await;
        }

        self.notify_back(&Signalling::channel_joined(channel_name))
            .await;
        info!(sid = %self.sid, cid = %self.cid(), channel = %channel_name, "peer.join ACK");
    }

    /// Leave a channel and notify the remaining members.
    ///
    /// Logged no-op when the channel is unknown to the realm.
    pub async fn leave(&self, channel_name: &str) {
        self.channels.remove(channel_name);

        let Some(realm) = self.realm.upgrade() else {
            return;
        };
        let Some(channel) = realm.find_channel(channel_name) else {
            warn!(sid = %self.sid, channel = %channel_name, "leave: channel unknown to realm");
            return;
        };

        channel.remove_peer(&self.sid);
        channel
            .broadcast(Signalling::peer_offline(channel_name, &self.sid, self.cid()))
            .await;
        realm.reclaim_channel_if_empty(channel_name);

        info!(sid = %self.sid, channel = %channel_name, "peer.leave");
    }

    /// Tear this peer down: leave every joined channel, then deregister from
    /// the realm. Safe to call when nothing is joined and the registry entry
    /// is already gone; a second call is a harmless no-op.
    pub async fn disconnect(&self) {
        info!(sid = %self.sid, "peer.disconnect");

        for channel_name in self.channel_names() {
            self.leave(&channel_name).await;
        }

        if let Some(realm) = self.realm.upgrade() {
            realm.remove_peer(&self.sid);
        }
    }

    /// Encode and write a message back to this peer's own connection.
    ///
    /// Write failures are logged, not retried, not surfaced: repeated
    /// failures surface to the transport layer as a dead connection.
    pub async fn notify_back(&self, sig: &Signalling) {
        let buf = match codec::encode(sig) {
            Ok(buf) => buf,
            Err(err) => {
                error!(sid = %self.sid, error = %err, "notify_back encode failed");
                return;
            }
        };

        if let Err(err) = self.conn.write(&buf).await {
            error!(sid = %self.sid, error = %err, "notify_back write failed");
        }
        trace!(sid = %self.sid, sig = %sig, "SND>");
    }

    /// Stamp the message with this peer's `cid` and fan it out into a channel
    /// this peer has joined.
    ///
    /// The channel is resolved through the peer's own membership map, not the
    /// realm registry: a peer may only broadcast into channels it is a member
    /// of. Logged no-op otherwise.
    pub async fn broadcast_to_channel(&self, mut sig: Signalling) {
        sig.cid = self.cid();

        let Some(channel) = self.channels.get(&sig.channel).map(|e| e.value().clone()) else {
            warn!(sid = %self.sid, channel = %sig.channel, "broadcast into channel this peer has not joined");
            return;
        };

        channel.broadcast(sig).await;
    }

    /// Decode one signalling message from the wire and dispatch it.
    ///
    /// The sender's `sid` is stamped here, overwriting whatever the wire
    /// carried. A decode failure is the one error that propagates: the
    /// transport layer decides whether the stream itself is unrecoverable.
    pub async fn handle_signal(self: &Arc<Self>, raw: &[u8]) -> Result<(), ProtocolError> {
        let mut sig = codec::decode(raw).map_err(|err| {
            warn!(sid = %self.sid, error = %err, "signal decode failed, dropped");
            err
        })?;

        sig.sid = self.sid.clone();
        trace!(sid = %self.sid, sig = %sig, ">RCV");

        match sig.sig_type {
            SigType::Control => match sig.opcode.as_deref() {
                Some(opcode::CHANNEL_JOIN) => self.join(&sig.channel).await,
                Some(opcode::PEER_STATE) => {
                    // sid was stamped above, so the both-set guard reduces to
                    // a non-empty client id.
                    if !sig.cid.is_empty() {
                        self.rebind_cid(&sig.cid);
                    }
                    self.broadcast_to_channel(sig).await;
                }
                Some(opcode::PEER_OFFLINE) => self.leave(&sig.channel).await,
                Some(opcode::PEER_ONLINE) => self.broadcast_to_channel(sig).await,
                other => {
                    warn!(sid = %self.sid, opcode = ?other, "unknown control opcode, dropped");
                }
            },
            SigType::Data => self.broadcast_to_channel(sig).await,
        }

        Ok(())
    }
}
