//! # beacon-core
//!
//! Membership and message-routing engine for the Beacon realtime presence
//! relay.
//!
//! One process hosts one [`RealmRegistry`]. Each [`Realm`] is the per-appID
//! registry of [`Channel`]s and [`Peer`]s on this node and owns the bridge to
//! the cross-node mesh. Raw bytes arrive on a [`Connection`], are decoded
//! into a signalling message, handed to the owning [`Peer`], applied to
//! Peer/Channel state, fanned out locally through the [`Channel`], and
//! optionally pushed to the mesh for the other nodes.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐    ┌──────┐    ┌─────────┐    ┌──────────────┐
//! │ Connection │───▶│ Peer │───▶│ Channel │───▶│ local fan-out│
//! └────────────┘    └──────┘    └─────────┘    └──────────────┘
//!                                    │
//!                                    ▼
//!                               ┌─────────┐    ┌──────────────┐
//!                               │  Realm  │───▶│  mesh bridge │
//!                               └─────────┘    └──────────────┘
//! ```

pub mod channel;
pub mod connection;
pub mod mesh;
pub mod peer;
pub mod realm;

pub use channel::Channel;
pub use connection::{Connection, ConnectionError, NoopConnection};
pub use mesh::{InMemoryMesh, MeshBridge, MeshError, MeshHandler, MeshSender, NoopMeshBridge};
pub use peer::Peer;
pub use realm::{ChannelSnapshot, PeerIdentity, Realm, RealmRegistry, RealmSnapshot};

#[cfg(test)]
pub(crate) mod test_support;
