//! # beacon-protocol
//!
//! Signalling wire format for the Beacon realtime presence relay.
//!
//! A [`Signalling`] value is the unit of communication everywhere in the
//! system: client to node, node to client, and node to node across the mesh.
//! Messages are encoded as a single map-keyed MessagePack value, so every
//! field is tagged on the wire and unknown optional fields are ignored on
//! decode.
//!
//! ## Example
//!
//! ```rust
//! use beacon_protocol::{codec, Signalling};
//!
//! let sig = Signalling::data("room1", b"hello".to_vec(), "alice").unwrap();
//! let encoded = codec::encode(&sig).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(sig, decoded);
//! ```

pub mod codec;
pub mod signal;

pub use codec::{decode, encode, marshal_data_sig, MeshTag, ProtocolError};
pub use signal::{opcode, SigType, Signalling};
