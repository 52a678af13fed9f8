//! The `Signalling` message and its constructors.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::codec::ProtocolError;

/// Top-level signalling type.
///
/// This is a closed set on the wire: any other value fails decode, and the
/// transport layer decides what to do with the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum SigType {
    /// Membership and presence control traffic.
    Control,
    /// Application payload traffic.
    Data,
}

impl From<SigType> for String {
    fn from(t: SigType) -> String {
        match t {
            SigType::Control => "control".to_string(),
            SigType::Data => "data".to_string(),
        }
    }
}

impl TryFrom<String> for SigType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "control" => Ok(SigType::Control),
            "data" => Ok(SigType::Data),
            other => Err(format!("illegal signalling type: {other}")),
        }
    }
}

impl fmt::Display for SigType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SigType::Control => write!(f, "control"),
            SigType::Data => write!(f, "data"),
        }
    }
}

/// Control opcodes.
///
/// Opcodes travel as open strings: a node drops unrecognized opcodes at
/// dispatch instead of failing the decode, so newer peers can introduce
/// opcodes without breaking older nodes.
pub mod opcode {
    /// Client to server: request to join a channel. Server to client: the
    /// join has been acknowledged.
    pub const CHANNEL_JOIN: &str = "channel_join";
    /// A peer left a channel; carries the departing peer's identifiers.
    pub const PEER_OFFLINE: &str = "peer_offline";
    /// A peer joined a channel, notified to the remaining members.
    pub const PEER_ONLINE: &str = "peer_online";
    /// A peer announces or rebinds its client identity and state.
    pub const PEER_STATE: &str = "peer_state";
}

/// A signalling message.
///
/// `sid` is the node-local session id and is always stamped by the node that
/// terminates the client connection; a value arriving from the wire is never
/// trusted. `cid` is the client-assigned identity and is opaque here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signalling {
    /// Signalling type.
    #[serde(rename = "t")]
    pub sig_type: SigType,

    /// Control opcode, meaningless for Data signals.
    #[serde(rename = "op", default, skip_serializing_if = "Option::is_none")]
    pub opcode: Option<String>,

    /// Target channel name.
    #[serde(rename = "c")]
    pub channel: String,

    /// Session id of the sender on its node, server-assigned.
    #[serde(rename = "sid", default, skip_serializing_if = "String::is_empty")]
    pub sid: String,

    /// Opaque payload bytes.
    #[serde(
        rename = "pl",
        default,
        skip_serializing_if = "Option::is_none",
        with = "serde_bytes"
    )]
    pub payload: Option<Vec<u8>>,

    /// Client-assigned identity of the sender.
    #[serde(rename = "p")]
    pub cid: String,

    /// Application the message belongs to.
    #[serde(rename = "app", default, skip_serializing_if = "String::is_empty")]
    pub app_id: String,

    /// Mesh node the message was stamped by.
    #[serde(rename = "mesh", default, skip_serializing_if = "String::is_empty")]
    pub mesh_id: String,
}

impl Signalling {
    fn control(op: &str, channel: impl Into<String>) -> Self {
        Self {
            sig_type: SigType::Control,
            opcode: Some(op.to_string()),
            channel: channel.into(),
            sid: String::new(),
            payload: None,
            cid: String::new(),
            app_id: String::new(),
            mesh_id: String::new(),
        }
    }

    /// Acknowledgment that the receiving peer has joined `channel`.
    #[must_use]
    pub fn channel_joined(channel: impl Into<String>) -> Self {
        Self::control(opcode::CHANNEL_JOIN, channel)
    }

    /// Notification that the peer identified by `sid`/`cid` left `channel`.
    #[must_use]
    pub fn peer_offline(
        channel: impl Into<String>,
        sid: impl Into<String>,
        cid: impl Into<String>,
    ) -> Self {
        let mut sig = Self::control(opcode::PEER_OFFLINE, channel);
        sig.sid = sid.into();
        sig.cid = cid.into();
        sig
    }

    /// Notification that the peer identified by `sid`/`cid` joined `channel`.
    #[must_use]
    pub fn peer_online(
        channel: impl Into<String>,
        sid: impl Into<String>,
        cid: impl Into<String>,
    ) -> Self {
        let mut sig = Self::control(opcode::PEER_ONLINE, channel);
        sig.sid = sid.into();
        sig.cid = cid.into();
        sig
    }

    /// Build a Data signal for `channel` with an arbitrary payload.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::EmptyChannel`] when `channel` is empty.
    pub fn data(
        channel: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        cid: impl Into<String>,
    ) -> Result<Self, ProtocolError> {
        let channel = channel.into();
        if channel.is_empty() {
            return Err(ProtocolError::EmptyChannel);
        }
        Ok(Self {
            sig_type: SigType::Data,
            opcode: None,
            channel,
            sid: String::new(),
            payload: Some(payload.into()),
            cid: cid.into(),
            app_id: String::new(),
            mesh_id: String::new(),
        })
    }

    /// Payload length in bytes, zero when absent.
    #[must_use]
    pub fn payload_len(&self) -> usize {
        self.payload.as_ref().map_or(0, Vec::len)
    }
}

impl fmt::Display for Signalling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "mesh:{} app:{} type:{} op:{} ch:{} sid:{} cid:{} payload:({})",
            self.mesh_id,
            self.app_id,
            self.sig_type,
            self.opcode.as_deref().unwrap_or(""),
            self.channel,
            self.sid,
            self.cid,
            self.payload_len(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_joined_is_well_formed() {
        let sig = Signalling::channel_joined("room1");
        assert_eq!(sig.sig_type, SigType::Control);
        assert_eq!(sig.opcode.as_deref(), Some(opcode::CHANNEL_JOIN));
        assert_eq!(sig.channel, "room1");
        assert!(sig.payload.is_none());
    }

    #[test]
    fn test_peer_offline_carries_identifiers() {
        let sig = Signalling::peer_offline("room1", "127.0.0.1:4000", "alice");
        assert_eq!(sig.opcode.as_deref(), Some(opcode::PEER_OFFLINE));
        assert_eq!(sig.sid, "127.0.0.1:4000");
        assert_eq!(sig.cid, "alice");
    }

    #[test]
    fn test_data_requires_channel() {
        assert!(matches!(
            Signalling::data("", b"x".to_vec(), "alice"),
            Err(ProtocolError::EmptyChannel)
        ));

        let sig = Signalling::data("room1", b"x".to_vec(), "alice").unwrap();
        assert_eq!(sig.sig_type, SigType::Data);
        assert!(sig.opcode.is_none());
        assert_eq!(sig.payload_len(), 1);
    }

    #[test]
    fn test_clone_is_value_independent() {
        let mut original = Signalling::data("room1", b"abc".to_vec(), "alice").unwrap();
        let copy = original.clone();

        original.payload.as_mut().unwrap()[0] = b'z';
        original.cid.push_str("-mutated");

        assert_eq!(copy.payload.as_deref(), Some(&b"abc"[..]));
        assert_eq!(copy.cid, "alice");
    }

    #[test]
    fn test_sig_type_rejects_unknown() {
        assert!(SigType::try_from("control".to_string()).is_ok());
        assert!(SigType::try_from("bogus".to_string()).is_err());
    }

    #[test]
    fn test_display_includes_payload_length() {
        let sig = Signalling::data("room1", vec![0u8; 16], "alice").unwrap();
        assert!(sig.to_string().contains("payload:(16)"));
    }
}
