//! MessagePack codec for `Signalling` values.
//!
//! One message is exactly one map-keyed MessagePack value. There is no length
//! prefix: both supported transports are message-oriented (WebSocket binary
//! messages, QUIC datagrams) and already delimit messages.

use bytes::Bytes;
use thiserror::Error;

use crate::signal::Signalling;

/// Distinguishes logical channels of mesh traffic.
pub type MeshTag = u32;

/// Mesh data tags a node observes and sends on.
pub mod tags {
    use super::MeshTag;

    /// Signalling relayed between nodes.
    pub const PRESENCE: MeshTag = 0x20;
    /// Signalling originated by backend functions.
    pub const BACKEND: MeshTag = 0x21;
}

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A Data signal was built without a target channel.
    #[error("channel is required")]
    EmptyChannel,

    /// MessagePack encoding error.
    #[error("encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// Encode a signalling message to bytes.
///
/// # Errors
///
/// Returns an error if MessagePack encoding fails.
pub fn encode(sig: &Signalling) -> Result<Bytes, ProtocolError> {
    let buf = rmp_serde::to_vec_named(sig)?;
    Ok(Bytes::from(buf))
}

/// Decode a signalling message from bytes.
///
/// Never panics on malformed input; unknown optional fields are ignored.
///
/// # Errors
///
/// Returns an error if the bytes are not a valid signalling message.
pub fn decode(data: &[u8]) -> Result<Signalling, ProtocolError> {
    Ok(rmp_serde::from_slice(data)?)
}

/// Build and encode a Data signal for backend-originated traffic.
///
/// Returns the mesh tag the message should be sent on together with the
/// encoded bytes.
///
/// # Errors
///
/// Returns [`ProtocolError::EmptyChannel`] when `channel` is empty; no bytes
/// are produced in that case.
pub fn marshal_data_sig(
    channel: &str,
    payload: impl Into<Vec<u8>>,
    cid: &str,
) -> Result<(MeshTag, Bytes), ProtocolError> {
    let sig = Signalling::data(channel, payload, cid)?;
    Ok((tags::BACKEND, encode(&sig)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::{opcode, SigType};
    use serde::Serialize;

    fn full_sig() -> Signalling {
        Signalling {
            sig_type: SigType::Control,
            opcode: Some(opcode::PEER_STATE.to_string()),
            channel: "room1".to_string(),
            sid: "127.0.0.1:4000".to_string(),
            payload: Some(b"state".to_vec()),
            cid: "alice".to_string(),
            app_id: "app-1".to_string(),
            mesh_id: "node-eu-1".to_string(),
        }
    }

    #[test]
    fn test_roundtrip_every_field() {
        let sig = full_sig();
        let encoded = encode(&sig).unwrap();
        let decoded = decode(&encoded).unwrap();
        assert_eq!(sig, decoded);
    }

    #[test]
    fn test_roundtrip_absent_and_empty_payload() {
        let mut sig = full_sig();

        sig.payload = None;
        let decoded = decode(&encode(&sig).unwrap()).unwrap();
        assert_eq!(decoded.payload, None);

        sig.payload = Some(Vec::new());
        let decoded = decode(&encode(&sig).unwrap()).unwrap();
        assert_eq!(decoded.payload, Some(Vec::new()));
    }

    #[test]
    fn test_roundtrip_omitted_optionals() {
        let sig = Signalling::channel_joined("room1");
        let decoded = decode(&encode(&sig).unwrap()).unwrap();
        assert_eq!(sig, decoded);
        assert!(decoded.sid.is_empty());
        assert!(decoded.app_id.is_empty());
    }

    #[test]
    fn test_decode_malformed_is_an_error() {
        assert!(decode(b"").is_err());
        assert!(decode(&[0xc1]).is_err());
        assert!(decode(b"\xdenot msgpack at all").is_err());
    }

    #[test]
    fn test_decode_illegal_type_is_an_error() {
        #[derive(Serialize)]
        struct Bogus<'a> {
            t: &'a str,
            c: &'a str,
            p: &'a str,
        }

        let buf = rmp_serde::to_vec_named(&Bogus {
            t: "telemetry",
            c: "room1",
            p: "alice",
        })
        .unwrap();
        assert!(matches!(decode(&buf), Err(ProtocolError::Decode(_))));
    }

    #[test]
    fn test_decode_ignores_unknown_fields() {
        #[derive(Serialize)]
        struct Extended<'a> {
            t: &'a str,
            c: &'a str,
            p: &'a str,
            hops: u32,
            trace: &'a str,
        }

        let buf = rmp_serde::to_vec_named(&Extended {
            t: "data",
            c: "room1",
            p: "alice",
            hops: 3,
            trace: "abc123",
        })
        .unwrap();

        let decoded = decode(&buf).unwrap();
        assert_eq!(decoded.sig_type, SigType::Data);
        assert_eq!(decoded.channel, "room1");
        assert_eq!(decoded.cid, "alice");
    }

    #[test]
    fn test_marshal_data_sig() {
        let (tag, buf) = marshal_data_sig("room1", b"hello".to_vec(), "backend-fn").unwrap();
        assert_eq!(tag, tags::BACKEND);

        let decoded = decode(&buf).unwrap();
        assert_eq!(decoded.sig_type, SigType::Data);
        assert_eq!(decoded.channel, "room1");
        assert_eq!(decoded.payload.as_deref(), Some(&b"hello"[..]));
        assert_eq!(decoded.cid, "backend-fn");
    }

    #[test]
    fn test_marshal_data_sig_empty_channel() {
        assert!(matches!(
            marshal_data_sig("", b"hello".to_vec(), "backend-fn"),
            Err(ProtocolError::EmptyChannel)
        ));
    }
}
