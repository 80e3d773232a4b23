//! Envelope wire fields and the reserved protocol constants.
//!
//! The `message`/`workflow` payloads carried by an envelope are treated as
//! opaque bytes here; this module only concerns itself with the envelope's
//! own routing fields, matching the "opaque serialize/parse capability"
//! boundary this codec sits behind.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::time::{SystemTime, UNIX_EPOCH};

/// Reserved message type values understood by every peer in the mesh.
pub mod message_types {
    pub const PING: u32 = 1;
    pub const CONNECTION_WELCOME: u32 = 2;
    pub const BACKEND_FOR_PACKET_SEARCH: u32 = 3;
    pub const HEARTBIT: u32 = 4;
    pub const DELIVERY_ERROR: u32 = 5;
    pub const MAX_MULTIPLEXER_META_PACKET: u32 = 99;
    pub const REQUEST_RECEIVED: u32 = 113;
    pub const BACKEND_ERROR: u32 = 114;
}

/// Reserved peer type values.
pub mod peer_types {
    pub const MULTIPLEXER: u32 = 1;
    pub const ALL_TYPES: u32 = 2;
    pub const MAX_MULTIPLEXER_SPECIAL_PEER_TYPE: u32 = 99;
}

/// A single routed message on the bus.
///
/// `from_peer` names the `from` field of the original protocol; it is
/// renamed here because `from` is a Rust keyword.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub id: u64,
    pub from_peer: u64,
    pub to: Option<u64>,
    pub message_type: u32,
    pub timestamp: u32,
    pub references: Option<u64>,
    pub workflow: Option<Bytes>,
    pub message: Option<Bytes>,
}

impl Envelope {
    /// Builds a new envelope stamped with the current time, leaving
    /// `references`/`workflow`/`message` unset.
    pub fn new(id: u64, from_peer: u64, to: Option<u64>, message_type: u32) -> Self {
        Envelope {
            id,
            from_peer,
            to,
            message_type,
            timestamp: now_secs(),
            references: None,
            workflow: None,
            message: None,
        }
    }

    /// Builds a reply envelope, defaulting the routing fields the way a
    /// backend's automatic reply does: `to` becomes the request's sender,
    /// `references` becomes the request's id, and `workflow` is carried over.
    pub fn reply_to(request: &Envelope, id: u64, from_peer: u64, message_type: u32) -> Self {
        Envelope {
            id,
            from_peer,
            to: Some(request.from_peer),
            message_type,
            timestamp: now_secs(),
            references: Some(request.id),
            workflow: request.workflow.clone(),
            message: None,
        }
    }

    pub fn is_meta(&self) -> bool {
        self.message_type <= message_types::MAX_MULTIPLEXER_META_PACKET
    }

    /// Encodes this envelope's fields into `buf` using a flat,
    /// length-prefixed layout: presence byte + `u64`/`u32` fields in
    /// declaration order, followed by length-prefixed optional byte blobs.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.id);
        buf.put_u64_le(self.from_peer);
        encode_optional_u64(buf, self.to);
        buf.put_u32_le(self.message_type);
        buf.put_u32_le(self.timestamp);
        encode_optional_u64(buf, self.references);
        encode_optional_bytes(buf, self.workflow.as_deref());
        encode_optional_bytes(buf, self.message.as_deref());
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }

    pub fn decode(buf: &mut impl Buf) -> Option<Envelope> {
        if buf.remaining() < 16 {
            return None;
        }
        let id = buf.get_u64_le();
        let from_peer = buf.get_u64_le();
        let to = decode_optional_u64(buf)?;
        if buf.remaining() < 8 {
            return None;
        }
        let message_type = buf.get_u32_le();
        let timestamp = buf.get_u32_le();
        let references = decode_optional_u64(buf)?;
        let workflow = decode_optional_bytes(buf)?;
        let message = decode_optional_bytes(buf)?;
        Some(Envelope {
            id,
            from_peer,
            to,
            message_type,
            timestamp,
            references,
            workflow,
            message,
        })
    }
}

fn encode_optional_u64(buf: &mut BytesMut, value: Option<u64>) {
    match value {
        Some(v) => {
            buf.put_u8(1);
            buf.put_u64_le(v);
        }
        None => buf.put_u8(0),
    }
}

fn decode_optional_u64(buf: &mut impl Buf) -> Option<Option<u64>> {
    if buf.remaining() < 1 {
        return None;
    }
    let present = buf.get_u8();
    if present == 0 {
        return Some(None);
    }
    if buf.remaining() < 8 {
        return None;
    }
    Some(Some(buf.get_u64_le()))
}

fn encode_optional_bytes(buf: &mut BytesMut, value: Option<&[u8]>) {
    match value {
        Some(bytes) => {
            buf.put_u8(1);
            buf.put_u32_le(bytes.len() as u32);
            buf.put_slice(bytes);
        }
        None => buf.put_u8(0),
    }
}

fn decode_optional_bytes(buf: &mut impl Buf) -> Option<Option<Bytes>> {
    if buf.remaining() < 1 {
        return None;
    }
    let present = buf.get_u8();
    if present == 0 {
        return Some(None);
    }
    if buf.remaining() < 4 {
        return None;
    }
    let len = buf.get_u32_le() as usize;
    if buf.remaining() < len {
        return None;
    }
    Some(Some(buf.copy_to_bytes(len)))
}

/// A welcome message exchanged immediately after a connection is accepted,
/// establishing each side's peer type and instance id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Welcome {
    pub peer_type: u32,
    pub instance_id: u64,
    /// Absent means "no password configured", distinct from an empty one.
    pub multiplexer_password: Option<Bytes>,
}

impl Welcome {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.peer_type);
        buf.put_u64_le(self.instance_id);
        encode_optional_bytes(buf, self.multiplexer_password.as_deref());
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }

    pub fn decode(buf: &mut impl Buf) -> Option<Welcome> {
        if buf.remaining() < 12 {
            return None;
        }
        let peer_type = buf.get_u32_le();
        let instance_id = buf.get_u64_le();
        let multiplexer_password = decode_optional_bytes(buf)?;
        Some(Welcome {
            peer_type,
            instance_id,
            multiplexer_password,
        })
    }
}

fn now_secs() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips() {
        let mut env = Envelope::new(1, 2, Some(3), message_types::PING);
        env.references = Some(9);
        env.workflow = Some(Bytes::from_static(b"wf"));
        env.message = Some(Bytes::from_static(b"payload"));

        let bytes = env.to_bytes();
        let mut cursor = bytes.clone();
        let decoded = Envelope::decode(&mut cursor).unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn envelope_with_absent_optionals_round_trips() {
        let env = Envelope::new(5, 6, None, message_types::HEARTBIT);
        let bytes = env.to_bytes();
        let mut cursor = bytes.clone();
        let decoded = Envelope::decode(&mut cursor).unwrap();
        assert_eq!(decoded, env);
        assert!(decoded.to.is_none());
        assert!(decoded.workflow.is_none());
    }

    #[test]
    fn reply_to_defaults_routing_fields() {
        let mut request = Envelope::new(10, 20, Some(30), message_types::PING);
        request.workflow = Some(Bytes::from_static(b"wf"));
        let reply = Envelope::reply_to(&request, 11, 30, message_types::PING);
        assert_eq!(reply.to, Some(request.from_peer));
        assert_eq!(reply.references, Some(request.id));
        assert_eq!(reply.workflow, request.workflow);
    }

    #[test]
    fn welcome_distinguishes_absent_from_empty_password() {
        let without = Welcome {
            peer_type: peer_types::MULTIPLEXER,
            instance_id: 1,
            multiplexer_password: None,
        };
        let with_empty = Welcome {
            peer_type: peer_types::MULTIPLEXER,
            instance_id: 1,
            multiplexer_password: Some(Bytes::new()),
        };
        let mut a = without.to_bytes();
        let mut b = with_empty.to_bytes();
        assert_eq!(Welcome::decode(&mut a).unwrap().multiplexer_password, None);
        assert_eq!(
            Welcome::decode(&mut b).unwrap().multiplexer_password,
            Some(Bytes::new())
        );
    }

    #[test]
    fn is_meta_uses_reserved_ceiling() {
        let meta = Envelope::new(1, 1, None, message_types::BACKEND_FOR_PACKET_SEARCH);
        let app = Envelope::new(1, 1, None, 1000);
        assert!(meta.is_meta());
        assert!(!app.is_meta());
    }
}
