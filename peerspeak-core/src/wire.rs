//! Framing: 13 byte big-endian header + raw payload of `payload_length` bytes.

use std::net::{Ipv4Addr, SocketAddrV4};

use crate::protocol::{
    Channel, MessageHeader, MessageKind, PeerId, ACCEPT_PAYLOAD_LEN, CONNECT_PAYLOAD_LEN,
    HEADER_LEN, PEER_ID_PAYLOAD_LEN,
};

/// One decoded frame: header plus its payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: MessageHeader,
    pub payload: Vec<u8>,
}

/// Check `len` against the payload contract of `kind`.
pub fn validate_payload(kind: MessageKind, len: usize) -> Result<(), WireError> {
    if kind == MessageKind::Invalid {
        return Err(WireError::InvalidKind);
    }
    if let Some(expected) = kind.fixed_payload_len() {
        if len != expected {
            return Err(WireError::InvalidPayload {
                kind,
                expected,
                actual: len,
            });
        }
    }
    if len > u16::MAX as usize {
        return Err(WireError::PayloadTooLarge(len));
    }
    Ok(())
}

/// Encode one frame. Fails before producing any bytes if the payload breaks the kind's contract.
pub fn encode(
    kind: MessageKind,
    sequence: u16,
    sender_id: PeerId,
    payload: &[u8],
) -> Result<Vec<u8>, WireError> {
    validate_payload(kind, payload.len())?;
    let header = MessageHeader {
        sender_id,
        sequence,
        kind,
        payload_length: payload.len() as u16,
    };
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&encode_header(&header));
    out.extend_from_slice(payload);
    Ok(out)
}

/// Encode for a specific channel: the discovery server only takes a subset of kinds.
pub fn encode_for(
    channel: Channel,
    kind: MessageKind,
    sequence: u16,
    sender_id: PeerId,
    payload: &[u8],
) -> Result<Vec<u8>, WireError> {
    if !channel.allows_outbound(kind) {
        return Err(WireError::NotAllowed { kind, channel });
    }
    encode(kind, sequence, sender_id, payload)
}

pub fn encode_header(header: &MessageHeader) -> [u8; HEADER_LEN] {
    let mut out = [0u8; HEADER_LEN];
    out[0..8].copy_from_slice(&header.sender_id.to_be_bytes());
    out[8..10].copy_from_slice(&header.sequence.to_be_bytes());
    out[10] = header.kind.code();
    out[11..13].copy_from_slice(&header.payload_length.to_be_bytes());
    out
}

/// Decode a header. Always succeeds; unknown kind codes decode as `Invalid`.
/// The caller then reads exactly `payload_length` more bytes.
pub fn decode_header(bytes: &[u8; HEADER_LEN]) -> MessageHeader {
    let mut id = [0u8; 8];
    id.copy_from_slice(&bytes[0..8]);
    MessageHeader {
        sender_id: PeerId::from_be_bytes(id),
        sequence: u16::from_be_bytes([bytes[8], bytes[9]]),
        kind: MessageKind::from_code(bytes[10]),
        payload_length: u16::from_be_bytes([bytes[11], bytes[12]]),
    }
}

/// Decode one frame from the front of `bytes`. Returns the frame and the number of bytes consumed.
/// Call with partial buffer; returns `NeedMore` until a whole frame is present.
pub fn decode_frame(bytes: &[u8]) -> Result<(Frame, usize), FrameDecodeError> {
    if bytes.len() < HEADER_LEN {
        return Err(FrameDecodeError::NeedMore);
    }
    let mut head = [0u8; HEADER_LEN];
    head.copy_from_slice(&bytes[..HEADER_LEN]);
    let header = decode_header(&head);
    let end = HEADER_LEN + header.payload_length as usize;
    if bytes.len() < end {
        return Err(FrameDecodeError::NeedMore);
    }
    let frame = Frame {
        header,
        payload: bytes[HEADER_LEN..end].to_vec(),
    };
    Ok((frame, end))
}

/// `CONNECT` payload: IPv4 address then port, both big-endian.
pub fn encode_endpoint(addr: SocketAddrV4) -> [u8; CONNECT_PAYLOAD_LEN] {
    let mut out = [0u8; CONNECT_PAYLOAD_LEN];
    out[..4].copy_from_slice(&addr.ip().octets());
    out[4..].copy_from_slice(&addr.port().to_be_bytes());
    out
}

pub fn decode_endpoint(payload: &[u8]) -> Result<SocketAddrV4, WireError> {
    let b: [u8; CONNECT_PAYLOAD_LEN] = payload.try_into().map_err(|_| WireError::InvalidPayload {
        kind: MessageKind::Connect,
        expected: CONNECT_PAYLOAD_LEN,
        actual: payload.len(),
    })?;
    let ip = Ipv4Addr::new(b[0], b[1], b[2], b[3]);
    Ok(SocketAddrV4::new(ip, u16::from_be_bytes([b[4], b[5]])))
}

/// `OPEN`/`ADD`/`REMOVE` payload.
pub fn decode_peer_id(kind: MessageKind, payload: &[u8]) -> Result<PeerId, WireError> {
    let b: [u8; PEER_ID_PAYLOAD_LEN] =
        payload.try_into().map_err(|_| WireError::InvalidPayload {
            kind,
            expected: PEER_ID_PAYLOAD_LEN,
            actual: payload.len(),
        })?;
    Ok(PeerId::from_be_bytes(b))
}

pub fn encode_accept(accept: bool) -> [u8; ACCEPT_PAYLOAD_LEN] {
    [accept as u8]
}

/// Any non-zero byte reads as true.
pub fn decode_accept(payload: &[u8]) -> Result<bool, WireError> {
    match payload {
        [b] => Ok(*b != 0),
        _ => Err(WireError::InvalidPayload {
            kind: MessageKind::Accept,
            expected: ACCEPT_PAYLOAD_LEN,
            actual: payload.len(),
        }),
    }
}

/// Text payloads (`CHAT`, `ERROR`). Invalid UTF-8 is replaced rather than rejected.
pub fn decode_text(payload: &[u8]) -> String {
    String::from_utf8_lossy(payload).into_owned()
}

/// Error building an outbound frame. Always a caller bug, never a network fault.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WireError {
    #[error("{kind} expects a {expected} byte payload, got {actual}")]
    InvalidPayload {
        kind: MessageKind,
        expected: usize,
        actual: usize,
    },
    #[error("cannot send INVALID message")]
    InvalidKind,
    #[error("payload of {0} bytes does not fit a frame")]
    PayloadTooLarge(usize),
    #[error("{kind} may not be sent on the {channel} channel")]
    NotAllowed { kind: MessageKind, channel: Channel },
}

/// Error decoding a frame from a partial buffer.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
}
