//! PeerSpeak wire protocol: message kinds, header layout, peer identity.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Header size on the wire: sender id (8) + sequence (2) + kind (1) + payload length (2).
pub const HEADER_LEN: usize = 8 + 2 + 1 + 2;

/// Payload size of `CONNECT`: IPv4 address + port.
pub const CONNECT_PAYLOAD_LEN: usize = 6;

/// Payload size of `OPEN`, `ADD` and `REMOVE`: one peer id.
pub const PEER_ID_PAYLOAD_LEN: usize = 8;

/// Payload size of `ACCEPT`: one boolean byte.
pub const ACCEPT_PAYLOAD_LEN: usize = 1;

/// Node identifier, chosen by each node. Globally meaningful across the mesh.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub u64);

impl PeerId {
    /// Pick a random id for a node that was not configured with one.
    pub fn random() -> Self {
        PeerId(rand::random())
    }

    pub fn to_be_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    pub fn from_be_bytes(bytes: [u8; 8]) -> Self {
        PeerId(u64::from_be_bytes(bytes))
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for PeerId {
    fn from(v: u64) -> Self {
        PeerId(v)
    }
}

/// All message kinds. The wire code is the enum discriminant.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    /// Candidate endpoint for punch-through: 4 byte IPv4 address, 2 byte port.
    Connect = 0,
    /// Handshake id announcement on peer links; open request on the discovery link.
    Open = 1,
    /// Reserved: add a peer to relay to (8 byte id).
    Add = 2,
    /// Reserved: remove a relay peer (8 byte id).
    Remove = 3,
    /// Answer to an open request, 1 byte boolean.
    Accept = 4,
    /// Error text from the discovery server.
    Error = 5,
    /// Chat text.
    Chat = 6,
    /// Parse-failure sentinel. Never sent.
    Invalid = 7,
}

impl MessageKind {
    /// Map a wire code to a kind. Unknown codes become `Invalid`.
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => MessageKind::Connect,
            1 => MessageKind::Open,
            2 => MessageKind::Add,
            3 => MessageKind::Remove,
            4 => MessageKind::Accept,
            5 => MessageKind::Error,
            6 => MessageKind::Chat,
            _ => MessageKind::Invalid,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    /// Fixed payload size for this kind, or `None` for variable-length text kinds.
    /// `Invalid` has no payload contract at all and is rejected before this is consulted.
    pub fn fixed_payload_len(self) -> Option<usize> {
        match self {
            MessageKind::Connect => Some(CONNECT_PAYLOAD_LEN),
            MessageKind::Open | MessageKind::Add | MessageKind::Remove => {
                Some(PEER_ID_PAYLOAD_LEN)
            }
            MessageKind::Accept => Some(ACCEPT_PAYLOAD_LEN),
            MessageKind::Error | MessageKind::Chat | MessageKind::Invalid => None,
        }
    }

    /// Kinds that are flooded across established peer links.
    pub fn is_relayed(self) -> bool {
        matches!(
            self,
            MessageKind::Chat | MessageKind::Add | MessageKind::Remove
        )
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageKind::Connect => "CONNECT",
            MessageKind::Open => "OPEN",
            MessageKind::Add => "ADD",
            MessageKind::Remove => "REMOVE",
            MessageKind::Accept => "ACCEPT",
            MessageKind::Error => "ERROR",
            MessageKind::Chat => "CHAT",
            MessageKind::Invalid => "INVALID",
        };
        f.write_str(s)
    }
}

/// Fixed-size frame header. All integers are big-endian on the wire.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct MessageHeader {
    pub sender_id: PeerId,
    pub sequence: u16,
    pub kind: MessageKind,
    pub payload_length: u16,
}

impl MessageHeader {
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint {
            sender_id: self.sender_id,
            sequence: self.sequence,
        }
    }
}

/// Identity of one logical message, however many relay paths it arrives by.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct Fingerprint {
    pub sender_id: PeerId,
    pub sequence: u16,
}

/// Which side a link talks to. The discovery server accepts only a subset of kinds.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Channel {
    Peer,
    Discovery,
}

impl Channel {
    /// Whether this node may send `kind` on the channel.
    pub fn allows_outbound(self, kind: MessageKind) -> bool {
        match self {
            Channel::Peer => kind != MessageKind::Invalid,
            Channel::Discovery => matches!(
                kind,
                MessageKind::Open | MessageKind::Accept | MessageKind::Error
            ),
        }
    }

    /// Whether a frame of `kind` received on the channel is handled.
    pub fn accepts_inbound(self, kind: MessageKind) -> bool {
        match self {
            Channel::Peer => kind.is_relayed(),
            Channel::Discovery => matches!(
                kind,
                MessageKind::Connect | MessageKind::Open | MessageKind::Error
            ),
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Peer => f.write_str("peer"),
            Channel::Discovery => f.write_str("discovery"),
        }
    }
}
