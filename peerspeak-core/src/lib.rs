//! PeerSpeak relay protocol.
//! No I/O: the node drives sockets and hands frames to the codec and registry.

pub mod events;
pub mod protocol;
pub mod registry;
pub mod wire;

pub use events::{Command, Frontend, NodeEvent};
pub use protocol::{Channel, Fingerprint, MessageHeader, MessageKind, PeerId, HEADER_LEN};
pub use registry::{LinkId, RegistryError, RelayLink, RelayOutcome, RelayRegistry};
pub use wire::{decode_frame, decode_header, encode, encode_for, Frame, FrameDecodeError, WireError};
