//! Peer link: OPEN handshake with deadline, then read/relay/dispatch until the stream ends.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use peerspeak_core::registry::{LinkId, RelayLink};
use peerspeak_core::wire;
use peerspeak_core::{
    Channel, MessageHeader, MessageKind, NodeEvent, PeerId, RelayOutcome, WireError, HEADER_LEN,
};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::Notify;

use crate::network::NetworkContext;
use crate::stream::{self, Outbox};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Handshaking,
    Established,
    Closed,
}

/// Registry-facing handle of an established link. Owned by its connection task;
/// the registry holds it weakly.
pub struct PeerHandle {
    pub link_id: LinkId,
    pub peer_id: PeerId,
    pub remote: Option<SocketAddr>,
    outbox: Outbox,
    close: Notify,
}

impl PeerHandle {
    /// Ask the owning task to close the link. Safe to call repeatedly.
    pub fn close(&self) {
        self.close.notify_one();
    }
}

impl RelayLink for PeerHandle {
    fn link_id(&self) -> LinkId {
        self.link_id
    }

    fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    fn send_frame(&self, frame: &[u8]) {
        self.outbox.send_raw(frame.to_vec());
    }
}

/// Why a handshake did not produce an established link.
enum HandshakeFailure {
    TimedOut,
    Transport(io::Error),
    Duplicate(PeerId),
    Stopped,
}

pub struct PeerConnection {
    ctx: Arc<NetworkContext>,
    link_id: LinkId,
    remote: Option<SocketAddr>,
    state: ConnectionState,
    reader: OwnedReadHalf,
    outbox: Outbox,
    handle: Option<Arc<PeerHandle>>,
}

impl PeerConnection {
    /// Take ownership of a connected socket and enter Handshaking: our OPEN goes out immediately.
    pub fn new(stream: TcpStream, ctx: Arc<NetworkContext>) -> Self {
        let link_id = ctx.next_link_id();
        let remote = stream.peer_addr().ok();
        let label = match remote {
            Some(addr) => format!("link {} ({})", link_id, addr),
            None => format!("link {}", link_id),
        };
        let (reader, writer) = stream.into_split();
        let (outbox, _writer_task) = Outbox::spawn(writer, Channel::Peer, label);
        let conn = Self {
            ctx,
            link_id,
            remote,
            state: ConnectionState::Handshaking,
            reader,
            outbox,
            handle: None,
        };
        let self_id = conn.ctx.self_id();
        if let Err(e) = conn.write(MessageKind::Open, 0, &self_id.to_be_bytes()) {
            log::error!("cannot frame handshake OPEN: {}", e);
        }
        conn
    }

    /// Queue a frame authored by this node. Never waits on the socket.
    pub fn write(&self, kind: MessageKind, sequence: u16, payload: &[u8]) -> Result<(), WireError> {
        self.outbox
            .write(kind, sequence, self.ctx.self_id(), payload)
    }

    /// Drive the link from Handshaking to Closed.
    pub async fn run(mut self) {
        match self.handshake().await {
            Ok(()) => self.serve().await,
            Err(HandshakeFailure::TimedOut) => {
                log::warn!("{}: handshake timed out", self.describe());
                self.ctx
                    .emit(NodeEvent::Error("Error: Socket timed out".to_string()));
            }
            Err(HandshakeFailure::Transport(e)) if stream::is_eof(&e) => {
                log::debug!("{}: closed during handshake", self.describe());
            }
            Err(HandshakeFailure::Transport(e)) => {
                log::warn!("{}: read error during handshake: {}", self.describe(), e);
            }
            Err(HandshakeFailure::Stopped) => {
                log::debug!("{}: shutting down during handshake", self.describe());
            }
            Err(HandshakeFailure::Duplicate(id)) => {
                log::warn!(
                    "{}: peer {} already connected, refusing duplicate link",
                    self.describe(),
                    id
                );
            }
        }
        self.close().await;
    }

    async fn handshake(&mut self) -> Result<(), HandshakeFailure> {
        let ctx = self.ctx.clone();
        let deadline = ctx.handshake_timeout;
        let opened = tokio::select! {
            r = tokio::time::timeout(deadline, self.read_open()) => r,
            _ = ctx.stopped() => return Err(HandshakeFailure::Stopped),
        };
        let peer_id = match opened {
            Ok(Ok(id)) => id,
            Ok(Err(e)) => return Err(HandshakeFailure::Transport(e)),
            Err(_) => return Err(HandshakeFailure::TimedOut),
        };
        let handle = Arc::new(PeerHandle {
            link_id: self.link_id,
            peer_id,
            remote: self.remote,
            outbox: self.outbox.clone(),
            close: Notify::new(),
        });
        if self.ctx.registry.lock().await.register(&handle).is_err() {
            return Err(HandshakeFailure::Duplicate(peer_id));
        }
        self.handle = Some(handle);
        self.state = ConnectionState::Established;
        log::info!(
            "established connection from {}, id {}",
            self.remote
                .map(|a| a.to_string())
                .unwrap_or_else(|| "?".into()),
            peer_id
        );
        self.ctx.emit(NodeEvent::PeerConnected(peer_id));
        Ok(())
    }

    /// Wait for a well-formed OPEN. Anything else is consumed and ignored.
    async fn read_open(&mut self) -> io::Result<PeerId> {
        loop {
            let (header, frame) = stream::read_frame(&mut self.reader).await?;
            let payload = &frame[HEADER_LEN..];
            if header.kind == MessageKind::Open {
                match wire::decode_peer_id(MessageKind::Open, payload) {
                    Ok(id) => return Ok(id),
                    Err(e) => log::debug!("link {}: bad handshake OPEN: {}", self.link_id, e),
                }
            } else {
                log::debug!(
                    "link {}: ignoring {} before handshake",
                    self.link_id,
                    header.kind
                );
            }
        }
    }

    async fn serve(&mut self) {
        let Some(handle) = self.handle.clone() else {
            return;
        };
        let ctx = self.ctx.clone();
        loop {
            let read = tokio::select! {
                r = stream::read_frame(&mut self.reader) => r,
                _ = handle.close.notified() => {
                    log::debug!("{}: close requested", self.describe());
                    return;
                }
                _ = ctx.stopped() => {
                    log::debug!("{}: closing for shutdown", self.describe());
                    return;
                }
            };
            match read {
                Ok((header, frame)) => self.dispatch(header, frame).await,
                Err(e) if stream::is_eof(&e) => {
                    log::debug!("{}: end of stream", self.describe());
                    return;
                }
                Err(e) => {
                    log::warn!("{}: read error: {}", self.describe(), e);
                    return;
                }
            }
        }
    }

    /// One frame on an established link: dedup, flood, then local handling.
    async fn dispatch(&mut self, header: MessageHeader, frame: Vec<u8>) {
        if !Channel::Peer.accepts_inbound(header.kind) {
            log::debug!(
                "{}: dropping {} from {}, not valid on a peer link",
                self.describe(),
                header.kind,
                header.sender_id
            );
            return;
        }
        let payload = &frame[HEADER_LEN..];
        if let Err(e) = wire::validate_payload(header.kind, payload.len()) {
            log::debug!("{}: dropping malformed frame: {}", self.describe(), e);
            return;
        }
        let outcome = self
            .ctx
            .registry
            .lock()
            .await
            .relay(self.link_id, &header, &frame);
        match outcome {
            RelayOutcome::Duplicate => {
                log::trace!(
                    "duplicate {} ({}, {})",
                    header.kind,
                    header.sender_id,
                    header.sequence
                );
            }
            RelayOutcome::Relayed { forwarded } => {
                log::trace!(
                    "{} ({}, {}) relayed to {} peers",
                    header.kind,
                    header.sender_id,
                    header.sequence,
                    forwarded
                );
                match header.kind {
                    MessageKind::Chat => {
                        let text = wire::decode_text(payload);
                        log::info!("chat from {}: {}", header.sender_id, text);
                        self.ctx.emit(NodeEvent::Chat {
                            peer_id: header.sender_id,
                            text,
                        });
                    }
                    // Reserved.
                    MessageKind::Add | MessageKind::Remove => {}
                    _ => {}
                }
            }
        }
    }

    /// Enter Closed. Deregisters and reports the disconnect exactly once.
    pub async fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.state = ConnectionState::Closed;
        if let Some(handle) = self.handle.take() {
            let removed = self
                .ctx
                .registry
                .lock()
                .await
                .deregister(handle.peer_id, handle.link_id);
            if removed {
                log::info!("connection id {} closed", handle.peer_id);
                self.ctx.emit(NodeEvent::PeerDisconnected(handle.peer_id));
                self.ctx.notify_link_closed();
            }
        }
    }

    fn describe(&self) -> String {
        match (&self.handle, self.remote) {
            (Some(h), _) => format!("peer {}", h.peer_id),
            (None, Some(addr)) => format!("link {} ({})", self.link_id, addr),
            (None, None) => format!("link {}", self.link_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::tests::{next_event, start, WAIT};
    use peerspeak_core::wire::encode;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Connect a raw socket to `addr` and complete the handshake as `id`.
    async fn raw_peer(addr: SocketAddr, id: u64) -> TcpStream {
        let mut s = TcpStream::connect(addr).await.unwrap();
        let mut open = [0u8; HEADER_LEN + 8];
        s.read_exact(&mut open).await.unwrap();
        let ours = encode(MessageKind::Open, 0, PeerId(id), &id.to_be_bytes()).unwrap();
        s.write_all(&ours).await.unwrap();
        s
    }

    #[tokio::test]
    async fn relayed_frame_is_forwarded_byte_for_byte() {
        let mut node = start(1, WAIT).await;
        let mut x = raw_peer(node.addr, 50).await;
        assert_eq!(next_event(&mut node).await, NodeEvent::PeerConnected(PeerId(50)));
        let mut y = raw_peer(node.addr, 60).await;
        assert_eq!(next_event(&mut node).await, NodeEvent::PeerConnected(PeerId(60)));

        // Authored by 99, arriving from 50: goes to 60 unmodified, dispatched locally.
        let chat = encode(MessageKind::Chat, 7, PeerId(99), b"relay me").unwrap();
        x.write_all(&chat).await.unwrap();
        let mut got = vec![0u8; chat.len()];
        y.read_exact(&mut got).await.unwrap();
        assert_eq!(got, chat);
        assert_eq!(
            next_event(&mut node).await,
            NodeEvent::Chat {
                peer_id: PeerId(99),
                text: "relay me".into()
            }
        );

        // Same fingerprint again from the other side: neither relayed nor dispatched.
        y.write_all(&chat).await.unwrap();
        // A fresh frame afterwards proves the stream stayed framed.
        let next = encode(MessageKind::Chat, 8, PeerId(99), b"second").unwrap();
        y.write_all(&next).await.unwrap();
        assert_eq!(
            next_event(&mut node).await,
            NodeEvent::Chat {
                peer_id: PeerId(99),
                text: "second".into()
            }
        );
        let mut got = vec![0u8; next.len()];
        x.read_exact(&mut got).await.unwrap();
        assert_eq!(got, next);
    }

    #[tokio::test]
    async fn message_never_sent_back_to_its_origin() {
        let mut node = start(1, WAIT).await;
        let mut origin = raw_peer(node.addr, 50).await;
        next_event(&mut node).await;
        let mut via = raw_peer(node.addr, 60).await;
        next_event(&mut node).await;

        // Authored by 50 but arriving through 60.
        let chat = encode(MessageKind::Chat, 1, PeerId(50), b"loop").unwrap();
        via.write_all(&chat).await.unwrap();
        assert!(matches!(next_event(&mut node).await, NodeEvent::Chat { .. }));

        let mut buf = [0u8; 1];
        let r = tokio::time::timeout(
            std::time::Duration::from_millis(200),
            origin.read(&mut buf),
        )
        .await;
        assert!(r.is_err(), "origin must not receive its own message");
    }

    #[tokio::test]
    async fn control_kinds_are_dropped_without_losing_framing() {
        let mut node = start(1, WAIT).await;
        let mut x = raw_peer(node.addr, 50).await;
        next_event(&mut node).await;

        let stray_open = encode(MessageKind::Open, 1, PeerId(50), &7u64.to_be_bytes()).unwrap();
        let stray_error = encode(MessageKind::Error, 2, PeerId(50), b"noise").unwrap();
        let short_add = {
            let mut f = encode(MessageKind::Chat, 3, PeerId(50), &[1, 2, 3]).unwrap();
            f[10] = MessageKind::Add.code();
            f
        };
        let chat = encode(MessageKind::Chat, 4, PeerId(50), b"still here").unwrap();
        for f in [stray_open, stray_error, short_add, chat] {
            x.write_all(&f).await.unwrap();
        }
        assert_eq!(
            next_event(&mut node).await,
            NodeEvent::Chat {
                peer_id: PeerId(50),
                text: "still here".into()
            }
        );
    }

    #[tokio::test]
    async fn reset_closes_only_that_link() {
        let mut node = start(1, WAIT).await;
        let x = raw_peer(node.addr, 50).await;
        next_event(&mut node).await;
        let mut y = raw_peer(node.addr, 60).await;
        next_event(&mut node).await;

        // Linger zero makes the drop send RST instead of FIN.
        x.set_linger(Some(std::time::Duration::ZERO)).unwrap();
        drop(x);
        assert_eq!(
            next_event(&mut node).await,
            NodeEvent::PeerDisconnected(PeerId(50))
        );
        assert!(!node.ctx.registry.lock().await.contains(PeerId(50)));

        let chat = encode(MessageKind::Chat, 1, PeerId(60), b"still up").unwrap();
        y.write_all(&chat).await.unwrap();
        assert_eq!(
            next_event(&mut node).await,
            NodeEvent::Chat {
                peer_id: PeerId(60),
                text: "still up".into()
            }
        );
        assert!(node.events.try_recv().is_err());
        assert_eq!(node.ctx.registry.lock().await.peers(), vec![PeerId(60)]);
    }

    #[tokio::test]
    async fn transport_close_moves_to_closed() {
        let mut node = start(1, WAIT).await;
        let x = raw_peer(node.addr, 50).await;
        next_event(&mut node).await;
        drop(x);
        assert_eq!(
            next_event(&mut node).await,
            NodeEvent::PeerDisconnected(PeerId(50))
        );
        assert!(!node.ctx.registry.lock().await.contains(PeerId(50)));
    }
}
