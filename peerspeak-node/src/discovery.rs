//! Discovery link: one connection to the rendezvous server. Announces our id, receives
//! punch-through candidates and open requests. Losing it is fatal to networking.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use peerspeak_core::wire;
use peerspeak_core::{Channel, MessageHeader, MessageKind, NodeEvent, PeerId, WireError, HEADER_LEN};
use tokio::net::tcp::OwnedReadHalf;
use tokio::task::JoinHandle;

use crate::network::NetworkContext;
use crate::punch;
use crate::stream::{self, Outbox};

pub const DISCOVERY_LOST: &str = "Critical: lost connection to discovery server";

pub struct DiscoveryLink {
    outbox: Outbox,
    local_addr: SocketAddr,
    reader: JoinHandle<()>,
}

impl DiscoveryLink {
    /// Connect from a port that punch-through can reuse, announce our id, start reading.
    pub async fn connect(address: &str, port: u16, ctx: Arc<NetworkContext>) -> io::Result<Self> {
        let remote = resolve_v4(address, port).await?;
        let socket = punch::reusable_socket()?;
        socket.bind(SocketAddr::from(([0, 0, 0, 0], 0)))?;
        let stream = socket.connect(remote).await?;
        let local_addr = stream.local_addr()?;
        log::info!("connected to discovery server {} from {}", remote, local_addr);

        let (reader, writer) = stream.into_split();
        let (outbox, writer_task) =
            Outbox::spawn(writer, Channel::Discovery, format!("discovery {}", remote));
        let self_id = ctx.self_id();
        outbox
            .write(
                MessageKind::Open,
                ctx.next_sequence(),
                self_id,
                &self_id.to_be_bytes(),
            )
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let reader = tokio::spawn(read_loop(reader, ctx, local_addr.port(), writer_task));
        Ok(Self {
            outbox,
            local_addr,
            reader,
        })
    }

    /// Queue a frame for the server. Kinds outside the discovery subset are refused here.
    pub fn write(
        &self,
        kind: MessageKind,
        sequence: u16,
        sender_id: PeerId,
        payload: &[u8],
    ) -> Result<(), WireError> {
        self.outbox.write(kind, sequence, sender_id, payload)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_connected(&self) -> bool {
        !self.reader.is_finished() && !self.outbox.is_closed()
    }

    /// Stop reading. Not reported as a loss.
    pub fn close(&self) {
        self.reader.abort();
    }
}

async fn resolve_v4(address: &str, port: u16) -> io::Result<SocketAddr> {
    tokio::net::lookup_host((address, port))
        .await?
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no IPv4 address for {}", address),
            )
        })
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    ctx: Arc<NetworkContext>,
    local_port: u16,
    writer_task: JoinHandle<()>,
) {
    loop {
        match stream::read_frame(&mut reader).await {
            Ok((header, frame)) => handle_frame(&ctx, local_port, &header, &frame[HEADER_LEN..]),
            Err(e) if stream::is_eof(&e) => break,
            Err(e) => {
                log::error!("discovery read error: {}", e);
                break;
            }
        }
    }
    writer_task.abort();
    log::error!("{}", DISCOVERY_LOST);
    ctx.emit(NodeEvent::Error(DISCOVERY_LOST.to_string()));
}

fn handle_frame(
    ctx: &Arc<NetworkContext>,
    local_port: u16,
    header: &MessageHeader,
    payload: &[u8],
) {
    if !Channel::Discovery.accepts_inbound(header.kind) {
        log::debug!("ignoring {} from discovery server", header.kind);
        return;
    }
    match header.kind {
        MessageKind::Connect => match wire::decode_endpoint(payload) {
            Ok(endpoint) => {
                log::info!("CONNECT request to {}", endpoint);
                punch::spawn(ctx.clone(), local_port, endpoint);
            }
            Err(e) => log::debug!("bad CONNECT from discovery server: {}", e),
        },
        MessageKind::Open => match wire::decode_peer_id(MessageKind::Open, payload) {
            Ok(id) => {
                log::info!("OPEN request from {}", id);
                ctx.emit(NodeEvent::OpenRequest(id));
            }
            Err(e) => log::debug!("bad OPEN from discovery server: {}", e),
        },
        MessageKind::Error => {
            let msg = wire::decode_text(payload);
            log::warn!("discovery server error: {}", msg);
            ctx.emit(NodeEvent::Error(msg));
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::tests::{expect_connected, next_event, start, WAIT};
    use peerspeak_core::wire::{encode, encode_endpoint};
    use std::net::{Ipv4Addr, SocketAddrV4};
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream};

    const SERVER_ID: PeerId = PeerId(0);

    async fn read_frame_from(s: &mut TcpStream) -> (MessageHeader, Vec<u8>) {
        let (h, f) = stream::read_frame(s).await.unwrap();
        (h, f[HEADER_LEN..].to_vec())
    }

    #[tokio::test]
    async fn announces_and_relays_server_messages() {
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = server.local_addr().unwrap().port();
        let mut node = start(1, WAIT).await;
        node.handle.connect_to_discovery("127.0.0.1", port, PeerId(42));
        let (mut s, _) = server.accept().await.unwrap();

        let (h, p) = read_frame_from(&mut s).await;
        assert_eq!(h.kind, MessageKind::Open);
        assert_eq!(h.sender_id, PeerId(42));
        assert_eq!(p, 42u64.to_be_bytes());

        let open = encode(MessageKind::Open, 0, SERVER_ID, &77u64.to_be_bytes()).unwrap();
        let chat = encode(MessageKind::Chat, 1, SERVER_ID, b"not for you").unwrap();
        let error = encode(MessageKind::Error, 2, SERVER_ID, b"no such peer").unwrap();
        for f in [open, chat, error] {
            s.write_all(&f).await.unwrap();
        }
        assert_eq!(next_event(&mut node).await, NodeEvent::OpenRequest(PeerId(77)));
        assert_eq!(
            next_event(&mut node).await,
            NodeEvent::Error("no such peer".into())
        );

        node.handle.request_open(PeerId(5));
        let (h, p) = read_frame_from(&mut s).await;
        assert_eq!((h.kind, h.sender_id), (MessageKind::Open, PeerId(42)));
        assert_eq!(p, 5u64.to_be_bytes());

        node.handle.respond_to_open(true);
        let (h, p) = read_frame_from(&mut s).await;
        assert_eq!(h.kind, MessageKind::Accept);
        assert_eq!(p, vec![1]);

        drop(s);
        assert_eq!(
            next_event(&mut node).await,
            NodeEvent::Error(DISCOVERY_LOST.into())
        );
        node.handle.respond_to_open(false);
        assert!(matches!(next_event(&mut node).await, NodeEvent::Error(_)));
    }

    #[tokio::test]
    async fn connect_candidate_is_punched_and_promoted() {
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = server.local_addr().unwrap().port();
        let mut a = start(1, WAIT).await;
        let mut b = start(2, WAIT).await;
        a.handle.connect_to_discovery("127.0.0.1", port, PeerId(1));
        let (mut s, _) = server.accept().await.unwrap();
        read_frame_from(&mut s).await;

        // Point A at B's listener; A dials it from the discovery port.
        let candidate = SocketAddrV4::new(Ipv4Addr::LOCALHOST, b.addr.port());
        let connect = encode(MessageKind::Connect, 0, SERVER_ID, &encode_endpoint(candidate)).unwrap();
        s.write_all(&connect).await.unwrap();

        expect_connected(&mut a, 2).await;
        expect_connected(&mut b, 1).await;
        let discovery_port = a
            .ctx
            .discovery
            .lock()
            .await
            .as_ref()
            .map(|l| l.local_addr().port())
            .unwrap();
        let from = b
            .ctx
            .registry
            .lock()
            .await
            .get(PeerId(1))
            .and_then(|h| h.remote)
            .unwrap();
        assert_eq!(from.port(), discovery_port, "punched from the discovery port");
        drop(s);
    }
}
