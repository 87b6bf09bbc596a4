//! Network loop: owns the relay registry, marshals front-end commands, runs the direct listener.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use peerspeak_core::registry::DEFAULT_FINGERPRINT_CAPACITY;
use peerspeak_core::{wire, Command, MessageHeader, MessageKind, NodeEvent, PeerId, RelayRegistry};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex, Notify};

use crate::connection::{PeerConnection, PeerHandle};
use crate::discovery::DiscoveryLink;
use crate::punch::PunchListeners;

/// How long shutdown waits for peer links to finish closing.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Tunables for the network loop.
#[derive(Debug, Clone)]
pub struct Settings {
    pub self_id: PeerId,
    pub handshake_timeout: Duration,
    pub punch_timeout: Duration,
    pub fingerprint_capacity: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            self_id: PeerId::random(),
            handshake_timeout: Duration::from_secs(10),
            punch_timeout: Duration::from_secs(10),
            fingerprint_capacity: DEFAULT_FINGERPRINT_CAPACITY,
        }
    }
}

/// State shared by every task on the loop. Created at loop start, gone when the loop stops.
pub struct NetworkContext {
    self_id: AtomicU64,
    sequence: AtomicU16,
    next_link: AtomicU64,
    pub registry: Mutex<RelayRegistry<PeerHandle>>,
    pub discovery: Mutex<Option<DiscoveryLink>>,
    events: mpsc::UnboundedSender<NodeEvent>,
    /// Woken whenever a registered link closes.
    link_closed: Notify,
    /// Flips to true once when the loop starts shutting down.
    stopping: watch::Sender<bool>,
    pub punch_listeners: PunchListeners,
    pub handshake_timeout: Duration,
    pub punch_timeout: Duration,
}

impl NetworkContext {
    pub fn self_id(&self) -> PeerId {
        PeerId(self.self_id.load(Ordering::Relaxed))
    }

    pub fn set_self_id(&self, id: PeerId) {
        self.self_id.store(id.0, Ordering::Relaxed);
    }

    /// Next sequence number for a frame this node originates. Wraps at u16::MAX.
    pub fn next_sequence(&self) -> u16 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    pub fn next_link_id(&self) -> u64 {
        self.next_link.fetch_add(1, Ordering::Relaxed)
    }

    /// Deliver an event to the front end. A front end that went away is not an error.
    pub fn emit(&self, event: NodeEvent) {
        let _ = self.events.send(event);
    }

    pub fn is_stopping(&self) -> bool {
        *self.stopping.borrow()
    }

    /// Resolves once shutdown has begun; immediately if it already has.
    pub async fn stopped(&self) {
        let mut rx = self.stopping.subscribe();
        let _ = rx.wait_for(|stopping| *stopping).await;
    }

    pub fn notify_link_closed(&self) {
        self.link_closed.notify_waiters();
    }

    /// Flood a chat line this node authored.
    pub async fn broadcast_chat(&self, text: &str) -> Result<usize, wire::WireError> {
        let sequence = self.next_sequence();
        let frame = wire::encode(MessageKind::Chat, sequence, self.self_id(), text.as_bytes())?;
        let header = MessageHeader {
            sender_id: self.self_id(),
            sequence,
            kind: MessageKind::Chat,
            payload_length: text.len() as u16,
        };
        let sent = self.registry.lock().await.broadcast(&header, &frame);
        log::debug!("chat seq {} sent to {} peers", sequence, sent);
        Ok(sent)
    }

    /// Promote a connected socket into a peer link and run it to completion on its own task.
    pub fn spawn_peer(self: &Arc<Self>, stream: TcpStream) {
        if self.is_stopping() {
            log::debug!("shutting down, dropping new peer socket");
            return;
        }
        let conn = PeerConnection::new(stream, self.clone());
        tokio::spawn(conn.run());
    }
}

/// Front-end side handle. Cloneable, usable from any thread.
#[derive(Clone)]
pub struct NodeHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl NodeHandle {
    /// Queue a command for the network loop. Returns false once the loop has stopped.
    pub fn send(&self, command: Command) -> bool {
        self.commands.send(command).is_ok()
    }

    pub fn connect_to_discovery(&self, address: &str, port: u16, self_id: PeerId) -> bool {
        self.send(Command::ConnectToDiscovery {
            address: address.to_string(),
            port,
            self_id,
        })
    }

    pub fn connect_peer(&self, addr: SocketAddr) -> bool {
        self.send(Command::ConnectPeer(addr))
    }

    pub fn request_open(&self, peer_id: PeerId) -> bool {
        self.send(Command::RequestOpen(peer_id))
    }

    pub fn respond_to_open(&self, accept: bool) -> bool {
        self.send(Command::RespondToOpen(accept))
    }

    pub fn broadcast_chat(&self, text: &str) -> bool {
        self.send(Command::BroadcastChat(text.to_string()))
    }

    pub fn shutdown(&self) -> bool {
        self.send(Command::Shutdown)
    }

    /// True once the loop has stopped taking commands.
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

/// The loop itself. Build with [`Network::new`], then `listen` and `run` inside the runtime.
pub struct Network {
    ctx: Arc<NetworkContext>,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl Network {
    pub fn new(settings: Settings) -> (Self, NodeHandle, mpsc::UnboundedReceiver<NodeEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let ctx = Arc::new(NetworkContext {
            self_id: AtomicU64::new(settings.self_id.0),
            sequence: AtomicU16::new(rand::random()),
            next_link: AtomicU64::new(1),
            registry: Mutex::new(RelayRegistry::new(settings.fingerprint_capacity)),
            discovery: Mutex::new(None),
            events: events_tx,
            link_closed: Notify::new(),
            stopping: watch::channel(false).0,
            punch_listeners: PunchListeners::default(),
            handshake_timeout: settings.handshake_timeout,
            punch_timeout: settings.punch_timeout,
        });
        let network = Self {
            ctx,
            commands: commands_rx,
        };
        (
            network,
            NodeHandle {
                commands: commands_tx,
            },
            events_rx,
        )
    }

    pub fn context(&self) -> Arc<NetworkContext> {
        self.ctx.clone()
    }

    /// Accept direct peer connections on `port` (0 picks one). Returns the bound address.
    pub async fn listen(&self, port: u16) -> std::io::Result<SocketAddr> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        let local = listener.local_addr()?;
        log::info!("listening for peers on {}", local);
        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    r = listener.accept() => r,
                    _ = ctx.stopped() => {
                        log::debug!("peer listener on {} stopped", local);
                        break;
                    }
                };
                match accepted {
                    Ok((stream, from)) => {
                        log::debug!("accepted peer socket from {}", from);
                        ctx.spawn_peer(stream);
                    }
                    Err(e) => {
                        log::warn!("peer listener stopped: {}", e);
                        break;
                    }
                }
            }
        });
        Ok(local)
    }

    /// Process commands until `Shutdown` or until every handle is dropped.
    pub async fn run(mut self) {
        while let Some(command) = self.commands.recv().await {
            if !self.handle(command).await {
                break;
            }
        }
        self.shutdown().await;
    }

    async fn handle(&self, command: Command) -> bool {
        let ctx = &self.ctx;
        match command {
            Command::ConnectToDiscovery {
                address,
                port,
                self_id,
            } => {
                ctx.set_self_id(self_id);
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    match DiscoveryLink::connect(&address, port, ctx.clone()).await {
                        Ok(link) => {
                            let mut slot = ctx.discovery.lock().await;
                            if ctx.is_stopping() {
                                link.close();
                            } else if let Some(old) = slot.replace(link) {
                                old.close();
                            }
                        }
                        Err(e) => {
                            log::error!("discovery connect to {}:{} failed: {}", address, port, e);
                            ctx.emit(NodeEvent::Error(format!(
                                "Could not connect to discovery server {}:{}: {}",
                                address, port, e
                            )));
                        }
                    }
                });
            }
            Command::ConnectPeer(addr) => {
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    match TcpStream::connect(addr).await {
                        Ok(stream) => ctx.spawn_peer(stream),
                        Err(e) => {
                            log::warn!("connect to {} failed: {}", addr, e);
                            ctx.emit(NodeEvent::Error(format!(
                                "Could not connect to {}: {}",
                                addr, e
                            )));
                        }
                    }
                });
            }
            Command::RequestOpen(peer_id) => {
                self.to_discovery(MessageKind::Open, &peer_id.to_be_bytes())
                    .await;
            }
            Command::RespondToOpen(accept) => {
                self.to_discovery(MessageKind::Accept, &wire::encode_accept(accept))
                    .await;
            }
            Command::BroadcastChat(text) => {
                if let Err(e) = ctx.broadcast_chat(&text).await {
                    ctx.emit(NodeEvent::Error(format!("Chat not sent: {}", e)));
                }
            }
            Command::Shutdown => return false,
        }
        true
    }

    async fn to_discovery(&self, kind: MessageKind, payload: &[u8]) {
        let ctx = &self.ctx;
        let guard = ctx.discovery.lock().await;
        let result = match guard.as_ref() {
            Some(link) if link.is_connected() => {
                link.write(kind, ctx.next_sequence(), ctx.self_id(), payload)
            }
            _ => {
                ctx.emit(NodeEvent::Error(
                    "Not connected to a discovery server".to_string(),
                ));
                return;
            }
        };
        if let Err(e) = result {
            log::error!("refused to send {} to discovery: {}", kind, e);
            ctx.emit(NodeEvent::Error(e.to_string()));
        }
    }

    /// Stop accepting, close every link including those still handshaking,
    /// then wait (bounded) for registered ones to deregister.
    async fn shutdown(&self) {
        let ctx = &self.ctx;
        log::info!("network shutting down");
        ctx.stopping.send_replace(true);
        if let Some(link) = ctx.discovery.lock().await.take() {
            link.close();
        }
        for link in ctx.registry.lock().await.links() {
            link.close();
        }
        loop {
            let closed = ctx.link_closed.notified();
            if ctx.registry.lock().await.is_empty() {
                break;
            }
            if tokio::time::timeout(SHUTDOWN_GRACE, closed).await.is_err() {
                log::warn!("peer links still open after {:?}", SHUTDOWN_GRACE);
                break;
            }
        }
    }
}
