//! TCP hole punching: race an outbound connect against an inbound accept on the discovery link's local port.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::network::NetworkContext;

/// Which half of the race produced the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PunchSide {
    Connected,
    Accepted,
}

/// IPv4 socket that may share its local port with the discovery link and the punch listener.
pub fn reusable_socket() -> io::Result<TcpSocket> {
    let socket = TcpSocket::new_v4()?;
    socket.set_reuseaddr(true)?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket.set_reuseport(true)?;
    Ok(socket)
}

type Ports = Arc<Mutex<HashMap<u16, PortListener>>>;

/// One listener per punch port, shared by every attempt in flight on it.
/// Accepted sockets go to the attempt waiting for that remote; strays are dropped.
#[derive(Default)]
pub struct PunchListeners {
    ports: Ports,
    next_waiter: AtomicU64,
}

struct PortListener {
    waiting: Vec<Waiting>,
    task: JoinHandle<()>,
}

struct Waiting {
    id: u64,
    remote: SocketAddrV4,
    tx: oneshot::Sender<TcpStream>,
}

/// An attempt's claim on inbound connections from `remote`. Dropping it withdraws the claim;
/// the last one out stops the listener.
pub struct Waiter {
    id: u64,
    local_port: u16,
    ports: Ports,
    rx: oneshot::Receiver<TcpStream>,
}

fn lock(ports: &Ports) -> MutexGuard<'_, HashMap<u16, PortListener>> {
    ports.lock().unwrap_or_else(|e| e.into_inner())
}

impl PunchListeners {
    /// Register interest in a connection from `remote` on `local_port`, binding the listener if needed.
    pub fn wait_for(&self, local_port: u16, remote: SocketAddrV4) -> io::Result<Waiter> {
        let id = self.next_waiter.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let waiting = Waiting { id, remote, tx };
        let mut ports = lock(&self.ports);
        match ports.get_mut(&local_port) {
            Some(port) => port.waiting.push(waiting),
            None => {
                let socket = reusable_socket()?;
                socket.bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, local_port)))?;
                let listener = socket.listen(16)?;
                let task = tokio::spawn(accept_loop(listener, local_port, self.ports.clone()));
                ports.insert(
                    local_port,
                    PortListener {
                        waiting: vec![waiting],
                        task,
                    },
                );
            }
        }
        Ok(Waiter {
            id,
            local_port,
            ports: self.ports.clone(),
            rx,
        })
    }

    pub fn is_listening(&self, local_port: u16) -> bool {
        lock(&self.ports).contains_key(&local_port)
    }
}

impl Waiter {
    pub async fn accept(&mut self) -> io::Result<TcpStream> {
        (&mut self.rx)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "punch listener stopped"))
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        let mut ports = lock(&self.ports);
        let Some(port) = ports.get_mut(&self.local_port) else {
            return;
        };
        port.waiting.retain(|w| w.id != self.id);
        if port.waiting.is_empty() {
            if let Some(port) = ports.remove(&self.local_port) {
                port.task.abort();
            }
        }
    }
}

/// Exact endpoint first, then anyone waiting on the same address.
fn claim(waiting: &mut Vec<Waiting>, from: SocketAddr) -> Option<Waiting> {
    let SocketAddr::V4(from) = from else {
        return None;
    };
    let i = waiting
        .iter()
        .position(|w| w.remote == from)
        .or_else(|| waiting.iter().position(|w| w.remote.ip() == from.ip()))?;
    Some(waiting.remove(i))
}

async fn accept_loop(listener: TcpListener, local_port: u16, ports: Ports) {
    loop {
        let (stream, from) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                log::warn!("punch listener on port {} failed: {}", local_port, e);
                // Dropping the senders fails every waiting accept.
                lock(&ports).remove(&local_port);
                return;
            }
        };
        let claimed = lock(&ports)
            .get_mut(&local_port)
            .and_then(|port| claim(&mut port.waiting, from));
        match claimed {
            Some(w) => {
                if w.tx.send(stream).is_err() {
                    log::debug!("punch attempt for {} ended before accept", w.remote);
                }
            }
            None => log::debug!("punch listener: ignoring {} on port {}", from, local_port),
        }
    }
}

/// Punch through to `remote` from `local_port` and promote the winning socket into a peer link.
/// Failure is logged; retrying is up to whoever asked.
pub fn spawn(ctx: Arc<NetworkContext>, local_port: u16, remote: SocketAddrV4) {
    tokio::spawn(async move {
        let attempt = punch_through(&ctx.punch_listeners, local_port, remote, ctx.punch_timeout);
        let result = tokio::select! {
            r = attempt => r,
            _ = ctx.stopped() => {
                log::debug!("punch-through to {} abandoned for shutdown", remote);
                return;
            }
        };
        match result {
            Ok((stream, side)) => {
                log::info!("punch-through to {} succeeded ({:?})", remote, side);
                ctx.spawn_peer(stream);
            }
            Err(e) => log::warn!("punch-through to {} failed: {}", remote, e),
        }
    });
}

/// Bind a connector to `local_port` and claim the port's listener for `remote`,
/// then race connect against accept. The loser is dropped, which closes its socket.
pub async fn punch_through(
    listeners: &PunchListeners,
    local_port: u16,
    remote: SocketAddrV4,
    deadline: Duration,
) -> io::Result<(TcpStream, PunchSide)> {
    let mut waiter = listeners.wait_for(local_port, remote)?;

    let connector = reusable_socket()?;
    connector.bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, local_port)))?;

    let connect = connector.connect(SocketAddr::V4(remote));
    let accept = waiter.accept();
    match tokio::time::timeout(deadline, race(connect, accept)).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("no link to {} within {:?}", remote, deadline),
        )),
    }
}

/// First success wins. A failed side drops out and the other keeps going;
/// if both fail the last error is returned.
async fn race<T, C, A>(connect: C, accept: A) -> io::Result<(T, PunchSide)>
where
    C: Future<Output = io::Result<T>>,
    A: Future<Output = io::Result<T>>,
{
    tokio::pin!(connect);
    tokio::pin!(accept);
    let mut connect_failed = false;
    let mut accept_failed = false;
    let mut last_err = None;
    loop {
        tokio::select! {
            r = &mut connect, if !connect_failed => match r {
                Ok(s) => return Ok((s, PunchSide::Connected)),
                Err(e) => {
                    log::debug!("punch connect failed: {}", e);
                    connect_failed = true;
                    last_err = Some(e);
                }
            },
            r = &mut accept, if !accept_failed => match r {
                Ok(s) => return Ok((s, PunchSide::Accepted)),
                Err(e) => {
                    log::debug!("punch accept failed: {}", e);
                    accept_failed = true;
                    last_err = Some(e);
                }
            },
            else => {
                return Err(last_err
                    .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "punch-through failed")));
            }
        }
    }
}
