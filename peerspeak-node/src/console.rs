//! Line-oriented console front end: stdin becomes commands, events are printed.

use std::io::{self, BufRead, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::thread::{self, JoinHandle};

use peerspeak_core::{Command, Frontend, PeerId};

use crate::config::split_host_port;
use crate::network::NodeHandle;

pub const HELP: &str = "commands: /discover host:port, /connect host:port, /open <id>, /accept, /reject, /quit; anything else is chat";

/// Prints events to `out`, one line each.
pub struct Console<W: Write> {
    out: W,
}

impl<W: Write> Console<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    fn line(&mut self, args: std::fmt::Arguments<'_>) {
        if let Err(e) = writeln!(self.out, "{}", args).and_then(|_| self.out.flush()) {
            log::warn!("console write failed: {}", e);
        }
    }
}

impl<W: Write> Frontend for Console<W> {
    fn on_peer_connected(&mut self, peer_id: PeerId) {
        self.line(format_args!("* peer {} connected", peer_id));
    }

    fn on_peer_disconnected(&mut self, peer_id: PeerId) {
        self.line(format_args!("* peer {} disconnected", peer_id));
    }

    fn on_open_request(&mut self, peer_id: PeerId) {
        self.line(format_args!(
            "* peer {} wants to open a link (/accept or /reject)",
            peer_id
        ));
    }

    fn on_chat(&mut self, peer_id: PeerId, text: &str) {
        self.line(format_args!("<{}> {}", peer_id, text));
    }

    fn on_error(&mut self, message: &str) {
        self.line(format_args!("! {}", message));
    }
}

/// Turn one input line into a command. `Ok(None)` means nothing to do.
pub fn parse_command(line: &str, self_id: PeerId) -> Result<Option<Command>, String> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return Ok(None);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Some(Command::BroadcastChat(line.to_string())));
    };
    let (word, arg) = match rest.split_once(char::is_whitespace) {
        Some((w, a)) => (w, a.trim()),
        None => (rest, ""),
    };
    let command = match word {
        "discover" => {
            let (host, port) =
                split_host_port(arg).ok_or_else(|| "usage: /discover host:port".to_string())?;
            Command::ConnectToDiscovery {
                address: host.to_string(),
                port,
                self_id,
            }
        }
        "connect" => Command::ConnectPeer(resolve(arg)?),
        "open" => {
            let id = arg
                .parse::<u64>()
                .map_err(|_| format!("not a peer id: {:?}", arg))?;
            Command::RequestOpen(PeerId(id))
        }
        "accept" => Command::RespondToOpen(true),
        "reject" => Command::RespondToOpen(false),
        "quit" => Command::Shutdown,
        "help" => return Err(HELP.to_string()),
        other => return Err(format!("unknown command /{}; {}", other, HELP)),
    };
    Ok(Some(command))
}

fn resolve(arg: &str) -> Result<SocketAddr, String> {
    split_host_port(arg).ok_or_else(|| "usage: /connect host:port".to_string())?;
    arg.to_socket_addrs()
        .map_err(|e| format!("cannot resolve {}: {}", arg, e))?
        .next()
        .ok_or_else(|| format!("no address for {}", arg))
}

/// Read stdin on its own thread and forward commands. End of input shuts the node down.
pub fn spawn_reader(handle: NodeHandle, self_id: PeerId) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("console-input".into())
        .spawn(move || {
            let stdin = io::stdin();
            for line in stdin.lock().lines() {
                if handle.is_closed() {
                    return;
                }
                let line = match line {
                    Ok(l) => l,
                    Err(e) => {
                        log::warn!("stdin: {}", e);
                        break;
                    }
                };
                match parse_command(&line, self_id) {
                    Ok(Some(command)) => {
                        let quit = command == Command::Shutdown;
                        if !handle.send(command) || quit {
                            return;
                        }
                    }
                    Ok(None) => {}
                    Err(msg) => eprintln!("{}", msg),
                }
            }
            handle.shutdown();
        })
}
