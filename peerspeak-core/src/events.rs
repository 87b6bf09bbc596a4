//! Boundary between the network loop and the front end: commands in, events out.

use std::net::SocketAddr;

use crate::protocol::PeerId;

/// Requests from the front end. Marshaled onto the network loop before anything runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Connect to the rendezvous server and announce `self_id`.
    ConnectToDiscovery {
        address: String,
        port: u16,
        self_id: PeerId,
    },
    /// Dial a peer directly, without punch-through.
    ConnectPeer(SocketAddr),
    /// Ask the discovery server to arrange a link to `peer_id`.
    RequestOpen(PeerId),
    /// Answer the last open request.
    RespondToOpen(bool),
    /// Flood a chat line to every peer.
    BroadcastChat(String),
    Shutdown,
}

/// Notifications produced on the network loop for the front end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    PeerConnected(PeerId),
    PeerDisconnected(PeerId),
    OpenRequest(PeerId),
    Chat { peer_id: PeerId, text: String },
    /// User-visible failure, plain text.
    Error(String),
}

/// Front-end side of the collaborator interface.
pub trait Frontend {
    fn on_peer_connected(&mut self, peer_id: PeerId);
    fn on_peer_disconnected(&mut self, peer_id: PeerId);
    fn on_open_request(&mut self, peer_id: PeerId);
    fn on_chat(&mut self, peer_id: PeerId, text: &str);
    fn on_error(&mut self, message: &str);
}

impl NodeEvent {
    /// Hand the event to the matching front-end callback.
    pub fn deliver<F: Frontend + ?Sized>(self, frontend: &mut F) {
        match self {
            NodeEvent::PeerConnected(id) => frontend.on_peer_connected(id),
            NodeEvent::PeerDisconnected(id) => frontend.on_peer_disconnected(id),
            NodeEvent::OpenRequest(id) => frontend.on_open_request(id),
            NodeEvent::Chat { peer_id, text } => frontend.on_chat(peer_id, &text),
            NodeEvent::Error(message) => frontend.on_error(&message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder(Vec<String>);

    impl Frontend for Recorder {
        fn on_peer_connected(&mut self, peer_id: PeerId) {
            self.0.push(format!("up {peer_id}"));
        }
        fn on_peer_disconnected(&mut self, peer_id: PeerId) {
            self.0.push(format!("down {peer_id}"));
        }
        fn on_open_request(&mut self, peer_id: PeerId) {
            self.0.push(format!("open {peer_id}"));
        }
        fn on_chat(&mut self, peer_id: PeerId, text: &str) {
            self.0.push(format!("{peer_id}: {text}"));
        }
        fn on_error(&mut self, message: &str) {
            self.0.push(format!("error {message}"));
        }
    }

    #[test]
    fn deliver_routes_to_callbacks() {
        let mut r = Recorder::default();
        NodeEvent::PeerConnected(PeerId(1)).deliver(&mut r);
        NodeEvent::Chat {
            peer_id: PeerId(1),
            text: "hi".into(),
        }
        .deliver(&mut r);
        NodeEvent::OpenRequest(PeerId(4)).deliver(&mut r);
        NodeEvent::Error("boom".into()).deliver(&mut r);
        NodeEvent::PeerDisconnected(PeerId(1)).deliver(&mut r);
        assert_eq!(r.0, vec!["up 1", "1: hi", "open 4", "error boom", "down 1"]);
    }
}
