//! Relay registry: live peer links by id, plus the fingerprint history that makes flooding loop-free.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Weak};

use lru::LruCache;

use crate::protocol::{Fingerprint, MessageHeader, PeerId};

/// Default number of fingerprints remembered for deduplication.
pub const DEFAULT_FINGERPRINT_CAPACITY: usize = 4096;

/// Process-local identifier of one link. Distinguishes two links that announce the same peer id.
pub type LinkId = u64;

/// What the registry needs from a peer link. Implemented by the node's connection handle.
pub trait RelayLink {
    fn link_id(&self) -> LinkId;
    fn peer_id(&self) -> PeerId;
    /// Queue an already encoded frame. Must not block; failures are the link's to log.
    fn send_frame(&self, frame: &[u8]);
}

/// Bounded fingerprint history. Lookups do not refresh recency, so the oldest insert is evicted first.
pub struct SeenFilter {
    cache: LruCache<Fingerprint, ()>,
}

impl SeenFilter {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: LruCache::new(capacity),
        }
    }

    /// Returns true if `fp` was new (and is now recorded), false if already seen.
    pub fn check(&mut self, fp: Fingerprint) -> bool {
        if self.cache.contains(&fp) {
            false
        } else {
            self.cache.put(fp, ());
            true
        }
    }

    pub fn contains(&self, fp: &Fingerprint) -> bool {
        self.cache.contains(fp)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

/// Result of offering a received frame to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Fingerprint already seen: do not forward, do not dispatch.
    Duplicate,
    /// First sighting: forwarded to `forwarded` links, caller dispatches locally.
    Relayed { forwarded: usize },
}

/// Peer id -> weak link handle, plus recent fingerprints.
/// Connections own themselves; the registry never keeps one alive.
pub struct RelayRegistry<H> {
    links: HashMap<PeerId, Weak<H>>,
    seen: SeenFilter,
}

impl<H: RelayLink> RelayRegistry<H> {
    pub fn new(fingerprint_capacity: usize) -> Self {
        Self {
            links: HashMap::new(),
            seen: SeenFilter::new(fingerprint_capacity),
        }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_FINGERPRINT_CAPACITY)
    }

    /// Register a link under its announced peer id.
    /// A live entry for the same id wins; a stale (dropped) entry is replaced.
    pub fn register(&mut self, link: &Arc<H>) -> Result<(), RegistryError> {
        let peer_id = link.peer_id();
        if let Some(existing) = self.links.get(&peer_id) {
            if existing.upgrade().is_some() {
                return Err(RegistryError::DuplicatePeer(peer_id));
            }
        }
        self.links.insert(peer_id, Arc::downgrade(link));
        Ok(())
    }

    /// Remove the entry for `peer_id` only if it belongs to `link_id`. Returns whether it was removed.
    pub fn deregister(&mut self, peer_id: PeerId, link_id: LinkId) -> bool {
        let owned = match self.links.get(&peer_id).and_then(Weak::upgrade) {
            Some(link) => link.link_id() == link_id,
            // Dead entry: whoever owned it is gone, clear it.
            None => self.links.contains_key(&peer_id),
        };
        if owned {
            self.links.remove(&peer_id);
        }
        owned
    }

    pub fn get(&self, peer_id: PeerId) -> Option<Arc<H>> {
        self.links.get(&peer_id).and_then(Weak::upgrade)
    }

    pub fn contains(&self, peer_id: PeerId) -> bool {
        self.get(peer_id).is_some()
    }

    /// Ids with a live link, ascending.
    pub fn peers(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self
            .links
            .iter()
            .filter(|(_, w)| w.strong_count() > 0)
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    /// Strong handles to every live link.
    pub fn links(&self) -> Vec<Arc<H>> {
        self.links.values().filter_map(Weak::upgrade).collect()
    }

    pub fn len(&self) -> usize {
        self.links.values().filter(|w| w.strong_count() > 0).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_seen(&self, fp: &Fingerprint) -> bool {
        self.seen.contains(fp)
    }

    pub fn fingerprints(&self) -> usize {
        self.seen.len()
    }

    /// Flood step for a frame received on link `from`.
    /// `frame` is the unmodified encoded frame (header + payload) as read off the wire.
    pub fn relay(&mut self, from: LinkId, header: &MessageHeader, frame: &[u8]) -> RelayOutcome {
        if !self.seen.check(header.fingerprint()) {
            return RelayOutcome::Duplicate;
        }
        let forwarded = self.forward(frame, |link| {
            link.link_id() != from && link.peer_id() != header.sender_id
        });
        RelayOutcome::Relayed { forwarded }
    }

    /// Send a frame this node originated to every link. Its fingerprint is recorded first
    /// so an echo coming back through the mesh is treated as a duplicate.
    pub fn broadcast(&mut self, header: &MessageHeader, frame: &[u8]) -> usize {
        self.seen.check(header.fingerprint());
        self.forward(frame, |_| true)
    }

    fn forward(&mut self, frame: &[u8], mut include: impl FnMut(&H) -> bool) -> usize {
        let mut sent = 0;
        self.links.retain(|_, weak| match weak.upgrade() {
            Some(link) => {
                if include(&link) {
                    link.send_frame(frame);
                    sent += 1;
                }
                true
            }
            None => false,
        });
        sent
    }
}

impl<H: RelayLink> Default for RelayRegistry<H> {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("peer {0} is already connected")]
    DuplicatePeer(PeerId),
}
