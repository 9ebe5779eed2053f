//! Pairing state machine.
//!
//! [`Lobby`] owns the connection registry, the waiting queue and the block
//! ledger. Every method runs to completion without suspending, so callers
//! serialize access by holding one lock around the whole lobby. Outbound
//! notifications are pushed into each connection's outbox from inside that
//! critical section, which keeps the order clients observe consistent with
//! the order of state changes.

use crate::ledger::BlockLedger;
use crate::metrics::{counters, gauges};
use crate::queue::WaitingQueue;
use crate::registry::{ConnId, Connection, ConnectionRegistry, MemoryRegistry, Outbox};
use pairchat_common::{ServerEvent, SessionIdentity, Token};
use tracing::{debug, info};

/// Registry, waiting queue and block ledger behind one serialization point.
pub struct Lobby<R = MemoryRegistry> {
    registry: R,
    queue: WaitingQueue,
    blocks: BlockLedger<Token>,
    next_id: u64,
}

impl Lobby<MemoryRegistry> {
    /// Create an empty lobby backed by an in-memory registry.
    #[must_use]
    pub fn new() -> Self {
        Self::with_registry(MemoryRegistry::new())
    }
}

impl Default for Lobby<MemoryRegistry> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: ConnectionRegistry> Lobby<R> {
    /// Create an empty lobby on top of `registry`.
    pub fn with_registry(registry: R) -> Self {
        Self {
            registry,
            queue: WaitingQueue::new(),
            blocks: BlockLedger::new(),
            next_id: 1,
        }
    }

    /// Register a new connection, send it its identity, and put it in line.
    pub fn connect(
        &mut self,
        outbox: Outbox,
        presented_token: Option<&str>,
    ) -> (ConnId, SessionIdentity) {
        let id = ConnId::new(self.next_id);
        self.next_id += 1;

        let identity = self.registry.register(id, outbox, presented_token);
        self.notify(id, ServerEvent::Session(identity.clone()));
        self.broadcast_online();
        self.enqueue(id);
        self.try_pair_all();
        (id, identity)
    }

    /// Put an unpaired live connection at the tail of the queue.
    ///
    /// Returns `false` without changing anything if the connection is unknown,
    /// dead, paired or already waiting.
    pub fn enqueue(&mut self, id: ConnId) -> bool {
        let eligible = self
            .registry
            .lookup(id)
            .is_some_and(|conn| conn.is_live() && conn.peer().is_none());
        eligible && self.queue.push(id)
    }

    /// Match waiting connections oldest-first until no compatible pair remains.
    ///
    /// Dead connections are dropped from the queue instead of being matched;
    /// blocked combinations are skipped. Returns the pairs that were formed.
    pub fn try_pair_all(&mut self) -> Vec<(ConnId, ConnId)> {
        let mut formed = Vec::new();
        loop {
            let registry = &self.registry;
            let dropped = self
                .queue
                .retain(|id| registry.lookup(id).is_some_and(Connection::is_live));
            for id in dropped {
                debug!(conn = %id, "dropped dead connection from queue");
            }
            if self.queue.len() < 2 {
                break;
            }

            let blocks = &self.blocks;
            let found = self.queue.find_pair(|a, b| {
                match (registry.lookup(a), registry.lookup(b)) {
                    (Some(a), Some(b)) => !blocks.is_blocked(a.token(), b.token()),
                    _ => false,
                }
            });
            let Some((a, b)) = found else {
                break;
            };

            self.queue.remove(a);
            self.queue.remove(b);
            if let Some(conn) = self.registry.lookup_mut(a) {
                conn.set_peer(Some(b));
            }
            if let Some(conn) = self.registry.lookup_mut(b) {
                conn.set_peer(Some(a));
            }
            self.notify(a, ServerEvent::Paired);
            self.notify(b, ServerEvent::Paired);
            counters::pairs_total();
            debug!(a = %a, b = %b, "paired");
            formed.push((a, b));
        }
        gauges::set_waiting(self.queue.len());
        formed
    }

    /// The connection's peer, if both are live and point at each other.
    #[must_use]
    pub fn peer_of(&self, id: ConnId) -> Option<ConnId> {
        let conn = self.registry.lookup(id)?;
        if !conn.is_live() {
            return None;
        }
        let peer_id = conn.peer()?;
        let peer = self.registry.lookup(peer_id)?;
        (peer.is_live() && peer.peer() == Some(id)).then_some(peer_id)
    }

    /// Forward already-screened chat text from `from` to `expected_peer`.
    ///
    /// The text is delivered only if `from` is still paired with the same
    /// peer it had when the message was accepted; otherwise it is dropped.
    pub fn relay_message(&mut self, from: ConnId, expected_peer: ConnId, text: String) -> bool {
        if self.peer_of(from) != Some(expected_peer) {
            counters::messages_dropped_total("peer_changed");
            debug!(conn = %from, peer = %expected_peer, "peer changed before relay, dropping message");
            return false;
        }
        let delivered = self.notify(expected_peer, ServerEvent::Message(text));
        if delivered {
            counters::messages_relayed_total();
        }
        delivered
    }

    /// Tell the peer that `from` is typing. Best effort.
    pub fn typing(&mut self, from: ConnId) -> bool {
        match self.peer_of(from) {
            Some(peer) => self.notify(peer, ServerEvent::Typing),
            None => false,
        }
    }

    /// Flag the current peer so the two are never matched again. Both stay paired.
    pub fn report(&mut self, from: ConnId) -> bool {
        let Some(peer) = self.registry.lookup(from).and_then(Connection::peer) else {
            return false;
        };
        if !self.record_block(from, peer) {
            return false;
        }
        counters::reports_total();
        info!(conn = %from, peer = %peer, "peer reported");
        self.notify(from, ServerEvent::Reported);
        true
    }

    /// Dissolve the current pair, record a block, and send both sides back to the queue.
    pub fn block(&mut self, from: ConnId) -> bool {
        let Some(peer) = self.registry.lookup(from).and_then(Connection::peer) else {
            return false;
        };
        self.record_block(from, peer);
        counters::blocks_total();
        info!(conn = %from, peer = %peer, "peer blocked");

        if let Some(conn) = self.registry.lookup_mut(from) {
            conn.set_peer(None);
        }
        self.notify(from, ServerEvent::Blocked);
        self.enqueue(from);

        if self.detach_peer(peer, from) {
            self.notify(peer, ServerEvent::Blocked);
            self.enqueue(peer);
        }
        self.try_pair_all();
        true
    }

    /// Remove a connection for good, releasing its peer back into the queue.
    pub fn disconnect(&mut self, id: ConnId) -> bool {
        self.queue.remove(id);
        let Some(conn) = self.registry.remove(id) else {
            return false;
        };
        if let Some(peer) = conn.peer() {
            if self.detach_peer(peer, id) {
                self.notify(peer, ServerEvent::Unpaired);
                self.enqueue(peer);
            }
        }
        self.try_pair_all();
        self.broadcast_online();
        true
    }

    /// Queue an event for one connection. Unknown or dead connections are skipped.
    pub fn notify(&mut self, id: ConnId, event: ServerEvent) -> bool {
        self.registry
            .lookup_mut(id)
            .is_some_and(|conn| conn.send(event))
    }

    /// Number of registered connections.
    #[must_use]
    pub fn online(&self) -> usize {
        self.registry.online()
    }

    /// Number of connections waiting for a peer.
    #[must_use]
    pub fn waiting(&self) -> usize {
        self.queue.len()
    }

    #[cfg(test)]
    pub(crate) fn is_waiting(&self, id: ConnId) -> bool {
        self.queue.contains(id)
    }

    #[cfg(test)]
    pub(crate) fn is_blocked(&self, a: ConnId, b: ConnId) -> bool {
        match (self.registry.lookup(a), self.registry.lookup(b)) {
            (Some(a), Some(b)) => self.blocks.is_blocked(a.token(), b.token()),
            _ => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn registry(&self) -> &R {
        &self.registry
    }

    /// Clear `peer`'s reference to `former` if it still points there.
    ///
    /// Returns `true` if the peer is live and should be told and re-queued.
    fn detach_peer(&mut self, peer: ConnId, former: ConnId) -> bool {
        match self.registry.lookup_mut(peer) {
            Some(conn) if conn.peer() == Some(former) => {
                conn.set_peer(None);
                conn.is_live()
            }
            _ => false,
        }
    }

    fn record_block(&mut self, a: ConnId, b: ConnId) -> bool {
        let tokens = match (self.registry.lookup(a), self.registry.lookup(b)) {
            (Some(a), Some(b)) => (a.token().clone(), b.token().clone()),
            _ => return false,
        };
        if self.blocks.block(&tokens.0, &tokens.1) {
            gauges::set_block_records(self.blocks.len());
        }
        true
    }

    fn broadcast_online(&mut self) {
        let count = self.registry.online();
        for conn in self.registry.connections_mut() {
            conn.send(ServerEvent::Online(count));
        }
        gauges::set_connections_active(count);
    }
}
