use crate::metrics::counters;
use lru::LruCache;
use pairchat_common::{ServerEvent, SessionIdentity, Token};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::num::NonZeroUsize;
use tokio::sync::mpsc::{self, error::TrySendError};

/// Number of disconnected identities kept around for token resume.
const RETIRED_CAPACITY: NonZeroUsize = match NonZeroUsize::new(10_000) {
    Some(n) => n,
    None => unreachable!(),
};

/// Sending half of a connection's outbound event channel.
pub type Outbox = mpsc::Sender<ServerEvent>;

/// Process-local connection id. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(u64);

impl ConnId {
    /// Wrap a raw id.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw id.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

/// One live client link, as seen by the pairing state machine.
#[derive(Debug)]
pub struct Connection {
    id: ConnId,
    identity: SessionIdentity,
    peer: Option<ConnId>,
    live: bool,
    outbox: Outbox,
}

impl Connection {
    /// Create an unpaired, live connection.
    #[must_use]
    pub fn new(id: ConnId, identity: SessionIdentity, outbox: Outbox) -> Self {
        Self {
            id,
            identity,
            peer: None,
            live: true,
            outbox,
        }
    }

    /// Connection id.
    #[must_use]
    pub const fn id(&self) -> ConnId {
        self.id
    }

    /// Display name and token issued to this connection.
    #[must_use]
    pub const fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    /// Identity key used by the block ledger.
    #[must_use]
    pub const fn token(&self) -> &Token {
        &self.identity.token
    }

    /// Current peer reference, if paired.
    #[must_use]
    pub const fn peer(&self) -> Option<ConnId> {
        self.peer
    }

    pub(crate) fn set_peer(&mut self, peer: Option<ConnId>) {
        self.peer = peer;
    }

    /// Returns `true` while the connection's task is still draining its outbox.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.live && !self.outbox.is_closed()
    }

    /// Queue an event for delivery. Never blocks.
    ///
    /// A full outbox drops the event; a closed one marks the connection dead.
    pub fn send(&mut self, event: ServerEvent) -> bool {
        if !self.live {
            return false;
        }
        match self.outbox.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                counters::events_dropped_total(event.name());
                tracing::debug!(conn = %self.id, event = event.name(), "outbox full, dropping event");
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.live = false;
                false
            }
        }
    }
}

/// Lookup table of every live connection.
///
/// Unknown ids are never an error: callers treat a missing entry as
/// "already gone".
pub trait ConnectionRegistry {
    /// Store a new connection under `id` and issue its identity.
    ///
    /// `presented_token` is the token the client offered at handshake, if any.
    fn register(
        &mut self,
        id: ConnId,
        outbox: Outbox,
        presented_token: Option<&str>,
    ) -> SessionIdentity;

    /// Look up a connection.
    fn lookup(&self, id: ConnId) -> Option<&Connection>;

    /// Look up a connection for mutation.
    fn lookup_mut(&mut self, id: ConnId) -> Option<&mut Connection>;

    /// Delete a connection. No events reach it afterwards.
    fn remove(&mut self, id: ConnId) -> Option<Connection>;

    /// Number of registered connections.
    fn online(&self) -> usize;

    /// Every registered connection, in no particular order.
    fn connections_mut(&mut self) -> Box<dyn Iterator<Item = &mut Connection> + '_>;
}

/// Pick a pseudonymous display name.
#[must_use]
pub fn random_name() -> String {
    format!("User{}", rand::thread_rng().gen_range(1000..=9999))
}

/// In-process registry with token resume for recently departed clients.
pub struct MemoryRegistry {
    conns: HashMap<ConnId, Connection>,
    tokens_in_use: HashSet<Token>,
    retired: LruCache<Token, String>,
}

impl MemoryRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::with_retired_capacity(RETIRED_CAPACITY)
    }

    /// Create an empty registry remembering at most `capacity` retired identities.
    #[must_use]
    pub fn with_retired_capacity(capacity: NonZeroUsize) -> Self {
        Self {
            conns: HashMap::new(),
            tokens_in_use: HashSet::new(),
            retired: LruCache::new(capacity),
        }
    }

    fn issue(&mut self, presented_token: Option<&str>) -> SessionIdentity {
        if let Some(token) = presented_token.and_then(Token::parse) {
            if !self.tokens_in_use.contains(&token) {
                if let Some(name) = self.retired.pop(&token) {
                    return SessionIdentity { name, token };
                }
            }
        }
        let mut token = Token::generate();
        while self.tokens_in_use.contains(&token) {
            token = Token::generate();
        }
        SessionIdentity {
            name: random_name(),
            token,
        }
    }
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry for MemoryRegistry {
    fn register(
        &mut self,
        id: ConnId,
        outbox: Outbox,
        presented_token: Option<&str>,
    ) -> SessionIdentity {
        if self.conns.contains_key(&id) {
            self.remove(id);
        }
        let identity = self.issue(presented_token);
        self.tokens_in_use.insert(identity.token.clone());
        self.conns
            .insert(id, Connection::new(id, identity.clone(), outbox));
        identity
    }

    fn lookup(&self, id: ConnId) -> Option<&Connection> {
        self.conns.get(&id)
    }

    fn lookup_mut(&mut self, id: ConnId) -> Option<&mut Connection> {
        self.conns.get_mut(&id)
    }

    fn remove(&mut self, id: ConnId) -> Option<Connection> {
        let conn = self.conns.remove(&id)?;
        let identity = conn.identity();
        self.tokens_in_use.remove(&identity.token);
        self.retired
            .put(identity.token.clone(), identity.name.clone());
        Some(conn)
    }

    fn online(&self) -> usize {
        self.conns.len()
    }

    fn connections_mut(&mut self) -> Box<dyn Iterator<Item = &mut Connection> + '_> {
        Box::new(self.conns.values_mut())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outbox() -> (Outbox, mpsc::Receiver<ServerEvent>) {
        mpsc::channel(4)
    }

    #[test]
    fn register_issues_name_and_token() {
        let mut reg = MemoryRegistry::new();
        let (tx, _rx) = outbox();
        let identity = reg.register(ConnId::new(1), tx, None);

        assert!(identity.name.starts_with("User"));
        let digits: u32 = identity.name["User".len()..].parse().unwrap();
        assert!((1000..=9999).contains(&digits));
        assert!(Token::parse(identity.token.as_str()).is_some());
        assert_eq!(reg.online(), 1);
    }

    #[test]
    fn lookup_on_missing_id_returns_none() {
        let reg = MemoryRegistry::new();
        assert!(reg.lookup(ConnId::new(42)).is_none());
    }

    #[test]
    fn remove_deletes_connection() {
        let mut reg = MemoryRegistry::new();
        let (tx, _rx) = outbox();
        reg.register(ConnId::new(1), tx, None);

        assert!(reg.remove(ConnId::new(1)).is_some());
        assert!(reg.lookup(ConnId::new(1)).is_none());
        assert!(reg.remove(ConnId::new(1)).is_none());
        assert_eq!(reg.online(), 0);
    }

    #[test]
    fn invalid_token_yields_fresh_identity() {
        let mut reg = MemoryRegistry::new();
        let (tx, _rx) = outbox();
        let identity = reg.register(ConnId::new(1), tx, Some("definitely not a uuid"));
        assert_ne!(identity.token.as_str(), "definitely not a uuid");
    }

    #[test]
    fn unknown_token_yields_fresh_identity() {
        let mut reg = MemoryRegistry::new();
        let stranger = Token::generate();
        let (tx, _rx) = outbox();
        let identity = reg.register(ConnId::new(1), tx, Some(stranger.as_str()));
        assert_ne!(identity.token, stranger);
    }

    #[test]
    fn retired_token_resumes_identity() {
        let mut reg = MemoryRegistry::new();
        let (tx1, _rx1) = outbox();
        let first = reg.register(ConnId::new(1), tx1, None);
        reg.remove(ConnId::new(1));

        let (tx2, _rx2) = outbox();
        let resumed = reg.register(ConnId::new(2), tx2, Some(first.token.as_str()));
        assert_eq!(resumed, first);
        assert!(reg.lookup(ConnId::new(2)).unwrap().peer().is_none());
    }

    #[test]
    fn token_in_use_is_not_shared() {
        let mut reg = MemoryRegistry::new();
        let (tx1, _rx1) = outbox();
        let first = reg.register(ConnId::new(1), tx1, None);

        let (tx2, _rx2) = outbox();
        let second = reg.register(ConnId::new(2), tx2, Some(first.token.as_str()));
        assert_ne!(second.token, first.token);
    }

    #[test]
    fn retired_token_resumes_only_once() {
        let mut reg = MemoryRegistry::new();
        let (tx1, _rx1) = outbox();
        let first = reg.register(ConnId::new(1), tx1, None);
        reg.remove(ConnId::new(1));

        let (tx2, _rx2) = outbox();
        reg.register(ConnId::new(2), tx2, Some(first.token.as_str()));
        let (tx3, _rx3) = outbox();
        let third = reg.register(ConnId::new(3), tx3, Some(first.token.as_str()));
        assert_ne!(third.token, first.token);
    }

    #[test]
    fn retired_cache_is_bounded() {
        let mut reg = MemoryRegistry::with_retired_capacity(NonZeroUsize::new(1).unwrap());
        let (tx1, _rx1) = outbox();
        let first = reg.register(ConnId::new(1), tx1, None);
        reg.remove(ConnId::new(1));
        let (tx2, _rx2) = outbox();
        reg.register(ConnId::new(2), tx2, None);
        reg.remove(ConnId::new(2));

        let (tx3, _rx3) = outbox();
        let third = reg.register(ConnId::new(3), tx3, Some(first.token.as_str()));
        assert_ne!(third.token, first.token);
    }

    #[test]
    fn send_marks_closed_connection_dead() {
        let mut reg = MemoryRegistry::new();
        let (tx, rx) = outbox();
        reg.register(ConnId::new(1), tx, None);
        drop(rx);

        let conn = reg.lookup_mut(ConnId::new(1)).unwrap();
        assert!(!conn.is_live());
        assert!(!conn.send(ServerEvent::Paired));
    }

    #[test]
    fn send_drops_when_outbox_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let identity = SessionIdentity {
            name: random_name(),
            token: Token::generate(),
        };
        let mut conn = Connection::new(ConnId::new(1), identity, tx);

        assert!(conn.send(ServerEvent::Paired));
        assert!(!conn.send(ServerEvent::Typing));
        assert!(conn.is_live());
        assert_eq!(rx.try_recv().unwrap(), ServerEvent::Paired);
    }

    #[test]
    fn conn_id_display() {
        assert_eq!(ConnId::new(7).to_string(), "c7");
    }
}
