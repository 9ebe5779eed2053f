use crate::error::PairchatError;
use crate::metrics::counters;
use crate::moderation::Verdict;
use crate::ratelimit::RateLimiter;
use crate::registry::ConnId;
use crate::server::ServerState;
use dashmap::mapref::entry::Entry;
use futures_util::stream::{FuturesOrdered, SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use pairchat_common::text::{escape_markup, truncate_chars};
use pairchat_common::types::{MAX_EVENT_SIZE, MAX_MESSAGE_CHARS, PROTOCOL_VERSION};
use pairchat_common::{ClientEvent, ServerEvent};
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Duration};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsRecv = SplitStream<WebSocketStream<TcpStream>>;

/// A moderation check in flight: the peer the message was addressed to, the
/// truncated text, and the eventual verdict.
type PendingCheck = Pin<Box<dyn Future<Output = (ConnId, String, Verdict)> + Send>>;

/// Outbound event buffer per connection.
const OUTBOX_CAPACITY: usize = 256;

/// Resolve the address a connection is accounted under.
///
/// With `trust_proxy`, the first `X-Forwarded-For` hop wins if it parses;
/// otherwise the socket peer is used.
pub(crate) fn client_ip(forwarded_for: Option<&str>, peer: IpAddr, trust_proxy: bool) -> IpAddr {
    if trust_proxy {
        if let Some(ip) = forwarded_for
            .and_then(|v| v.split(',').next())
            .and_then(|hop| hop.trim().parse().ok())
        {
            return ip;
        }
    }
    peer
}

/// Extract the reconnection token from an upgrade URL query string.
fn token_from_query(query: Option<&str>) -> Option<String> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "token")
        .map(|(_, value)| value.to_string())
        .filter(|value| !value.is_empty())
}

/// What the upgrade request told us about the client.
#[derive(Debug)]
struct Handshake {
    ip: IpAddr,
    token: Option<String>,
    /// Subprotocols offered when none of them is ours.
    unsupported: Option<String>,
}

/// Inspect the upgrade request, echo our subprotocol, and refuse clients
/// that only speak other ones.
fn inspect_upgrade(
    req: &Request,
    mut resp: Response,
    peer_addr: SocketAddr,
    trust_proxy: bool,
    cell: &OnceLock<Handshake>,
) -> Result<Response, ErrorResponse> {
    let forwarded_for = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok());
    let ip = client_ip(forwarded_for, peer_addr.ip(), trust_proxy);
    let token = token_from_query(req.uri().query());

    let offered: Vec<&str> = req
        .headers()
        .get_all("sec-websocket-protocol")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();

    let unsupported = if offered.is_empty() {
        None
    } else if offered.contains(&PROTOCOL_VERSION) {
        resp.headers_mut().insert(
            "sec-websocket-protocol",
            HeaderValue::from_static(PROTOCOL_VERSION),
        );
        None
    } else {
        Some(offered.join(", "))
    };
    let refused = unsupported.is_some();
    let _ = cell.set(Handshake {
        ip,
        token,
        unsupported,
    });

    if refused {
        let mut err = ErrorResponse::new(Some(format!("expected subprotocol {PROTOCOL_VERSION}")));
        *err.status_mut() = StatusCode::BAD_REQUEST;
        return Err(err);
    }
    Ok(resp)
}

/// Holds one slot of the per-IP connection count.
struct ConnGuard {
    state: Arc<ServerState>,
    ip: IpAddr,
}

impl ConnGuard {
    /// Atomically check the per-IP limit and take a slot.
    fn acquire(state: &Arc<ServerState>, ip: IpAddr) -> Result<Self, PairchatError> {
        match state.ip_connections.entry(ip) {
            Entry::Occupied(mut entry) => {
                if *entry.get() >= state.config.max_conns_ip {
                    return Err(PairchatError::IpLimit);
                }
                *entry.get_mut() += 1;
            }
            Entry::Vacant(entry) => {
                entry.insert(1);
            }
        }
        Ok(Self {
            state: Arc::clone(state),
            ip,
        })
    }
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        let mut remove = false;
        if let Some(mut entry) = self.state.ip_connections.get_mut(&self.ip) {
            *entry = entry.saturating_sub(1);
            if *entry == 0 {
                remove = true;
            }
        }
        if remove {
            self.state
                .ip_connections
                .remove_if(&self.ip, |_, v| *v == 0);
        }
    }
}

/// Serve one chat client from upgrade to disconnect.
///
/// # Errors
///
/// Returns an error if the handshake fails or misses its deadline, the client
/// is over the per-IP limit, or the transport breaks. The lobby is cleaned up
/// in every case.
pub async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    state: Arc<ServerState>,
    mut shutdown: watch::Receiver<()>,
) -> Result<(), PairchatError> {
    let ws_config = WebSocketConfig {
        max_message_size: Some(MAX_EVENT_SIZE),
        max_frame_size: Some(MAX_EVENT_SIZE),
        ..WebSocketConfig::default()
    };

    let handshake = Arc::new(OnceLock::new());
    let cell = Arc::clone(&handshake);
    let trust_proxy = state.config.trust_proxy;
    let upgrade = async {
        let _permit = state
            .handshake_permits
            .acquire()
            .await
            .map_err(|_| PairchatError::ShuttingDown)?;
        Ok::<_, PairchatError>(
            tokio_tungstenite::accept_hdr_async_with_config(
                stream,
                move |req: &Request, resp: Response| {
                    inspect_upgrade(req, resp, peer_addr, trust_proxy, &cell)
                },
                Some(ws_config),
            )
            .await,
        )
    };
    let deadline = Duration::from_secs(state.config.handshake_timeout);
    let accepted = match tokio::time::timeout(deadline, upgrade).await {
        Ok(accepted) => accepted?,
        Err(_) => {
            debug!(peer = %peer_addr, "handshake timed out");
            return Err(PairchatError::HandshakeTimeout);
        }
    };

    let mut ws_stream = match accepted {
        Ok(ws) => ws,
        Err(e) => {
            if let Some(offered) = handshake.get().and_then(|h| h.unsupported.clone()) {
                return Err(PairchatError::UnsupportedProtocol(offered));
            }
            return Err(e.into());
        }
    };

    let (ip, token) = match handshake.get() {
        Some(h) => (h.ip, h.token.clone()),
        None => (peer_addr.ip(), None),
    };

    let _guard = match ConnGuard::acquire(&state, ip) {
        Ok(guard) => guard,
        Err(e) => {
            debug!(ip = %ip, limit = state.config.max_conns_ip, "per-IP connection limit exceeded");
            let _ = ws_stream
                .close(Some(CloseFrame {
                    code: CloseCode::Policy,
                    reason: "too many connections".into(),
                }))
                .await;
            return Err(e);
        }
    };

    counters::connections_total();
    let (outbox, mut inbox) = mpsc::channel(OUTBOX_CAPACITY);
    let (id, identity) = state.lobby().connect(outbox, token.as_deref());
    debug!(conn = %id, name = %identity.name, ip = %ip, "client connected");

    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    let result = run_event_loop(id, &mut ws_tx, &mut ws_rx, &mut inbox, &state, &mut shutdown).await;

    state.lobby().disconnect(id);
    debug!(conn = %id, "client disconnected");
    result
}

/// Drive one connection: client frames in, lobby events out, moderation
/// verdicts settled in arrival order, keepalive pings.
async fn run_event_loop(
    id: ConnId,
    ws_tx: &mut WsSink,
    ws_rx: &mut WsRecv,
    inbox: &mut mpsc::Receiver<ServerEvent>,
    state: &ServerState,
    shutdown: &mut watch::Receiver<()>,
) -> Result<(), PairchatError> {
    let mut rate_limiter = RateLimiter::per_minute(state.config.msg_rate);
    let mut pending: FuturesOrdered<PendingCheck> = FuturesOrdered::new();
    let mut ping_interval = interval(Duration::from_secs(state.config.ping_interval));
    let idle_timeout = Duration::from_secs(state.config.idle_timeout);
    let mut last_activity = Instant::now();

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                last_activity = Instant::now();
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(check) = dispatch(id, &text, state, &mut rate_limiter) {
                            pending.push_back(check);
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        debug!(conn = %id, "ignoring binary frame");
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = ws_tx.send(Message::Pong(data)).await {
                            debug!("failed to send pong: {}", e);
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Err(e)) => return Err(PairchatError::WebSocket(e)),
                    _ => {}
                }
            }
            Some(event) = inbox.recv() => {
                let json = event.to_json()?;
                ws_tx.send(Message::Text(json)).await?;
            }
            Some((expected_peer, text, verdict)) = pending.next(), if !pending.is_empty() => {
                settle(id, expected_peer, text, verdict, state);
            }
            _ = ping_interval.tick() => {
                if last_activity.elapsed() >= idle_timeout {
                    debug!(conn = %id, "idle timeout reached, closing connection");
                    let _ = ws_tx.send(Message::Close(Some(CloseFrame {
                        code: CloseCode::Away,
                        reason: "idle timeout".into(),
                    }))).await;
                    return Ok(());
                }
                if let Err(e) = ws_tx.send(Message::Ping(vec![])).await {
                    debug!("failed to send ping: {}", e);
                }
            }
            _ = shutdown.changed() => {
                let _ = ws_tx.send(Message::Close(Some(CloseFrame {
                    code: CloseCode::Away,
                    reason: "server shutting down".into(),
                }))).await;
                return Ok(());
            }
        }
    }
}

/// Apply one client event. Returns a moderation check to await for chat text.
fn dispatch(
    id: ConnId,
    raw: &str,
    state: &ServerState,
    rate_limiter: &mut RateLimiter,
) -> Option<PendingCheck> {
    let event = match ClientEvent::parse(raw) {
        Ok(event) => event,
        Err(e) => {
            debug!(conn = %id, error = %e, "ignoring malformed event");
            return None;
        }
    };

    match event {
        ClientEvent::Message(text) => accept_message(id, &text, state, rate_limiter),
        ClientEvent::Typing => {
            state.lobby().typing(id);
            None
        }
        ClientEvent::Report => {
            state.lobby().report(id);
            None
        }
        ClientEvent::Block => {
            state.lobby().block(id);
            None
        }
    }
}

fn accept_message(
    id: ConnId,
    text: &str,
    state: &ServerState,
    rate_limiter: &mut RateLimiter,
) -> Option<PendingCheck> {
    if !rate_limiter.check_and_record() {
        counters::messages_dropped_total("rate_limit");
        debug!(conn = %id, "message rate exceeded, dropping");
        return None;
    }

    let text = truncate_chars(text, MAX_MESSAGE_CHARS).to_string();
    let peer = state.lobby().peer_of(id);
    let Some(expected_peer) = peer else {
        counters::messages_dropped_total("unpaired");
        return None;
    };

    let gate = state.moderation.clone();
    Some(Box::pin(async move {
        let verdict = gate.check(&text).await;
        (expected_peer, text, verdict)
    }))
}

/// Act on a resolved moderation check.
fn settle(id: ConnId, expected_peer: ConnId, text: String, verdict: Verdict, state: &ServerState) {
    match verdict {
        Verdict::Allow => {
            state
                .lobby()
                .relay_message(id, expected_peer, escape_markup(&text));
        }
        Verdict::Reject { reason } => {
            let mut lobby = state.lobby();
            if lobby.peer_of(id) != Some(expected_peer) {
                counters::messages_dropped_total("peer_changed");
                return;
            }
            counters::messages_dropped_total("moderation");
            lobby.notify(id, ServerEvent::AbuseDetected(reason));
        }
    }
}
