use crate::config::ServerConfig;
use crate::connection::handle_connection;
use crate::error::PairchatError;
use crate::lobby::Lobby;
use crate::moderation::ModerationGate;
use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Upper bound on sockets in the WebSocket handshake at once.
const MAX_PENDING_HANDSHAKES: usize = 1000;

/// How long shutdown waits for connection tasks to finish.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared state for the chat server.
pub struct ServerState {
    /// Registry, waiting queue and block ledger. Never held across an await.
    lobby: Mutex<Lobby>,
    /// Content check applied to chat messages before relay.
    pub moderation: ModerationGate,
    /// Runtime server configuration.
    pub config: ServerConfig,
    /// Per-IP connection counter for enforcing connection limits.
    pub ip_connections: DashMap<IpAddr, usize>,
    /// Sockets currently held, counted from accept.
    pub active_connections: AtomicUsize,
    /// Limits connections that have not finished the WebSocket handshake.
    pub handshake_permits: Semaphore,
}

impl ServerState {
    /// Create state with an empty lobby.
    #[must_use]
    pub fn new(config: ServerConfig, moderation: ModerationGate) -> Self {
        Self {
            lobby: Mutex::new(Lobby::new()),
            moderation,
            config,
            ip_connections: DashMap::new(),
            active_connections: AtomicUsize::new(0),
            handshake_permits: Semaphore::new(MAX_PENDING_HANDSHAKES),
        }
    }

    /// Lock the lobby, recovering the guard if a previous holder panicked.
    pub fn lobby(&self) -> MutexGuard<'_, Lobby> {
        self.lobby.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One slot of the global connection cap, held from accept until the
/// connection task ends.
pub(crate) struct ConnSlot {
    state: Arc<ServerState>,
}

impl ConnSlot {
    /// Take a slot, or `None` if `max_conns` sockets are already held.
    pub(crate) fn try_claim(state: &Arc<ServerState>) -> Option<Self> {
        let max = state.config.max_conns;
        state
            .active_connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .ok()?;
        Some(Self {
            state: Arc::clone(state),
        })
    }
}

impl Drop for ConnSlot {
    fn drop(&mut self) {
        self.state.active_connections.fetch_sub(1, Ordering::AcqRel);
    }
}

/// # Errors
///
/// Returns an error if the accept loop encounters an I/O failure.
pub async fn run(listener: TcpListener, state: Arc<ServerState>) -> Result<(), PairchatError> {
    let (_shutdown_tx, shutdown_rx) = watch::channel(());
    run_with_shutdown(listener, state, shutdown_rx).await
}

/// Run the server accept loop with an externally-controlled shutdown signal.
///
/// When the watched sender fires or is dropped, the accept loop stops
/// accepting new connections, every open connection is closed, and the loop
/// waits for in-flight connection tasks to finish.
///
/// # Errors
///
/// Returns an error if the accept loop encounters an I/O failure.
pub async fn run_with_shutdown(
    listener: TcpListener,
    state: Arc<ServerState>,
    mut shutdown_rx: watch::Receiver<()>,
) -> Result<(), PairchatError> {
    let local_addr = listener.local_addr()?;
    info!("chat server listening on {}", local_addr);
    let mut tasks = JoinSet::new();

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let Some(slot) = ConnSlot::try_claim(&state) else {
                            warn!("max connections reached, rejecting {}", addr);
                            drop(stream);
                            continue;
                        };
                        let state = Arc::clone(&state);
                        let conn_shutdown = shutdown_rx.clone();
                        tasks.spawn(async move {
                            let _slot = slot;
                            if let Err(e) = handle_connection(stream, addr, state, conn_shutdown).await {
                                tracing::debug!("connection from {} closed: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("failed to accept connection: {}", e);
                    }
                }
            }
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(e) = joined {
                    if e.is_panic() {
                        error!("connection task panicked: {}", e);
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                info!("shutdown signal received, draining {} connections", tasks.len());
                break;
            }
        }
    }

    state.handshake_permits.close();
    let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
        while tasks.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(
            "drain timeout reached with {} connections still active",
            tasks.len()
        );
        tasks.abort_all();
    }

    info!("server shut down gracefully");
    Ok(())
}
