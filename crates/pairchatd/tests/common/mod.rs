#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use pairchat_common::types::PROTOCOL_VERSION;
use pairchat_common::{ClientEvent, ServerEvent, SessionIdentity};
use pairchatd::config::ServerConfig;
use pairchatd::moderation::ModerationGate;
use pairchatd::server::ServerState;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;

type ClientStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

pub fn test_config() -> ServerConfig {
    ServerConfig {
        listen: "127.0.0.1:0".parse().unwrap(),
        http_listen: "127.0.0.1:0".parse().unwrap(),
        max_conns: 1000,
        max_conns_ip: 100,
        msg_rate: 120,
        ..ServerConfig::default()
    }
}

pub struct TestClient {
    pub ws_tx: futures_util::stream::SplitSink<ClientStream, Message>,
    pub ws_rx: futures_util::stream::SplitStream<ClientStream>,
    pub identity: SessionIdentity,
}

/// Open a raw WebSocket to the chat listener.
pub async fn open(
    addr: &SocketAddr,
    token: Option<&str>,
    protocol: Option<&str>,
) -> Result<ClientStream, tokio_tungstenite::tungstenite::Error> {
    let url = match token {
        Some(token) => format!("ws://{addr}/?token={token}"),
        None => format!("ws://{addr}/"),
    };
    let mut req = url.into_client_request().unwrap();
    if let Some(protocol) = protocol {
        req.headers_mut()
            .insert("Sec-WebSocket-Protocol", protocol.parse().unwrap());
    }
    tokio_tungstenite::connect_async(req).await.map(|(ws, _)| ws)
}

impl TestClient {
    pub async fn connect(addr: &SocketAddr) -> Self {
        Self::connect_with(addr, None, Some(PROTOCOL_VERSION)).await
    }

    pub async fn connect_with(
        addr: &SocketAddr,
        token: Option<&str>,
        protocol: Option<&str>,
    ) -> Self {
        let ws = open(addr, token, protocol).await.expect("WS connect failed");
        let (ws_tx, ws_rx) = ws.split();
        let mut client = Self {
            ws_tx,
            ws_rx,
            identity: SessionIdentity {
                name: String::new(),
                token: pairchat_common::Token::generate(),
            },
        };
        match client.recv_any().await {
            ServerEvent::Session(identity) => client.identity = identity,
            other => panic!("expected session event first, got {other:?}"),
        }
        client
    }

    pub async fn send(&mut self, event: ClientEvent) {
        let json = event.to_json().unwrap();
        self.ws_tx.send(Message::Text(json)).await.unwrap();
    }

    pub async fn send_text(&mut self, text: &str) {
        self.send(ClientEvent::Message(text.to_string())).await;
    }

    pub async fn send_raw(&mut self, msg: Message) {
        self.ws_tx.send(msg).await.unwrap();
    }

    pub async fn close(mut self) {
        let _ = self.ws_tx.send(Message::Close(None)).await;
        let _ = self.ws_tx.close().await;
    }

    /// Next server event of any kind, including online counts.
    pub async fn recv_any(&mut self) -> ServerEvent {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), self.ws_rx.next())
                .await
                .expect("timeout waiting for event")
                .expect("connection ended")
                .expect("websocket error");
            match msg {
                Message::Text(text) => return ServerEvent::parse(&text).unwrap(),
                Message::Ping(_) | Message::Pong(_) => {}
                other => panic!("expected text frame, got {other:?}"),
            }
        }
    }

    /// Next server event, skipping online-count broadcasts.
    pub async fn recv_event(&mut self) -> ServerEvent {
        loop {
            match self.recv_any().await {
                ServerEvent::Online(_) => continue,
                event => return event,
            }
        }
    }

    /// Next online count, skipping everything else.
    pub async fn recv_online(&mut self) -> usize {
        loop {
            if let ServerEvent::Online(n) = self.recv_any().await {
                return n;
            }
        }
    }

    pub async fn recv_event_timeout(&mut self, timeout: Duration) -> Option<ServerEvent> {
        tokio::time::timeout(timeout, self.recv_event()).await.ok()
    }

    /// Wait for the server to close the connection.
    pub async fn expect_closed(&mut self) {
        expect_closed(&mut self.ws_rx).await;
    }
}

pub async fn expect_closed(ws_rx: &mut futures_util::stream::SplitStream<ClientStream>) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        match tokio::time::timeout_at(deadline, ws_rx.next())
            .await
            .expect("timeout waiting for close")
        {
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
            Some(Ok(_)) => {}
        }
    }
}

/// Connect two clients and wait until both see the pairing.
pub async fn paired_clients(addr: &SocketAddr) -> (TestClient, TestClient) {
    let mut a = TestClient::connect(addr).await;
    let mut b = TestClient::connect(addr).await;
    assert_eq!(a.recv_event().await, ServerEvent::Paired);
    assert_eq!(b.recv_event().await, ServerEvent::Paired);
    (a, b)
}

/// Poll until the lobby reports `online` connections.
pub async fn wait_for_online(state: &ServerState, online: usize) {
    for _ in 0..100 {
        let current = state.lobby().online();
        if current == online {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("lobby never reached {online} connections");
}

pub async fn start_server() -> (SocketAddr, Arc<ServerState>) {
    start_server_with(test_config(), ModerationGate::disabled()).await
}

pub async fn start_server_with(
    config: ServerConfig,
    moderation: ModerationGate,
) -> (SocketAddr, Arc<ServerState>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = Arc::new(ServerState::new(config, moderation));

    let state_clone = state.clone();
    tokio::spawn(async move {
        if let Err(e) = pairchatd::run(listener, state_clone).await {
            eprintln!("server error in test: {e}");
        }
    });

    tokio::time::sleep(Duration::from_millis(50)).await;

    (addr, state)
}

pub async fn start_server_with_shutdown() -> (
    SocketAddr,
    Arc<ServerState>,
    watch::Sender<()>,
    tokio::task::JoinHandle<()>,
) {
    start_server_with_shutdown_config(test_config()).await
}

pub async fn start_server_with_shutdown_config(
    config: ServerConfig,
) -> (
    SocketAddr,
    Arc<ServerState>,
    watch::Sender<()>,
    tokio::task::JoinHandle<()>,
) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = Arc::new(ServerState::new(config, ModerationGate::disabled()));
    let (tx, rx) = watch::channel(());

    let state_clone = state.clone();
    let handle = tokio::spawn(async move {
        if let Err(e) = pairchatd::run_with_shutdown(listener, state_clone, rx).await {
            eprintln!("server error in test: {e}");
        }
    });

    tokio::time::sleep(Duration::from_millis(50)).await;

    (addr, state, tx, handle)
}
