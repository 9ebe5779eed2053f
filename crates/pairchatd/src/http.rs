use crate::connection::client_ip;
use crate::metrics::{counters, HealthState};
use crate::ratelimit::RateLimiter;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::{from_fn_with_state, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use dashmap::DashMap;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tower_http::services::ServeDir;
use tower_http::set_header::SetResponseHeaderLayer;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    ready: bool,
}

/// Per-client-IP sliding window limiter for the HTTP side.
pub struct HttpRateLimiter {
    window: Duration,
    limit: u32,
    clients: DashMap<IpAddr, RateLimiter>,
}

impl HttpRateLimiter {
    /// Allow `limit` requests per `window` from each address.
    #[must_use]
    pub fn new(window: Duration, limit: u32) -> Self {
        Self {
            window,
            limit,
            clients: DashMap::new(),
        }
    }

    /// Record a request from `ip`. Returns `false` if it is over the limit.
    pub fn allow(&self, ip: IpAddr) -> bool {
        self.clients
            .entry(ip)
            .or_insert_with(|| RateLimiter::new(self.window, self.limit))
            .check_and_record()
    }

    /// Forget addresses with no request left in the window.
    pub fn prune(&self) {
        let now = Instant::now();
        self.clients.retain(|_, limiter| !limiter.is_idle_at(now));
    }

    /// Number of addresses currently tracked.
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.clients.len()
    }
}

/// State shared by every HTTP handler.
#[derive(Clone)]
pub struct HttpState {
    health: HealthState,
    limiter: Arc<HttpRateLimiter>,
    trust_proxy: bool,
    metrics: PrometheusHandle,
    chat_port: Option<u16>,
}

impl HttpState {
    /// Bundle readiness, rate limiting and the metrics handle.
    #[must_use]
    pub fn new(
        health: HealthState,
        limiter: HttpRateLimiter,
        trust_proxy: bool,
        metrics: PrometheusHandle,
    ) -> Self {
        Self {
            health,
            limiter: Arc::new(limiter),
            trust_proxy,
            metrics,
            chat_port: None,
        }
    }

    /// Let pages served here open WebSockets to the chat listener on `port`.
    #[must_use]
    pub fn with_chat_port(mut self, port: u16) -> Self {
        self.chat_port = Some(port);
        self
    }
}

/// Build the `Content-Security-Policy` value for a request addressed to `host`.
///
/// With a chat port, `connect-src` also admits `ws://` and `wss://` on the
/// requested host at that port. Hosts outside `[A-Za-z0-9.-]` or a bracketed
/// IPv6 literal get the plain policy.
fn content_security_policy(host: Option<&str>, chat_port: Option<u16>) -> String {
    const BASE: &str = "default-src 'self'";
    let (Some(host), Some(port)) = (host, chat_port) else {
        return BASE.to_string();
    };
    let hostname = match host.strip_prefix('[') {
        Some(rest) => match rest.split_once(']') {
            Some((v6, _)) if !v6.is_empty() && v6.chars().all(|c| c.is_ascii_hexdigit() || c == ':') => {
                &host[..v6.len() + 2]
            }
            _ => return BASE.to_string(),
        },
        None => host.split(':').next().unwrap_or_default(),
    };
    let valid = !hostname.is_empty()
        && (hostname.starts_with('[')
            || hostname
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-'));
    if !valid {
        return BASE.to_string();
    }
    format!("{BASE}; connect-src 'self' ws://{hostname}:{port} wss://{hostname}:{port}")
}

/// Install the process-wide Prometheus recorder.
///
/// # Errors
///
/// Returns an error if a recorder is already installed.
pub fn install_recorder() -> anyhow::Result<PrometheusHandle> {
    Ok(PrometheusBuilder::new().install_recorder()?)
}

/// Build the HTTP router: health, readiness, metrics and optional static assets.
pub fn router(state: HttpState, static_dir: Option<&Path>) -> Router {
    let mut app = Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/metrics", get(metrics_handler));
    if let Some(dir) = static_dir {
        app = app.fallback_service(ServeDir::new(dir));
    }

    app.layer(from_fn_with_state(state.clone(), rate_limit))
        .layer(from_fn_with_state(state.clone(), csp_header))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::REFERRER_POLICY,
            HeaderValue::from_static("no-referrer"),
        ))
        .with_state(state)
}

/// Serve the HTTP side on `listener` until the task is dropped.
///
/// # Errors
///
/// Returns an error if the listener fails.
pub async fn start_http_server(
    listener: TcpListener,
    state: HttpState,
    static_dir: Option<PathBuf>,
) -> anyhow::Result<()> {
    let limiter = Arc::clone(&state.limiter);
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(limiter.window);
        loop {
            tick.tick().await;
            limiter.prune();
        }
    });

    let app = router(state, static_dir.as_deref());
    tracing::info!("http server listening on {}", listener.local_addr()?);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

async fn rate_limit(
    State(state): State<HttpState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    request: Request,
    next: Next,
) -> Response {
    let peer = connect_info.map_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED), |ConnectInfo(addr)| {
        addr.ip()
    });
    let forwarded_for = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok());
    let ip = client_ip(forwarded_for, peer, state.trust_proxy);

    if state.limiter.allow(ip) {
        next.run(request).await
    } else {
        counters::http_rate_limited_total();
        tracing::debug!(ip = %ip, "http rate limit exceeded");
        (StatusCode::TOO_MANY_REQUESTS, "Rate limit exceeded").into_response()
    }
}

async fn csp_header(State(state): State<HttpState>, request: Request, next: Next) -> Response {
    let host = request
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    let mut response = next.run(request).await;
    let policy = content_security_policy(host.as_deref(), state.chat_port);
    if let Ok(value) = HeaderValue::from_str(&policy) {
        response
            .headers_mut()
            .insert(header::CONTENT_SECURITY_POLICY, value);
    }
    response
}

async fn health_handler() -> (StatusCode, Json<HealthResponse>) {
    (StatusCode::OK, Json(HealthResponse { status: "healthy" }))
}

async fn ready_handler(State(state): State<HttpState>) -> (StatusCode, Json<ReadyResponse>) {
    if state.health.is_ready() {
        (
            StatusCode::OK,
            Json(ReadyResponse {
                status: "ready",
                ready: true,
            }),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadyResponse {
                status: "not ready",
                ready: false,
            }),
        )
    }
}

async fn metrics_handler(State(state): State<HttpState>) -> String {
    state.metrics.render()
}
