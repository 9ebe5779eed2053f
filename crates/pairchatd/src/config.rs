use clap::Parser;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;

const DEFAULT_MODERATION_URL: &str = "https://api.openai.com/v1/moderations";

/// CLI arguments for the chat server.
#[derive(Parser, Clone)]
#[command(name = "pairchatd")]
#[command(about = "Anonymous one-to-one chat pairing server")]
#[command(version)]
pub struct Args {
    /// Socket address for the WebSocket chat listener.
    #[arg(long, default_value = "0.0.0.0:3000", env = "PAIRCHAT_LISTEN")]
    pub listen: SocketAddr,
    /// Port override for the chat listener.
    #[arg(long, env = "PORT")]
    pub port: Option<u16>,
    /// Socket address for health, metrics and static assets.
    #[arg(long, default_value = "0.0.0.0:3001", env = "PAIRCHAT_HTTP_LISTEN")]
    pub http_listen: SocketAddr,
    /// Directory of static client assets to serve.
    #[arg(long, env = "PAIRCHAT_STATIC_DIR")]
    pub static_dir: Option<PathBuf>,
    /// Maximum total concurrent connections.
    #[arg(long, default_value = "10000", env = "PAIRCHAT_MAX_CONNS")]
    pub max_conns: usize,
    /// Maximum concurrent connections per IP address.
    #[arg(long, default_value = "10", env = "PAIRCHAT_MAX_CONNS_IP")]
    pub max_conns_ip: usize,
    /// Maximum chat messages per minute per connection.
    #[arg(long, default_value = "60", env = "PAIRCHAT_MSG_RATE")]
    pub msg_rate: u32,
    /// WebSocket upgrade deadline in seconds.
    #[arg(long, default_value = "5", env = "PAIRCHAT_HANDSHAKE_TIMEOUT")]
    pub handshake_timeout: u64,
    /// Interval between WebSocket pings in seconds.
    #[arg(long, default_value = "30", env = "PAIRCHAT_PING_INTERVAL")]
    pub ping_interval: u64,
    /// Connection idle timeout in seconds.
    #[arg(long, default_value = "600", env = "PAIRCHAT_IDLE_TIMEOUT")]
    pub idle_timeout: u64,
    /// HTTP rate limit window in seconds.
    #[arg(long, default_value = "10", env = "PAIRCHAT_HTTP_RATE_WINDOW")]
    pub http_rate_window: u64,
    /// Maximum HTTP requests per client IP within one window.
    #[arg(long, default_value = "30", env = "PAIRCHAT_HTTP_RATE_MAX")]
    pub http_rate_max: u32,
    /// Take the client IP from the first `X-Forwarded-For` hop.
    #[arg(long, env = "PAIRCHAT_TRUST_PROXY")]
    pub trust_proxy: bool,
    /// Credential for the moderation service. Moderation is off without it.
    #[arg(long, env = "MODERATION_API_KEY", hide_env_values = true)]
    pub moderation_key: Option<String>,
    /// Moderation service endpoint.
    #[arg(long, default_value = DEFAULT_MODERATION_URL, env = "PAIRCHAT_MODERATION_URL")]
    pub moderation_url: String,
    /// Moderation call deadline in milliseconds.
    #[arg(long, default_value = "2000", env = "PAIRCHAT_MODERATION_TIMEOUT_MS")]
    pub moderation_timeout_ms: u64,
}

/// Runtime configuration derived from [`Args`].
#[derive(Clone)]
pub struct ServerConfig {
    /// Socket address for the WebSocket chat listener.
    pub listen: SocketAddr,
    /// Socket address for health, metrics and static assets.
    pub http_listen: SocketAddr,
    /// Directory of static client assets to serve.
    pub static_dir: Option<PathBuf>,
    /// Maximum total concurrent connections.
    pub max_conns: usize,
    /// Maximum concurrent connections per IP address.
    pub max_conns_ip: usize,
    /// Maximum chat messages per minute per connection.
    pub msg_rate: u32,
    /// WebSocket upgrade deadline in seconds.
    pub handshake_timeout: u64,
    /// Interval between WebSocket pings in seconds.
    pub ping_interval: u64,
    /// Connection idle timeout in seconds.
    pub idle_timeout: u64,
    /// HTTP rate limit window in seconds.
    pub http_rate_window: u64,
    /// Maximum HTTP requests per client IP within one window.
    pub http_rate_max: u32,
    /// Take the client IP from the first `X-Forwarded-For` hop.
    pub trust_proxy: bool,
    /// Credential for the moderation service.
    pub moderation_key: Option<String>,
    /// Moderation service endpoint.
    pub moderation_url: String,
    /// Moderation call deadline in milliseconds.
    pub moderation_timeout_ms: u64,
}

impl ServerConfig {
    /// Validates the configuration values are within acceptable bounds.
    /// Returns Ok(()) if valid, Err with description otherwise.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_conns == 0 {
            return Err("max_conns must be greater than 0".to_string());
        }
        if self.max_conns > 1_000_000 {
            return Err("max_conns exceeds reasonable limit (1,000,000)".to_string());
        }

        if self.max_conns_ip == 0 {
            return Err("max_conns_ip must be greater than 0".to_string());
        }
        if self.max_conns_ip > self.max_conns {
            return Err("max_conns_ip cannot exceed max_conns".to_string());
        }

        if self.msg_rate == 0 {
            return Err("msg_rate must be greater than 0".to_string());
        }
        if self.msg_rate > 100_000 {
            return Err("msg_rate exceeds reasonable limit (100,000 msg/min)".to_string());
        }

        if self.handshake_timeout == 0 {
            return Err("handshake_timeout must be greater than 0".to_string());
        }
        if self.handshake_timeout > 300 {
            return Err("handshake_timeout exceeds reasonable limit (300 seconds)".to_string());
        }

        if self.ping_interval == 0 {
            return Err("ping_interval must be greater than 0".to_string());
        }
        if self.ping_interval > 3600 {
            return Err("ping_interval exceeds reasonable limit (3600 seconds)".to_string());
        }

        if self.idle_timeout == 0 {
            return Err("idle_timeout must be greater than 0".to_string());
        }
        if self.idle_timeout > 86_400 {
            return Err(
                "idle_timeout exceeds reasonable limit (86400 seconds / 1 day)".to_string(),
            );
        }

        if self.http_rate_window == 0 {
            return Err("http_rate_window must be greater than 0".to_string());
        }
        if self.http_rate_window > 3600 {
            return Err("http_rate_window exceeds reasonable limit (3600 seconds)".to_string());
        }
        if self.http_rate_max == 0 {
            return Err("http_rate_max must be greater than 0".to_string());
        }

        if self.moderation_key.as_deref().is_some_and(str::is_empty) {
            return Err("moderation_key must not be empty when set".to_string());
        }
        if !(self.moderation_url.starts_with("http://")
            || self.moderation_url.starts_with("https://"))
        {
            return Err("moderation_url must be an http(s) URL".to_string());
        }
        if self.moderation_timeout_ms == 0 {
            return Err("moderation_timeout_ms must be greater than 0".to_string());
        }
        if self.moderation_timeout_ms > 60_000 {
            return Err("moderation_timeout_ms exceeds reasonable limit (60000 ms)".to_string());
        }
        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 3000)),
            http_listen: SocketAddr::from(([0, 0, 0, 0], 3001)),
            static_dir: None,
            max_conns: 10_000,
            max_conns_ip: 10,
            msg_rate: 60,
            handshake_timeout: 5,
            ping_interval: 30,
            idle_timeout: 600,
            http_rate_window: 10,
            http_rate_max: 30,
            trust_proxy: false,
            moderation_key: None,
            moderation_url: DEFAULT_MODERATION_URL.to_string(),
            moderation_timeout_ms: 2000,
        }
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("listen", &self.listen)
            .field("http_listen", &self.http_listen)
            .field("static_dir", &self.static_dir)
            .field("max_conns", &self.max_conns)
            .field("max_conns_ip", &self.max_conns_ip)
            .field("msg_rate", &self.msg_rate)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("ping_interval", &self.ping_interval)
            .field("idle_timeout", &self.idle_timeout)
            .field("http_rate_window", &self.http_rate_window)
            .field("http_rate_max", &self.http_rate_max)
            .field("trust_proxy", &self.trust_proxy)
            .field(
                "moderation_key",
                &self.moderation_key.as_ref().map(|_| "<redacted>"),
            )
            .field("moderation_url", &self.moderation_url)
            .field("moderation_timeout_ms", &self.moderation_timeout_ms)
            .finish()
    }
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        let mut listen = args.listen;
        if let Some(port) = args.port {
            listen.set_port(port);
        }
        Self {
            listen,
            http_listen: args.http_listen,
            static_dir: args.static_dir,
            max_conns: args.max_conns,
            max_conns_ip: args.max_conns_ip,
            msg_rate: args.msg_rate,
            handshake_timeout: args.handshake_timeout,
            ping_interval: args.ping_interval,
            idle_timeout: args.idle_timeout,
            http_rate_window: args.http_rate_window,
            http_rate_max: args.http_rate_max,
            trust_proxy: args.trust_proxy,
            moderation_key: args.moderation_key,
            moderation_url: args.moderation_url,
            moderation_timeout_ms: args.moderation_timeout_ms,
        }
    }
}
