use std::{
    net::{IpAddr, SocketAddr},
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use clap::Parser;

#[derive(Debug, Clone, Copy)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value {
            "trace" => Self::Trace,
            "debug" => Self::Debug,
            "info" => Self::Info,
            "warn" => Self::Warn,
            "error" => Self::Error,
            _ => return Err(format!("unknown log level: {value}")),
        })
    }
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match *self {
            Self::Error => log::Level::Error,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
    author = env!("CARGO_PKG_AUTHORS"),
)]
pub struct Config {
    /// listen address
    ///
    /// The address the http/websocket server binds to. Supports ipv4 and
    /// ipv6.
    #[arg(long, env = "LISTEN", default_value = "0.0.0.0")]
    pub listen: IpAddr,
    /// listen port
    #[arg(long, env = "PORT", default_value_t = 3000)]
    pub port: u16,
    /// pending flood cap
    ///
    /// A join request against a room that already has this many undecided
    /// peers is refused outright.
    #[arg(long, env = "MAX_PENDING_PER_ROOM", default_value_t = 10)]
    pub max_pending_per_room: usize,
    /// per-address hosting cap
    ///
    /// Maximum number of rooms a single remote address may host at the
    /// same time.
    #[arg(long, env = "MAX_ROOMS_PER_IP", default_value_t = 5)]
    pub max_rooms_per_ip: usize,
    /// idle timeout in milliseconds
    ///
    /// A connection that issues no RPC for this long is forcibly
    /// disconnected. Server-originated events do not count as activity.
    #[arg(long, env = "IDLE_TIMEOUT_MS", default_value_t = 300_000)]
    pub idle_timeout_ms: u64,
    /// signal payload bound in bytes
    ///
    /// Payloads are opaque to the server; the serialized size is the only
    /// property ever inspected.
    #[arg(long, env = "MAX_PAYLOAD_SIZE", default_value_t = 16_384)]
    pub max_payload_size: usize,
    /// admin password
    ///
    /// The admin view is served only when this is set. Leaving it unset
    /// disables the /admin routes entirely.
    #[arg(long, env = "ADMIN_PASSWORD")]
    pub admin_password: Option<String>,
    /// STUN server hint list
    ///
    /// Passed through verbatim to clients as `iceServers`; the server
    /// itself never talks to these.
    #[arg(
        long,
        env = "STUN_SERVERS",
        value_delimiter = ',',
        default_values_t = [
            String::from("stun:stun.l.google.com:19302"),
            String::from("stun:stun1.l.google.com:19302"),
        ],
    )]
    pub stun_servers: Vec<String>,
    /// log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: LogLevel,
}

impl Config {
    /// Load configuration from command line parameters and environment.
    pub fn load() -> Arc<Self> {
        Arc::new(Self::parse())
    }

    pub fn bind(&self) -> SocketAddr {
        SocketAddr::new(self.listen, self.port)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}
