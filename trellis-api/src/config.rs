//! API server configuration

use std::net::SocketAddr;
use std::time::Duration;

/// HTTP/WebSocket server settings.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Per-request deadline, propagated into storage calls.
    pub request_timeout: Duration,
    /// Idle time before the server pings a subscription socket.
    pub ws_idle_timeout: Duration,
    /// How long after the ping a silent socket survives.
    pub ws_pong_grace: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".parse().expect("static addr"),
            request_timeout: Duration::from_secs(30),
            ws_idle_timeout: Duration::from_secs(60),
            ws_pong_grace: Duration::from_secs(10),
        }
    }
}

impl ApiConfig {
    /// Read from the environment.
    ///
    /// # Environment Variables
    /// - `TRELLIS_BIND_ADDR` (default: 0.0.0.0:8080)
    /// - `TRELLIS_REQUEST_TIMEOUT_SECS` (default: 30)
    /// - `TRELLIS_WS_IDLE_TIMEOUT_SECS` (default: 60)
    /// - `TRELLIS_WS_PONG_GRACE_SECS` (default: 10)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: std::env::var("TRELLIS_BIND_ADDR")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.bind_addr),
            request_timeout: env_secs("TRELLIS_REQUEST_TIMEOUT_SECS", defaults.request_timeout),
            ws_idle_timeout: env_secs("TRELLIS_WS_IDLE_TIMEOUT_SECS", defaults.ws_idle_timeout),
            ws_pong_grace: env_secs("TRELLIS_WS_PONG_GRACE_SECS", defaults.ws_pong_grace),
        }
    }
}

fn env_secs(name: &str, default: Duration) -> Duration {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}
