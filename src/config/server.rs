use std::{net::IpAddr, time::Duration};

use serde::{Deserialize, Serialize};

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Request body size limit in bytes.
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,

    /// Maximum buffered (non-streaming) upstream response size in bytes.
    #[serde(default = "default_max_response_body")]
    pub max_response_body_bytes: usize,

    /// Streaming response idle timeout in seconds.
    ///
    /// The maximum time allowed between chunks of a streaming upstream
    /// response. Set to 0 to disable.
    #[serde(default = "default_streaming_idle_timeout")]
    pub streaming_idle_timeout_secs: u64,

    /// Connect timeout for outbound requests to upstream channels.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            body_limit_bytes: default_body_limit(),
            max_response_body_bytes: default_max_response_body(),
            streaming_idle_timeout_secs: default_streaming_idle_timeout(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl ServerConfig {
    pub fn streaming_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.streaming_idle_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

fn default_host() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}

fn default_port() -> u16 {
    3000
}

fn default_body_limit() -> usize {
    10 * 1024 * 1024
}

fn default_max_response_body() -> usize {
    32 * 1024 * 1024
}

fn default_streaming_idle_timeout() -> u64 {
    120
}

fn default_connect_timeout() -> u64 {
    10
}
