//! Configuration for the MCP server.
//!
//! Service settings come from [`CairnConfig::from_env`]; this module adds the
//! transport settings on top.

use cairn_core::CairnConfig;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Maximum size for uploaded file content in bytes (10 MiB).
pub const MAX_INPUT_SIZE_BYTES: usize = 10 * 1024 * 1024;

/// Maximum command length in bytes (1 MiB).
pub const MAX_COMMAND_LENGTH: usize = 1024 * 1024;

/// Transport mode for the MCP server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportMode {
    /// Stdio only (local AI tools)
    Stdio,
    /// HTTP only (remote agents)
    Http,
    /// Both stdio and HTTP
    #[default]
    Both,
}

impl TransportMode {
    /// Parse from string (case-insensitive). Unknown values mean `Both`.
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "stdio" => Self::Stdio,
            "http" | "sse" | "remote" => Self::Http,
            _ => Self::Both,
        }
    }

    /// Check if stdio transport should be enabled.
    pub fn stdio_enabled(&self) -> bool {
        matches!(self, Self::Stdio | Self::Both)
    }

    /// Check if HTTP transport should be enabled.
    pub fn http_enabled(&self) -> bool {
        matches!(self, Self::Http | Self::Both)
    }
}

/// Configuration for the cairn MCP server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Sandbox service settings.
    pub service: CairnConfig,

    /// Transport mode (default: both stdio and HTTP).
    pub transport_mode: TransportMode,

    /// HTTP server bind address.
    pub http_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            service: CairnConfig::default(),
            transport_mode: TransportMode::Both,
            http_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8080),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `CAIRN_TRANSPORT` | `both` (stdio, http, both) |
    /// | `CAIRN_HTTP_HOST` | `127.0.0.1` |
    /// | `CAIRN_HTTP_PORT` | `8080` |
    ///
    /// plus every variable read by [`CairnConfig::from_env`].
    pub fn from_env() -> Self {
        let default = Self::default();

        let http_host: IpAddr = std::env::var("CAIRN_HTTP_HOST")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default.http_addr.ip());

        let http_port: u16 = std::env::var("CAIRN_HTTP_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default.http_addr.port());

        Self {
            service: CairnConfig::from_env(),
            transport_mode: std::env::var("CAIRN_TRANSPORT")
                .map(|v| TransportMode::parse(&v))
                .unwrap_or(default.transport_mode),
            http_addr: SocketAddr::new(http_host, http_port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.transport_mode, TransportMode::Both);
        assert_eq!(config.http_addr.port(), 8080);
        assert!(config.http_addr.ip().is_loopback());
        assert_eq!(config.service.default_provider, "local");
    }

    #[test]
    fn test_transport_mode_parsing() {
        assert_eq!(TransportMode::parse("stdio"), TransportMode::Stdio);
        assert_eq!(TransportMode::parse("STDIO"), TransportMode::Stdio);
        assert_eq!(TransportMode::parse("http"), TransportMode::Http);
        assert_eq!(TransportMode::parse("sse"), TransportMode::Http);
        assert_eq!(TransportMode::parse("both"), TransportMode::Both);
        assert_eq!(TransportMode::parse("anything"), TransportMode::Both);
    }

    #[test]
    fn test_transport_mode_flags() {
        assert!(TransportMode::Stdio.stdio_enabled());
        assert!(!TransportMode::Stdio.http_enabled());

        assert!(!TransportMode::Http.stdio_enabled());
        assert!(TransportMode::Http.http_enabled());

        assert!(TransportMode::Both.stdio_enabled());
        assert!(TransportMode::Both.http_enabled());
    }
}
