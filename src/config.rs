use crate::request::parse_port_list;
use log::LevelFilter;
use std::collections::HashSet;

/// Server-wide options. Everything here is fixed at startup; nothing is
/// consulted again once a connection is past its handshake.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Answer handshakes that predate the challenge headers. Off by
    /// default: hixie75 requests are indistinguishable from arbitrary
    /// HTTP requests fishing for an echo.
    pub allow_hixie75: bool,
    /// Local ports whose connections count as wss for location building.
    pub secure_ports: HashSet<u16>,
    /// The embedding transport already terminated TLS for us.
    pub tls_enabled: bool,
    /// Depth of the bounded queues behind the receiver/sender facades.
    pub queue_depth: usize,
    pub log_level: Option<LogLevel>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            allow_hixie75: false,
            secure_ports: HashSet::from([443]),
            tls_enabled: false,
            queue_depth: 1000,
            log_level: None,
        }
    }
}

impl ServerConfig {
    /// Replaces the secure-port set from a comma-delimited list, returning
    /// warnings for entries that did not parse.
    pub fn set_secure_ports(&mut self, list: &str) -> Vec<String> {
        let (ports, warnings) = parse_port_list(list);
        self.secure_ports = ports.into_iter().collect();
        warnings
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Critical,
}

impl LogLevel {
    pub fn to_filter(self) -> LevelFilter {
        match self {
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Warn => LevelFilter::Warn,
            // log has no level above error; critical collapses into it.
            LogLevel::Error | LogLevel::Critical => LevelFilter::Error,
        }
    }
}
