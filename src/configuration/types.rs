use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, PartialEq, Clone, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Unix socket the TLS front-end forwards decrypted client streams to
    pub socket_path: PathBuf,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("./collect-master.sock"),
        }
    }
}

#[derive(Debug, PartialEq, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub retry_delay_ms: u64,
    pub slow_transaction_secs: u64,
    pub clock_refresh_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::from("sqlite://flowmaster.sqlite3?mode=rwc"),
            retry_delay_ms: 1000,
            slow_transaction_secs: 10,
            clock_refresh_secs: 600,
        }
    }
}

/// Command line of the TLS-terminating proxy that sits in front of the
/// listener socket.
#[derive(Debug, PartialEq, Clone, Deserialize)]
#[serde(default)]
pub struct FrontendConfig {
    pub enabled: bool,
    pub program: PathBuf,
    pub port: u16,
    pub key: PathBuf,
    pub cert: PathBuf,
}

impl Default for FrontendConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            program: PathBuf::from("/usr/bin/socat"),
            port: 5679,
            key: PathBuf::from("server.key"),
            cert: PathBuf::from("server.crt"),
        }
    }
}

#[derive(Debug, PartialEq, Clone, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    pub reconcile_interval_secs: u64,
    pub workers: usize,
    /// Value of the `plugin` column selecting this plugin's config rows
    pub plugin: String,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            reconcile_interval_secs: 60,
            workers: 4,
            plugin: String::from("flow"),
        }
    }
}
