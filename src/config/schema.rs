//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the TCP
//! frontend. All types derive Serde traits for deserialization from TOML.

use serde::{Deserialize, Serialize};

use crate::net::foreign::BindMode;
use crate::proxy::ProxyMode;

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Process-wide settings.
    pub global: GlobalConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Template applied to every proxy.
    pub defaults: DefaultsConfig,

    /// Frontend, backend and listen sections, in declaration order.
    pub proxies: Vec<ProxySection>,
}

/// Process-wide settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GlobalConfig {
    /// Socket ceiling. Taken from `RLIMIT_NOFILE` when absent.
    pub max_sockets: Option<usize>,

    /// How many times a retryable bind batch is attempted again.
    pub bind_retries: u32,

    /// Pause between bind attempts.
    pub bind_retry_delay_ms: u64,

    /// How long shutdown waits for sessions to finish.
    pub drain_timeout_ms: u64,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            max_sockets: None,
            bind_retries: 10,
            bind_retry_delay_ms: 100,
            drain_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Output format of log lines.
    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}

/// Values inherited by every proxy section.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DefaultsConfig {
    pub maxconn: u32,
    pub backlog: Option<u32>,
    pub nolinger: bool,

    /// `tcp-request` lines. Every one of them is refused: rules cannot live
    /// in a template.
    pub tcp_request: Vec<String>,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            maxconn: 2000,
            backlog: None,
            nolinger: false,
            tcp_request: Vec::new(),
        }
    }
}

/// One `[[proxies]]` entry.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxySection {
    pub name: String,

    pub mode: ProxyMode,

    #[serde(default)]
    pub bind: Vec<BindConfig>,

    /// `acl` lines without the keyword: `<name> <fetch> [<op>] <value>...`.
    #[serde(default)]
    pub acl: Vec<String>,

    /// `tcp-request` lines without the keyword.
    #[serde(default)]
    pub tcp_request: Vec<String>,

    /// Where accepted connections are relayed.
    #[serde(default)]
    pub forward_to: Option<String>,
}

/// One listening address.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BindConfig {
    /// Local address (e.g. "0.0.0.0:8080").
    pub address: String,

    #[serde(default)]
    pub backlog: Option<u32>,

    #[serde(default)]
    pub maxconn: Option<u32>,

    #[serde(default)]
    pub nolinger: Option<bool>,

    /// Bind through the foreign-address binder.
    #[serde(default)]
    pub transparent: bool,

    /// Which fields of `foreign_address` replace the local ones.
    #[serde(default)]
    pub bind_mode: BindMode,

    #[serde(default)]
    pub foreign_address: Option<String>,
}
