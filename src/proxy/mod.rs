//! Proxy sections as seen by the TCP layer.
//!
//! # Responsibilities
//! - Name each section and record its role (defaults, frontend, backend, listen)
//! - Hold what the content-rule engine reads: ACLs, inspect-delay, rules
//! - Remember where accepted traffic is handed to
//!
//! # Design Decisions
//! - Only frontends and listen sections accept connections; the other roles
//!   keep inspect settings out
//! - Proxies live in a `Vec` indexed by `FrontendId` and are immutable once
//!   startup is done

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::net::listener::ListenerId;
use crate::rules::{AclSet, TcpRuleSet};

/// Index of a proxy in the loaded configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct FrontendId(pub usize);

impl fmt::Display for FrontendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "proxy-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyMode {
    /// Template section, never instantiated.
    Defaults,
    Frontend,
    Backend,
    Listen,
}

impl ProxyMode {
    /// Accepts client connections.
    pub fn has_frontend_cap(self) -> bool {
        matches!(self, ProxyMode::Frontend | ProxyMode::Listen)
    }

    pub fn type_str(self) -> &'static str {
        match self {
            ProxyMode::Defaults => "defaults",
            ProxyMode::Frontend => "frontend",
            ProxyMode::Backend => "backend",
            ProxyMode::Listen => "listen",
        }
    }
}

/// `tcp-request` settings of one proxy.
#[derive(Debug, Clone, Default)]
pub struct TcpRequest {
    /// Set at most once.
    pub inspect_delay: Option<Duration>,
    pub rules: TcpRuleSet,
}

#[derive(Debug, Clone)]
pub struct Proxy {
    pub id: FrontendId,
    pub name: String,
    pub mode: ProxyMode,
    pub acls: AclSet,
    pub tcp_req: TcpRequest,
    pub forward_to: Option<SocketAddr>,
    pub listeners: Vec<ListenerId>,
}

impl Proxy {
    pub fn new(id: FrontendId, name: impl Into<String>, mode: ProxyMode) -> Self {
        Self {
            id,
            name: name.into(),
            mode,
            acls: AclSet::new(),
            tcp_req: TcpRequest::default(),
            forward_to: None,
            listeners: Vec::new(),
        }
    }

    pub fn is_defaults(&self) -> bool {
        self.mode == ProxyMode::Defaults
    }

    /// Whether accepted connections go through content inspection.
    pub fn inspects(&self) -> bool {
        !self.tcp_req.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frontend_capability() {
        assert!(ProxyMode::Frontend.has_frontend_cap());
        assert!(ProxyMode::Listen.has_frontend_cap());
        assert!(!ProxyMode::Backend.has_frontend_cap());
        assert!(!ProxyMode::Defaults.has_frontend_cap());
    }

    #[test]
    fn new_proxy_has_no_inspection() {
        let px = Proxy::new(FrontendId(0), "fe", ProxyMode::Frontend);
        assert!(!px.inspects());
        assert!(px.tcp_req.inspect_delay.is_none());
        assert_eq!(px.mode.type_str(), "frontend");
    }
}
