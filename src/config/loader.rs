//! Configuration loading from disk.
//!
//! # Data Flow
//! ```text
//! file ─► toml ─► ProxyConfig ─► validate ─► build_proxies
//!                                               ├─ acl lines        ─► Proxy.acls
//!                                               ├─ tcp-request lines ─► directive handler
//!                                               └─ bind entries      ─► registry listeners (Init)
//! ```

use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use crate::config::directive::{parse_tcp_request, DirectiveStatus};
use crate::config::schema::{BindConfig, DefaultsConfig, ProxyConfig, ProxySection};
use crate::config::validation::{validate_config, ValidationError};
use crate::diagnostic::ErrBuf;
use crate::net::fd::ReadyHandler;
use crate::net::listener::{ListenerId, ListenerOptions};
use crate::net::protocol::ProtocolRegistry;
use crate::proxy::{FrontendId, Proxy, ProxyMode};
use crate::rules::Acl;

/// Error type for configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Validation(Vec<ValidationError>),
    /// A directive line was rejected.
    Directive {
        proxy: String,
        line: String,
        message: String,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Validation(errors) => {
                write!(f, "Validation failed: ")?;
                for (i, err) in errors.iter().enumerate() {
                    if i > 0 { write!(f, ", ")?; }
                    write!(f, "{}", err)?;
                }
                Ok(())
            }
            ConfigError::Directive { proxy, line, message } => {
                write!(f, "in '{}', '{}': {}", proxy, line, message)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(e) => Some(e),
            ConfigError::Parse(e) => Some(e),
            _ => None,
        }
    }
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<ProxyConfig, ConfigError> {
    let content = fs::read_to_string(path).map_err(ConfigError::Io)?;
    parse_config(&content)
}

/// Parse and validate configuration text.
pub fn parse_config(content: &str) -> Result<ProxyConfig, ConfigError> {
    let config: ProxyConfig = toml::from_str(content).map_err(ConfigError::Parse)?;

    validate_config(&config).map_err(ConfigError::Validation)?;

    Ok(config)
}

/// Proxies built from a configuration, plus the warnings raised on the way.
#[derive(Debug)]
pub struct LoadedProxies {
    pub proxies: Vec<Proxy>,
    pub warnings: Vec<String>,
}

/// Turn validated sections into proxies and declare their listeners in
/// `registry`. `accept` builds the accept handler of each frontend.
pub fn build_proxies<F>(
    config: &ProxyConfig,
    registry: &mut ProtocolRegistry,
    accept: F,
) -> Result<LoadedProxies, ConfigError>
where
    F: Fn(FrontendId) -> Arc<dyn ReadyHandler>,
{
    let mut warnings = Vec::new();

    // Any rule in the template is refused by the handler.
    let mut template = Proxy::new(FrontendId(usize::MAX), "defaults", ProxyMode::Defaults);
    for line in &config.defaults.tcp_request {
        apply_tcp_request(&mut template, line, &mut warnings)?;
    }

    let mut proxies = Vec::with_capacity(config.proxies.len());
    for (index, section) in config.proxies.iter().enumerate() {
        let mut proxy = Proxy::new(FrontendId(index), section.name.clone(), section.mode);

        for line in &section.acl {
            let args: Vec<&str> = line.split_whitespace().collect();
            let acl = Acl::parse(&args).map_err(|e| ConfigError::Directive {
                proxy: section.name.clone(),
                line: format!("acl {}", line),
                message: e.to_string(),
            })?;
            proxy.acls.add(acl);
        }

        for line in &section.tcp_request {
            apply_tcp_request(&mut proxy, line, &mut warnings)?;
        }

        proxy.forward_to = section
            .forward_to
            .as_deref()
            .map(|t| parse_addr(section, "forward_to", t))
            .transpose()?;

        if section.mode.has_frontend_cap() {
            let handler = accept(proxy.id);
            for bind in &section.bind {
                let id = declare_listener(registry, &config.defaults, section, bind, proxy.id, &handler)?;
                proxy.listeners.push(id);
            }
        }

        tracing::debug!(
            proxy = %proxy.name,
            mode = proxy.mode.type_str(),
            listeners = proxy.listeners.len(),
            rules = proxy.tcp_req.rules.len(),
            "proxy loaded"
        );
        proxies.push(proxy);
    }

    Ok(LoadedProxies { proxies, warnings })
}

fn apply_tcp_request(proxy: &mut Proxy, line: &str, warnings: &mut Vec<String>) -> Result<(), ConfigError> {
    let mut args = vec!["tcp-request"];
    args.extend(line.split_whitespace());

    let mut storage = [0u8; 256];
    let mut err = ErrBuf::new(&mut storage);
    match parse_tcp_request(&args, proxy, &mut err) {
        DirectiveStatus::Accepted => Ok(()),
        DirectiveStatus::Warning => {
            tracing::warn!(proxy = %proxy.name, "{}", err.as_str());
            warnings.push(err.as_str().to_string());
            Ok(())
        }
        DirectiveStatus::Rejected => Err(ConfigError::Directive {
            proxy: proxy.name.clone(),
            line: args.join(" "),
            message: err.as_str().to_string(),
        }),
    }
}

fn parse_addr(section: &ProxySection, field: &str, value: &str) -> Result<SocketAddr, ConfigError> {
    value.parse().map_err(|_| ConfigError::Directive {
        proxy: section.name.clone(),
        line: format!("{} {}", field, value),
        message: format!("invalid socket address '{}'", value),
    })
}

fn declare_listener(
    registry: &mut ProtocolRegistry,
    defaults: &DefaultsConfig,
    section: &ProxySection,
    bind: &BindConfig,
    frontend: FrontendId,
    handler: &Arc<dyn ReadyHandler>,
) -> Result<ListenerId, ConfigError> {
    let addr = parse_addr(section, "bind", &bind.address)?;
    let foreign = bind
        .foreign_address
        .as_deref()
        .map(|a| parse_addr(section, "foreign_address", a))
        .transpose()?;

    let id = registry.create_listener(addr, frontend, Arc::clone(handler));
    if let Some(listener) = registry.listener_mut(id) {
        listener.set_options(ListenerOptions {
            no_linger: bind.nolinger.unwrap_or(defaults.nolinger),
            foreign: bind.transparent,
        });
        listener.set_backlog(bind.backlog.or(defaults.backlog));
        listener.set_maxconn(bind.maxconn.unwrap_or(defaults.maxconn));
        listener.set_foreign(bind.bind_mode, foreign);
    }
    Ok(id)
}
