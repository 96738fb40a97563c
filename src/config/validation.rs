//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check addresses parse and names are unique
//! - Check each section's role matches its binds
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;

use crate::config::schema::ProxyConfig;
use crate::net::foreign::BindMode;
use crate::proxy::ProxyMode;

/// One semantic problem, located by a dotted path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn check_addr(errors: &mut Vec<ValidationError>, field: String, value: &str) {
    if value.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(field, format!("invalid socket address '{}'", value)));
    }
}

pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.global.max_sockets == Some(0) {
        errors.push(ValidationError::new("global.max_sockets", "must be greater than 0"));
    }
    if config.defaults.maxconn == 0 {
        errors.push(ValidationError::new("defaults.maxconn", "must be greater than 0"));
    }
    if config.observability.metrics_enabled {
        check_addr(
            &mut errors,
            "observability.metrics_address".into(),
            &config.observability.metrics_address,
        );
    }

    let mut names = HashSet::new();
    for (i, px) in config.proxies.iter().enumerate() {
        let path = format!("proxies[{}]", i);

        if px.name.trim().is_empty() {
            errors.push(ValidationError::new(format!("{}.name", path), "must not be empty"));
        } else if !names.insert(px.name.as_str()) {
            errors.push(ValidationError::new(
                format!("{}.name", path),
                format!("duplicate proxy name '{}'", px.name),
            ));
        }

        match px.mode {
            ProxyMode::Defaults => errors.push(ValidationError::new(
                format!("{}.mode", path),
                "use the [defaults] table for templates",
            )),
            ProxyMode::Backend if !px.bind.is_empty() => errors.push(ValidationError::new(
                format!("{}.bind", path),
                "a backend cannot bind",
            )),
            ProxyMode::Frontend | ProxyMode::Listen if px.bind.is_empty() => {
                errors.push(ValidationError::new(
                    format!("{}.bind", path),
                    format!("{} '{}' has no bind address", px.mode.type_str(), px.name),
                ))
            }
            _ => {}
        }

        if let Some(target) = &px.forward_to {
            check_addr(&mut errors, format!("{}.forward_to", path), target);
        }

        for (j, bind) in px.bind.iter().enumerate() {
            let bpath = format!("{}.bind[{}]", path, j);
            check_addr(&mut errors, format!("{}.address", bpath), &bind.address);

            if bind.maxconn == Some(0) {
                errors.push(ValidationError::new(format!("{}.maxconn", bpath), "must be greater than 0"));
            }
            if bind.bind_mode != BindMode::None && !bind.transparent {
                errors.push(ValidationError::new(
                    format!("{}.bind_mode", bpath),
                    "requires transparent = true",
                ));
            }
            match &bind.foreign_address {
                Some(addr) => check_addr(&mut errors, format!("{}.foreign_address", bpath), addr),
                None if bind.bind_mode != BindMode::None => errors.push(ValidationError::new(
                    format!("{}.foreign_address", bpath),
                    "required when bind_mode is not 'none'",
                )),
                None => {}
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{BindConfig, ProxySection};

    fn bind(address: &str) -> BindConfig {
        BindConfig {
            address: address.to_string(),
            backlog: None,
            maxconn: None,
            nolinger: None,
            transparent: false,
            bind_mode: BindMode::None,
            foreign_address: None,
        }
    }

    fn section(name: &str, mode: ProxyMode, binds: Vec<BindConfig>) -> ProxySection {
        ProxySection {
            name: name.to_string(),
            mode,
            bind: binds,
            acl: Vec::new(),
            tcp_request: Vec::new(),
            forward_to: None,
        }
    }

    #[test]
    fn default_config_is_valid() {
        assert!(validate_config(&ProxyConfig::default()).is_ok());
    }

    #[test]
    fn collects_every_error() {
        let mut config = ProxyConfig::default();
        config.proxies.push(section("fe", ProxyMode::Frontend, vec![bind("nope")]));
        config.proxies.push(section("fe", ProxyMode::Frontend, vec![]));
        config.proxies.push(section("be", ProxyMode::Backend, vec![bind("127.0.0.1:1")]));

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(
            fields,
            vec![
                "proxies[0].bind[0].address",
                "proxies[1].name",
                "proxies[1].bind",
                "proxies[2].bind"
            ]
        );
    }

    #[test]
    fn foreign_binds_need_an_address() {
        let mut b = bind("127.0.0.1:8080");
        b.transparent = true;
        b.bind_mode = BindMode::Both;
        let mut config = ProxyConfig::default();
        config.proxies.push(section("fe", ProxyMode::Frontend, vec![b.clone()]));
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].to_string(), "proxies[0].bind[0].foreign_address: required when bind_mode is not 'none'");

        b.foreign_address = Some("192.0.2.1:80".into());
        config.proxies[0].bind = vec![b];
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn bind_mode_without_transparent() {
        let mut b = bind("127.0.0.1:8080");
        b.bind_mode = BindMode::Port;
        b.foreign_address = Some("192.0.2.1:80".into());
        let mut config = ProxyConfig::default();
        config.proxies.push(section("fe", ProxyMode::Listen, vec![b]));
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors[0].field, "proxies[0].bind[0].bind_mode");
    }
}
