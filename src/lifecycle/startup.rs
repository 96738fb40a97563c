//! Startup orchestration.
//!
//! # Responsibilities
//! - Attach declared listeners to their protocol family
//! - Bind every family, retrying batches that only failed transiently
//! - Start readiness tasks for listening sockets
//!
//! # Design Decisions
//! - A batch is retried while its aggregate is retryable and not fatal;
//!   sockets bound in earlier rounds stay bound
//! - Any failure bit left after the last round stops startup
//! - Alert-only results are logged and startup proceeds
//! - Listeners start last (traffic only when ready)

use std::io;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::GlobalConfig;
use crate::diagnostic::ErrCode;
use crate::net::event_loop::spawn_readiness;
use crate::net::fd::FdTable;
use crate::net::listener::BindEnv;
use crate::net::protocol::{ProtocolKind, ProtocolRegistry};
use crate::net::socket::ProcessLimits;
use crate::proxy::Proxy;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("cannot read the process socket limit: {0}")]
    Limits(#[source] io::Error),
    #[error("cannot bind {protocol} listeners ({code})")]
    Bind { protocol: &'static str, code: ErrCode },
    #[error("cannot watch listening socket: {0}")]
    Readiness(#[source] io::Error),
}

/// How a retryable bind batch is attempted again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub delay: Duration,
}

impl From<&GlobalConfig> for RetryPolicy {
    fn from(global: &GlobalConfig) -> Self {
        Self {
            retries: global.bind_retries,
            delay: Duration::from_millis(global.bind_retry_delay_ms),
        }
    }
}

/// Socket ceiling from configuration, or the process fd limit.
pub fn socket_limits(global: &GlobalConfig) -> Result<ProcessLimits, StartupError> {
    match global.max_sockets {
        Some(max) => Ok(ProcessLimits::fixed(max)),
        None => ProcessLimits::from_rlimit().map_err(StartupError::Limits),
    }
}

/// Attach every listener of every proxy to the family of its address.
pub fn attach_listeners(registry: &mut ProtocolRegistry, proxies: &[Proxy]) {
    for proxy in proxies {
        for id in &proxy.listeners {
            registry.attach(*id);
        }
    }
}

/// Bind every registered family. Returns the OR of the final codes.
pub async fn bind_protocols(
    registry: &mut ProtocolRegistry,
    env: &mut BindEnv<'_>,
    policy: RetryPolicy,
) -> Result<ErrCode, StartupError> {
    let kinds: Vec<(ProtocolKind, &'static str)> = registry.protocols().map(|p| (p.kind, p.name)).collect();
    let mut aggregate = ErrCode::NONE;

    for (kind, name) in kinds {
        let mut attempt = 0;
        let code = loop {
            let code = registry.bind_all(kind, env);
            if code.is_retryable() && !code.is_fatal() && attempt < policy.retries {
                attempt += 1;
                tracing::warn!(protocol = name, attempt, retries = policy.retries, "retrying listener bind");
                tokio::time::sleep(policy.delay).await;
                continue;
            }
            break code;
        };

        if code.is_failure() {
            return Err(StartupError::Bind { protocol: name, code });
        }
        if !code.is_none() {
            tracing::warn!(protocol = name, code = %code, "listeners bound with alerts");
        }
        aggregate |= code;
    }
    Ok(aggregate)
}

/// Spawn a readiness task for every listening socket.
pub fn enable_listeners(
    registry: &mut ProtocolRegistry,
    fds: &FdTable,
    shutdown: &broadcast::Sender<()>,
) -> Result<Vec<JoinHandle<()>>, StartupError> {
    let kinds: Vec<ProtocolKind> = registry.protocols().map(|p| p.kind).collect();
    let mut tasks = Vec::new();
    let mut failure = None;

    for kind in kinds {
        registry.enable_all(kind, |listener| {
            let Some(fd) = listener.fd() else { return };
            let Some(entry) = fds.get(fd) else { return };
            match spawn_readiness(fd, entry.clone(), shutdown.subscribe()) {
                Ok(task) => {
                    tracing::info!(address = %listener.addr(), frontend = %listener.frontend(), "listening");
                    tasks.push(task);
                }
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        });
    }

    match failure {
        Some(e) => {
            for task in &tasks {
                task.abort();
            }
            Err(StartupError::Readiness(e))
        }
        None => Ok(tasks),
    }
}
