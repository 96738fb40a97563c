//! Foreign (transparent) address binding.
//!
//! # Responsibilities
//! - Bind a socket to an address that may not belong to a local interface
//! - Compose the target address from a local and a remote address
//! - Fall back to NAT redirection when direct binding is unavailable
//!
//! # Two methods
//! ```text
//! direct: IP_TRANSPARENT / IP_FREEBIND, then bind(foreign)
//! NAT:    bind(local), then assign a one-shot redirection to foreign
//! ```
//!
//! # Design Decisions
//! - The direct capability is probed once per process. The first failure
//!   clears it for good; later sockets skip the syscall entirely.
//! - The cache lives in `TransparentCapability`, owned by the registry
//! - "Local bind failed" (1) and "foreign unsatisfiable" (2) stay distinct

use std::io;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::net::socket::ListenSocket;

/// Which fields of the remote address override the local one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BindMode {
    /// Ignore the remote address.
    #[default]
    None,
    /// Use the remote host.
    Address,
    /// Use the remote port.
    Port,
    /// Use both host and port.
    Both,
}

impl BindMode {
    /// Decode the 2-bit form: bit 0 = address, bit 1 = port.
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x3 {
            0 => BindMode::None,
            1 => BindMode::Address,
            2 => BindMode::Port,
            _ => BindMode::Both,
        }
    }

    pub fn bits(self) -> u8 {
        match self {
            BindMode::None => 0,
            BindMode::Address => 1,
            BindMode::Port => 2,
            BindMode::Both => 3,
        }
    }

    pub fn is_none(self) -> bool {
        self == BindMode::None
    }

    pub fn uses_address(self) -> bool {
        self.bits() & 1 != 0
    }

    pub fn uses_port(self) -> bool {
        self.bits() & 2 != 0
    }
}

/// Process-wide cache of the direct transparent-bind capability.
///
/// Starts available. Once a probe fails it stays unavailable until
/// [`reset`](Self::reset) is called explicitly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransparentCapability {
    available: bool,
}

impl TransparentCapability {
    pub fn new() -> Self {
        Self { available: true }
    }

    pub fn is_available(&self) -> bool {
        self.available
    }

    pub fn mark_unavailable(&mut self) {
        self.available = false;
    }

    pub fn reset(&mut self) {
        self.available = true;
    }
}

impl Default for TransparentCapability {
    fn default() -> Self {
        Self::new()
    }
}

/// Failure of a foreign bind.
#[derive(Debug, Error)]
pub enum ForeignBindError {
    /// The plain local bind failed.
    #[error("cannot bind to local address {addr}: {source}")]
    Local {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Foreign addressing was requested and could not be honored.
    #[error("cannot satisfy foreign address {addr}")]
    Foreign {
        addr: SocketAddr,
        #[source]
        source: Option<io::Error>,
    },
}

impl ForeignBindError {
    /// 1 for a local bind failure, 2 for an unsatisfiable foreign address.
    pub fn code(&self) -> u8 {
        match self {
            ForeignBindError::Local { .. } => 1,
            ForeignBindError::Foreign { .. } => 2,
        }
    }
}

/// Overlay the fields selected by `mode` from `remote` onto `local`.
///
/// Unselected fields keep the local address's values; they are not zeroed
/// to `0.0.0.0` or port 0. With `BindMode::None` the local address is
/// returned untouched.
pub fn compose_foreign_addr(mode: BindMode, local: &SocketAddr, remote: &SocketAddr) -> SocketAddr {
    let ip = if mode.uses_address() {
        remote.ip()
    } else {
        local.ip()
    };
    let port = if mode.uses_port() {
        remote.port()
    } else {
        local.port()
    };
    SocketAddr::new(ip, port)
}

/// Bind `sock` to `local`, or to the foreign address built from `remote`.
///
/// `remote` is only read when `mode` is not `None`.
pub fn bind_foreign(
    sock: &dyn ListenSocket,
    mode: BindMode,
    local: &SocketAddr,
    remote: &SocketAddr,
    capability: &mut TransparentCapability,
) -> Result<(), ForeignBindError> {
    let mut foreign_ok = false;

    if !mode.is_none() && capability.is_available() {
        match sock.set_transparent() {
            Ok(()) => foreign_ok = true,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    "transparent binding unavailable, disabling it for this process"
                );
                capability.mark_unavailable();
            }
        }
    }

    let target = if mode.is_none() {
        *local
    } else {
        compose_foreign_addr(mode, local, remote)
    };

    // failure here surfaces as a bind error below
    let _ = sock.set_reuse_address();

    if foreign_ok {
        sock.bind(&target).map_err(|source| ForeignBindError::Foreign {
            addr: target,
            source: Some(source),
        })?;
    } else {
        sock.bind(local).map_err(|source| ForeignBindError::Local {
            addr: *local,
            source,
        })?;
    }

    if mode.is_none() {
        return Ok(());
    }

    let mut last_err = None;
    if !foreign_ok {
        match sock
            .nat_assign(&target)
            .and_then(|()| sock.nat_connect_once())
        {
            Ok(()) => foreign_ok = true,
            Err(e) => last_err = Some(e),
        }
    }

    if !foreign_ok {
        return Err(ForeignBindError::Foreign {
            addr: target,
            source: last_err,
        });
    }

    tracing::debug!(foreign = %target, mode = ?mode, "foreign bind satisfied");
    Ok(())
}
