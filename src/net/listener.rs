//! Listener lifecycle.
//!
//! # States
//! ```text
//! Init ──add_listener──▶ Assigned ──bind (success)──▶ Listening
//!                           │
//!                           └── bind (failure): stays Assigned, no fd
//! ```
//!
//! # Responsibilities
//! - Hold one configured listening address with its options
//! - Create, tune, bind and listen the socket, reporting an `ErrCode`
//! - Register the bound fd with the event loop
//!
//! # Design Decisions
//! - The socket is owned by a local until `listen` succeeds; every early
//!   return drops (closes) it exactly once
//! - `bind` on a listener that is not `Assigned` is a no-op returning `NONE`
//! - The fd exists iff the state is `Listening`

use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::Arc;

use serde::Serialize;

use crate::diagnostic::{ErrBuf, ErrCode};
use crate::net::fd::{FdEntry, FdRegistrar, ReadyHandler};
use crate::net::foreign::{bind_foreign, BindMode, ForeignBindError, TransparentCapability};
use crate::net::protocol::{ProtocolDescriptor, ProtocolKind};
use crate::net::socket::{ListenSocket, SocketFactory, SocketLimit};
use crate::proxy::FrontendId;

/// Index of a listener inside the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ListenerId(pub(crate) usize);

impl ListenerId {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl std::fmt::Display for ListenerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ListenerState {
    /// Declared, not attached to a protocol.
    Init,
    /// Attached to a protocol, not bound yet.
    Assigned,
    /// Bound and listening.
    Listening,
}

/// Per-listener option bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ListenerOptions {
    /// Reset connections on close instead of lingering.
    pub no_linger: bool,
    /// Bind through the foreign-address binder.
    pub foreign: bool,
}

/// Collaborators a bind needs.
pub struct BindEnv<'a> {
    pub sockets: &'a dyn SocketFactory,
    pub limits: &'a dyn SocketLimit,
    pub fds: &'a mut dyn FdRegistrar,
}

/// One configured listening socket.
pub struct Listener {
    id: ListenerId,
    state: ListenerState,
    addr: SocketAddr,
    bind_mode: BindMode,
    foreign_addr: Option<SocketAddr>,
    options: ListenerOptions,
    backlog: Option<u32>,
    maxconn: u32,
    frontend: FrontendId,
    protocol: Option<ProtocolKind>,
    accept: Arc<dyn ReadyHandler>,
    socket: Option<Box<dyn ListenSocket>>,
}

impl Listener {
    pub(crate) fn new(
        id: ListenerId,
        addr: SocketAddr,
        frontend: FrontendId,
        accept: Arc<dyn ReadyHandler>,
    ) -> Self {
        Self {
            id,
            state: ListenerState::Init,
            addr,
            bind_mode: BindMode::None,
            foreign_addr: None,
            options: ListenerOptions::default(),
            backlog: None,
            maxconn: 2000,
            frontend,
            protocol: None,
            accept,
            socket: None,
        }
    }

    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn state(&self) -> ListenerState {
        self.state
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn frontend(&self) -> FrontendId {
        self.frontend
    }

    pub fn protocol(&self) -> Option<ProtocolKind> {
        self.protocol
    }

    pub fn options(&self) -> ListenerOptions {
        self.options
    }

    pub fn bind_mode(&self) -> BindMode {
        self.bind_mode
    }

    pub fn backlog(&self) -> Option<u32> {
        self.backlog
    }

    pub fn maxconn(&self) -> u32 {
        self.maxconn
    }

    /// The bound fd, only while `Listening`.
    pub fn fd(&self) -> Option<RawFd> {
        self.socket.as_ref().map(|s| s.raw_fd())
    }

    pub fn set_options(&mut self, options: ListenerOptions) {
        self.options = options;
    }

    /// 0 means "use maxconn".
    pub fn set_backlog(&mut self, backlog: Option<u32>) {
        self.backlog = backlog.filter(|b| *b > 0);
    }

    pub fn set_maxconn(&mut self, maxconn: u32) {
        self.maxconn = maxconn;
    }

    /// Select which fields of `remote` override the local address when
    /// binding through the foreign binder.
    pub fn set_foreign(&mut self, mode: BindMode, remote: Option<SocketAddr>) {
        self.bind_mode = mode;
        self.foreign_addr = remote;
    }

    pub(crate) fn assign(&mut self, protocol: ProtocolKind) -> bool {
        if self.state != ListenerState::Init {
            return false;
        }
        self.state = ListenerState::Assigned;
        self.protocol = Some(protocol);
        true
    }

    /// Bind and listen. Messages land in `err`; the return value tells the
    /// caller whether to go on, retry, or abort the batch.
    pub fn bind(
        &mut self,
        proto: &ProtocolDescriptor,
        capability: &mut TransparentCapability,
        env: &mut BindEnv<'_>,
        err: &mut ErrBuf<'_>,
    ) -> ErrCode {
        err.clear();

        if self.state != ListenerState::Assigned {
            return ErrCode::NONE;
        }

        let mut code = ErrCode::NONE;

        let sock = match env.sockets.open(proto.domain, proto.sock_type, proto.transport) {
            Ok(sock) => sock,
            Err(e) => {
                tracing::debug!(address = %self.addr, error = %e, "socket() failed");
                err.set("cannot create listening socket");
                return code | ErrCode::RETRYABLE | ErrCode::ALERT;
            }
        };

        let fd = sock.raw_fd();
        if usize::try_from(fd).map_or(true, |fd| fd >= env.limits.max_sockets()) {
            err.set("not enough free sockets (raise 'global.max_sockets')");
            return code | ErrCode::ABORT | ErrCode::ALERT;
        }

        if sock.set_nonblocking().is_err() || sock.set_nodelay().is_err() {
            err.set("cannot make socket non-blocking");
            return code | ErrCode::FATAL | ErrCode::ALERT;
        }

        if sock.set_reuse_address().is_err() {
            // not fatal but should be reported
            err.set("cannot do so_reuseaddr");
            code |= ErrCode::ALERT;
        }

        if self.options.no_linger {
            let _ = sock.set_nolinger();
        }

        let _ = sock.set_reuse_port();

        if self.options.foreign {
            let remote = self.foreign_addr.unwrap_or(self.addr);
            if let Err(e) = bind_foreign(sock.as_ref(), self.bind_mode, &self.addr, &remote, capability) {
                tracing::debug!(address = %self.addr, error = %e, code = e.code(), "foreign bind failed");
                return match e {
                    ForeignBindError::Local { .. } => {
                        err.set("cannot bind socket");
                        code | ErrCode::RETRYABLE | ErrCode::ALERT
                    }
                    ForeignBindError::Foreign { .. } => {
                        err.set("cannot satisfy foreign address");
                        code | ErrCode::FATAL | ErrCode::ALERT
                    }
                };
            }
        } else if let Err(e) = sock.bind(&self.addr) {
            tracing::debug!(address = %self.addr, error = %e, "bind() failed");
            err.set("cannot bind socket");
            return code | ErrCode::RETRYABLE | ErrCode::ALERT;
        }

        let backlog = self.backlog.unwrap_or(self.maxconn);
        if let Err(e) = sock.listen(backlog) {
            tracing::debug!(address = %self.addr, error = %e, "listen() failed");
            err.set("cannot listen to socket");
            return code | ErrCode::RETRYABLE | ErrCode::ALERT;
        }

        self.socket = Some(sock);
        self.state = ListenerState::Listening;
        env.fds.register(fd, FdEntry::listener(self.id, Arc::clone(&self.accept)));

        tracing::info!(
            listener = %self.id,
            address = %self.addr,
            protocol = proto.name,
            fd,
            backlog,
            "listening"
        );
        code
    }

    /// Destroy the listener, closing its socket if bound. Returns the closed fd.
    pub(crate) fn close(mut self, fds: &mut dyn FdRegistrar) -> Option<RawFd> {
        let sock = self.socket.take()?;
        let fd = sock.raw_fd();
        fds.unregister(fd);
        drop(sock);
        Some(fd)
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("addr", &self.addr)
            .field("bind_mode", &self.bind_mode)
            .field("options", &self.options)
            .field("fd", &self.fd())
            .finish()
    }
}
