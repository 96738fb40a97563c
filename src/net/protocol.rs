//! Protocol families and their listeners.
//!
//! # Data Flow
//! ```text
//! startup:   register(tcpv4), register(tcpv6)
//! config:    create_listener() → Init
//!            tcpv4_add_listener / tcpv6_add_listener → Assigned
//! bind:      bind_all(kind) → Listener::bind per listener, codes OR-ed
//! serving:   enable_all(kind) → hand each fd to the event loop
//! shutdown:  unbind_all(kind) → close sockets, destroy listeners
//! ```
//!
//! # Design Decisions
//! - The registry is an explicit object passed around, not a global table
//! - Listener records live in the registry; descriptors keep ordered ids, so a
//!   listener can only ever sit in one descriptor's collection
//! - The transparent-bind capability cache is owned here, next to the
//!   listeners it governs
//! - `bind_all` stops at the first abort but keeps what it already bound

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use serde::Serialize;
use socket2::{Domain, Protocol, Type};

use crate::diagnostic::{ErrBuf, ErrCode};
use crate::net::fd::{FdRegistrar, ReadyHandler};
use crate::net::foreign::TransparentCapability;
use crate::net::listener::{BindEnv, Listener, ListenerId, ListenerState};
use crate::observability::metrics;
use crate::proxy::FrontendId;

/// Supported address families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ProtocolKind {
    TcpV4,
    TcpV6,
}

impl ProtocolKind {
    /// Family matching a socket address.
    pub fn for_addr(addr: &SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(_) => ProtocolKind::TcpV4,
            SocketAddr::V6(_) => ProtocolKind::TcpV6,
        }
    }
}

/// Identity of one address family.
#[derive(Debug)]
pub struct ProtocolDescriptor {
    pub kind: ProtocolKind,
    pub name: &'static str,
    pub domain: Domain,
    pub sock_type: Type,
    pub transport: Protocol,
    /// Size of the family's socket address.
    pub sock_addrlen: usize,
    /// Size of the family's network address.
    pub l3_addrlen: usize,
    listeners: Vec<ListenerId>,
    nb_listeners: usize,
}

impl ProtocolDescriptor {
    pub fn tcpv4() -> Self {
        Self {
            kind: ProtocolKind::TcpV4,
            name: "tcpv4",
            domain: Domain::IPV4,
            sock_type: Type::STREAM,
            transport: Protocol::TCP,
            sock_addrlen: std::mem::size_of::<libc::sockaddr_in>(),
            l3_addrlen: 32 / 8,
            listeners: Vec::new(),
            nb_listeners: 0,
        }
    }

    pub fn tcpv6() -> Self {
        Self {
            kind: ProtocolKind::TcpV6,
            name: "tcpv6",
            domain: Domain::IPV6,
            sock_type: Type::STREAM,
            transport: Protocol::TCP,
            sock_addrlen: std::mem::size_of::<libc::sockaddr_in6>(),
            l3_addrlen: 128 / 8,
            listeners: Vec::new(),
            nb_listeners: 0,
        }
    }

    /// Listener ids in attachment order.
    pub fn listeners(&self) -> &[ListenerId] {
        &self.listeners
    }

    pub fn nb_listeners(&self) -> usize {
        self.nb_listeners
    }
}

/// All protocol families and the listeners attached to them.
#[derive(Debug, Default)]
pub struct ProtocolRegistry {
    protocols: Vec<ProtocolDescriptor>,
    listeners: HashMap<ListenerId, Listener>,
    next_listener: usize,
    capability: TransparentCapability,
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with both TCP families registered.
    pub fn with_tcp() -> Self {
        let mut registry = Self::new();
        registry.register(ProtocolDescriptor::tcpv4());
        registry.register(ProtocolDescriptor::tcpv6());
        registry
    }

    /// Add a family. Registering the same family twice is a no-op.
    pub fn register(&mut self, proto: ProtocolDescriptor) {
        if self.protocol(proto.kind).is_some() {
            return;
        }
        tracing::debug!(protocol = proto.name, "protocol registered");
        self.protocols.push(proto);
    }

    pub fn protocol(&self, kind: ProtocolKind) -> Option<&ProtocolDescriptor> {
        self.protocols.iter().find(|p| p.kind == kind)
    }

    pub fn protocols(&self) -> impl Iterator<Item = &ProtocolDescriptor> {
        self.protocols.iter()
    }

    pub fn listener(&self, id: ListenerId) -> Option<&Listener> {
        self.listeners.get(&id)
    }

    pub fn listener_mut(&mut self, id: ListenerId) -> Option<&mut Listener> {
        self.listeners.get_mut(&id)
    }

    pub fn capability(&self) -> &TransparentCapability {
        &self.capability
    }

    pub fn capability_mut(&mut self) -> &mut TransparentCapability {
        &mut self.capability
    }

    /// Declare a new listener in `Init` state.
    pub fn create_listener(
        &mut self,
        addr: SocketAddr,
        frontend: FrontendId,
        accept: Arc<dyn ReadyHandler>,
    ) -> ListenerId {
        let id = ListenerId(self.next_listener);
        self.next_listener += 1;
        self.listeners.insert(id, Listener::new(id, addr, frontend, accept));
        id
    }

    /// Attach a listener to a family: `Init → Assigned`.
    /// Does nothing if the listener is unknown, not in `Init`, or the family
    /// is not registered.
    pub fn add_listener(&mut self, kind: ProtocolKind, id: ListenerId) {
        let Some(proto) = self.protocols.iter_mut().find(|p| p.kind == kind) else {
            return;
        };
        let Some(listener) = self.listeners.get_mut(&id) else {
            return;
        };
        if !listener.assign(kind) {
            return;
        }
        proto.listeners.push(id);
        proto.nb_listeners += 1;
    }

    pub fn tcpv4_add_listener(&mut self, id: ListenerId) {
        self.add_listener(ProtocolKind::TcpV4, id);
    }

    pub fn tcpv6_add_listener(&mut self, id: ListenerId) {
        self.add_listener(ProtocolKind::TcpV6, id);
    }

    /// Attach to the family matching the listener's address.
    pub fn attach(&mut self, id: ListenerId) {
        let Some(addr) = self.listeners.get(&id).map(|l| l.addr()) else {
            return;
        };
        match ProtocolKind::for_addr(&addr) {
            ProtocolKind::TcpV4 => self.tcpv4_add_listener(id),
            ProtocolKind::TcpV6 => self.tcpv6_add_listener(id),
        }
    }

    /// Bind every listener of a family, in order. Codes are OR-ed together;
    /// an abort stops the loop without undoing earlier binds.
    pub fn bind_all(&mut self, kind: ProtocolKind, env: &mut BindEnv<'_>) -> ErrCode {
        let mut code = ErrCode::NONE;
        let Some(proto) = self.protocols.iter().find(|p| p.kind == kind) else {
            return code;
        };

        for id in &proto.listeners {
            let Some(listener) = self.listeners.get_mut(id) else {
                continue;
            };
            let mut storage = [0u8; 128];
            let mut err = ErrBuf::new(&mut storage);
            let fresh = listener.state() == ListenerState::Assigned;
            let ret = listener.bind(proto, &mut self.capability, env, &mut err);
            if fresh {
                report_bind(proto, listener, ret, &err);
            }
            code |= ret;
            if code.is_abort() {
                break;
            }
        }
        code
    }

    /// Apply `f` to every listener of a family, in order.
    pub fn for_each_listener<F>(&mut self, kind: ProtocolKind, mut f: F)
    where
        F: FnMut(&mut Listener),
    {
        let Some(proto) = self.protocols.iter().find(|p| p.kind == kind) else {
            return;
        };
        for id in &proto.listeners {
            if let Some(listener) = self.listeners.get_mut(id) {
                f(listener);
            }
        }
    }

    /// Hand every listening socket of a family to the event loop.
    pub fn enable_all<F>(&mut self, kind: ProtocolKind, mut enable: F)
    where
        F: FnMut(&Listener),
    {
        self.for_each_listener(kind, |l| {
            if l.state() == ListenerState::Listening {
                enable(l);
            }
        });
    }

    /// Close every socket of a family and destroy its listeners.
    /// Returns how many sockets were closed.
    pub fn unbind_all(&mut self, kind: ProtocolKind, fds: &mut dyn FdRegistrar) -> usize {
        let Some(proto) = self.protocols.iter_mut().find(|p| p.kind == kind) else {
            return 0;
        };
        let mut closed = 0;
        for id in proto.listeners.drain(..) {
            if let Some(listener) = self.listeners.remove(&id) {
                if listener.close(fds).is_some() {
                    closed += 1;
                }
            }
        }
        proto.nb_listeners = 0;
        tracing::info!(protocol = proto.name, closed, "listeners unbound");
        closed
    }
}

fn report_bind(proto: &ProtocolDescriptor, listener: &Listener, code: ErrCode, err: &ErrBuf<'_>) {
    if !code.is_none() {
        if code.is_fatal() {
            tracing::error!(protocol = proto.name, address = %listener.addr(), code = %code, "{}", err.as_str());
        } else {
            tracing::warn!(protocol = proto.name, address = %listener.addr(), code = %code, "{}", err.as_str());
        }
    }
    if code.is_failure() {
        metrics::record_bind_failure(proto.name, code);
    } else if listener.state() == ListenerState::Listening {
        metrics::record_listener_bound(proto.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::fd::tests::RecordingHandler;
    use crate::net::fd::FdTable;
    use crate::net::socket::mock::{Failures, MockSockets};
    use crate::net::socket::ProcessLimits;

    fn handler() -> Arc<dyn ReadyHandler> {
        Arc::new(RecordingHandler::default())
    }

    fn declare(registry: &mut ProtocolRegistry, addr: &str) -> ListenerId {
        registry.create_listener(addr.parse().unwrap(), FrontendId(0), handler())
    }

    #[test]
    fn register_is_idempotent() {
        let mut registry = ProtocolRegistry::with_tcp();
        registry.register(ProtocolDescriptor::tcpv4());
        assert_eq!(registry.protocols().count(), 2);
        let v6 = registry.protocol(ProtocolKind::TcpV6).unwrap();
        assert_eq!(v6.name, "tcpv6");
        assert_eq!(v6.l3_addrlen, 16);
    }

    #[test]
    fn add_listener_assigns_once() {
        let mut registry = ProtocolRegistry::with_tcp();
        let id = declare(&mut registry, "127.0.0.1:80");

        registry.tcpv4_add_listener(id);
        registry.tcpv4_add_listener(id);
        registry.tcpv6_add_listener(id);

        let v4 = registry.protocol(ProtocolKind::TcpV4).unwrap();
        assert_eq!(v4.listeners(), &[id]);
        assert_eq!(v4.nb_listeners(), 1);
        assert_eq!(registry.protocol(ProtocolKind::TcpV6).unwrap().nb_listeners(), 0);

        let listener = registry.listener(id).unwrap();
        assert_eq!(listener.state(), ListenerState::Assigned);
        assert_eq!(listener.protocol(), Some(ProtocolKind::TcpV4));
    }

    #[test]
    fn attach_picks_family_from_address() {
        let mut registry = ProtocolRegistry::with_tcp();
        let v6 = declare(&mut registry, "[::1]:443");
        registry.attach(v6);
        assert_eq!(registry.protocol(ProtocolKind::TcpV6).unwrap().listeners(), &[v6]);
    }

    #[test]
    fn bind_all_aggregates_codes() {
        let blocked: SocketAddr = "127.0.0.1:81".parse().unwrap();
        let sockets = MockSockets::failing(Failures {
            bind_to: vec![blocked],
            ..Default::default()
        });
        let limits = ProcessLimits::fixed(1024);
        let mut fds = FdTable::new();
        let mut registry = ProtocolRegistry::with_tcp();
        let a = declare(&mut registry, "127.0.0.1:80");
        let b = declare(&mut registry, "127.0.0.1:81");
        let c = declare(&mut registry, "127.0.0.1:82");
        for id in [a, b, c] {
            registry.attach(id);
        }

        let mut env = BindEnv {
            sockets: &sockets,
            limits: &limits,
            fds: &mut fds,
        };
        let code = registry.bind_all(ProtocolKind::TcpV4, &mut env);

        assert_eq!(code, ErrCode::RETRYABLE | ErrCode::ALERT);
        assert_eq!(registry.listener(a).unwrap().state(), ListenerState::Listening);
        assert_eq!(registry.listener(b).unwrap().state(), ListenerState::Assigned);
        assert_eq!(registry.listener(c).unwrap().state(), ListenerState::Listening);
        assert_eq!(fds.len(), 2);
    }

    #[test]
    fn bind_all_stops_on_abort_and_keeps_earlier_binds() {
        let sockets = MockSockets::new();
        // first socket gets fd 10, the second fd 11 which hits the ceiling
        let limits = ProcessLimits::fixed(11);
        let mut fds = FdTable::new();
        let mut registry = ProtocolRegistry::with_tcp();
        let ids: Vec<_> = ["127.0.0.1:80", "127.0.0.1:81", "127.0.0.1:82"]
            .iter()
            .map(|a| declare(&mut registry, a))
            .collect();
        for id in &ids {
            registry.attach(*id);
        }

        let mut env = BindEnv {
            sockets: &sockets,
            limits: &limits,
            fds: &mut fds,
        };
        let code = registry.bind_all(ProtocolKind::TcpV4, &mut env);

        assert!(code.is_abort());
        assert_eq!(registry.listener(ids[0]).unwrap().state(), ListenerState::Listening);
        assert_eq!(registry.listener(ids[1]).unwrap().state(), ListenerState::Assigned);
        assert_eq!(registry.listener(ids[2]).unwrap().state(), ListenerState::Assigned);
        // the third listener was never attempted
        assert_eq!(sockets.count("open"), 2);
    }

    #[test]
    fn rebinding_only_touches_assigned_listeners() {
        let sockets = MockSockets::new();
        let limits = ProcessLimits::fixed(1024);
        let mut fds = FdTable::new();
        let mut registry = ProtocolRegistry::with_tcp();
        let id = declare(&mut registry, "127.0.0.1:80");
        registry.attach(id);

        let mut env = BindEnv {
            sockets: &sockets,
            limits: &limits,
            fds: &mut fds,
        };
        registry.bind_all(ProtocolKind::TcpV4, &mut env);
        let code = registry.bind_all(ProtocolKind::TcpV4, &mut env);

        assert_eq!(code, ErrCode::NONE);
        assert_eq!(sockets.count("open"), 1);
    }

    #[test]
    fn enable_and_unbind_walk_listeners_in_order() {
        let sockets = MockSockets::new();
        let limits = ProcessLimits::fixed(1024);
        let mut fds = FdTable::new();
        let mut registry = ProtocolRegistry::with_tcp();
        let a = declare(&mut registry, "127.0.0.1:80");
        let b = declare(&mut registry, "127.0.0.1:81");
        registry.attach(a);
        registry.attach(b);
        {
            let mut env = BindEnv {
                sockets: &sockets,
                limits: &limits,
                fds: &mut fds,
            };
            registry.bind_all(ProtocolKind::TcpV4, &mut env);
        }

        let mut seen = Vec::new();
        registry.enable_all(ProtocolKind::TcpV4, |l| seen.push(l.id()));
        assert_eq!(seen, vec![a, b]);

        let closed = registry.unbind_all(ProtocolKind::TcpV4, &mut fds);
        assert_eq!(closed, 2);
        assert!(fds.is_empty());
        assert_eq!(sockets.closed(), vec![10, 11]);
        assert!(registry.listener(a).is_none());
        assert_eq!(registry.protocol(ProtocolKind::TcpV4).unwrap().nb_listeners(), 0);
    }
}
