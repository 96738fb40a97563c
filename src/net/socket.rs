//! Socket syscall seam.
//!
//! # Responsibilities
//! - Create stream sockets for a protocol family
//! - Expose the option/bind/listen steps a listener needs, one call each
//! - Provide the process-wide socket ceiling
//!
//! # Design Decisions
//! - Listeners talk to `dyn ListenSocket`, never to raw fds, so every setup
//!   step can be failed on purpose in tests
//! - Dropping a socket closes it; ownership moves into the listener on success
//! - The NAT redirection fallback only exists with the `cttproxy` feature

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};

/// One socket being prepared for listening.
pub trait ListenSocket: fmt::Debug + Send {
    fn raw_fd(&self) -> RawFd;
    fn set_nonblocking(&self) -> io::Result<()>;
    /// Disable small-packet coalescing (TCP_NODELAY).
    fn set_nodelay(&self) -> io::Result<()>;
    fn set_reuse_address(&self) -> io::Result<()>;
    /// Zero linger: close() resets instead of lingering.
    fn set_nolinger(&self) -> io::Result<()>;
    fn set_reuse_port(&self) -> io::Result<()>;
    /// Allow binding to a non-local address (IP_TRANSPARENT, else IP_FREEBIND).
    fn set_transparent(&self) -> io::Result<()>;
    fn bind(&self, addr: &SocketAddr) -> io::Result<()>;
    fn listen(&self, backlog: u32) -> io::Result<()>;
    /// Install a one-shot outbound NAT mapping to `foreign`.
    fn nat_assign(&self, foreign: &SocketAddr) -> io::Result<()>;
    /// Apply the installed NAT mapping on the next connect only.
    fn nat_connect_once(&self) -> io::Result<()>;
}

/// Creates sockets.
pub trait SocketFactory {
    fn open(&self, domain: Domain, ty: Type, protocol: Protocol) -> io::Result<Box<dyn ListenSocket>>;
}

/// Process-wide resource limits consulted before keeping a new fd.
pub trait SocketLimit {
    /// Fds at or above this value are refused.
    fn max_sockets(&self) -> usize;
}

/// Real sockets through socket2.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemSockets;

impl SocketFactory for SystemSockets {
    fn open(&self, domain: Domain, ty: Type, protocol: Protocol) -> io::Result<Box<dyn ListenSocket>> {
        let inner = Socket::new(domain, ty, Some(protocol))?;
        Ok(Box::new(SystemSocket { inner, domain }))
    }
}

#[derive(Debug)]
pub struct SystemSocket {
    inner: Socket,
    domain: Domain,
}

impl ListenSocket for SystemSocket {
    fn raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }

    fn set_nonblocking(&self) -> io::Result<()> {
        self.inner.set_nonblocking(true)
    }

    fn set_nodelay(&self) -> io::Result<()> {
        self.inner.set_nodelay(true)
    }

    fn set_reuse_address(&self) -> io::Result<()> {
        self.inner.set_reuse_address(true)
    }

    fn set_nolinger(&self) -> io::Result<()> {
        self.inner.set_linger(Some(Duration::ZERO))
    }

    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    fn set_reuse_port(&self) -> io::Result<()> {
        self.inner.set_reuse_port(true)
    }

    #[cfg(not(all(unix, not(any(target_os = "solaris", target_os = "illumos")))))]
    fn set_reuse_port(&self) -> io::Result<()> {
        Err(io::Error::from(io::ErrorKind::Unsupported))
    }

    #[cfg(target_os = "linux")]
    fn set_transparent(&self) -> io::Result<()> {
        if self.inner.set_ip_transparent(true).is_ok() {
            return Ok(());
        }
        if self.domain == Domain::IPV6 {
            self.inner.set_freebind_ipv6(true)
        } else {
            self.inner.set_freebind(true)
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn set_transparent(&self) -> io::Result<()> {
        Err(io::Error::from(io::ErrorKind::Unsupported))
    }

    fn bind(&self, addr: &SocketAddr) -> io::Result<()> {
        self.inner.bind(&(*addr).into())
    }

    fn listen(&self, backlog: u32) -> io::Result<()> {
        self.inner.listen(backlog.min(i32::MAX as u32) as i32)
    }

    #[cfg(all(feature = "cttproxy", target_os = "linux"))]
    fn nat_assign(&self, foreign: &SocketAddr) -> io::Result<()> {
        cttproxy::assign(self.raw_fd(), foreign)
    }

    #[cfg(not(all(feature = "cttproxy", target_os = "linux")))]
    fn nat_assign(&self, _foreign: &SocketAddr) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "NAT redirection support not compiled in",
        ))
    }

    #[cfg(all(feature = "cttproxy", target_os = "linux"))]
    fn nat_connect_once(&self) -> io::Result<()> {
        cttproxy::connect_once(self.raw_fd())
    }

    #[cfg(not(all(feature = "cttproxy", target_os = "linux")))]
    fn nat_connect_once(&self) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "NAT redirection support not compiled in",
        ))
    }
}

/// Legacy CTTPROXY kernel interface (IP_TPROXY socket option).
#[cfg(all(feature = "cttproxy", target_os = "linux"))]
mod cttproxy {
    use std::io;
    use std::net::SocketAddr;
    use std::os::fd::RawFd;

    const IP_TPROXY: libc::c_int = 11;
    const TPROXY_ASSIGN: u8 = 1;
    const TPROXY_FLAGS: u8 = 4;
    const ITP_CONNECT: u32 = 0x01;
    const ITP_ONCE: u32 = 0x08;

    #[repr(C)]
    #[derive(Clone, Copy)]
    struct InTproxyAddr {
        faddr: libc::in_addr,
        fport: u16,
    }

    #[repr(C)]
    union InTproxyValue {
        addr: InTproxyAddr,
        flags: u32,
    }

    #[repr(C)]
    struct InTproxy {
        op: u8,
        v: InTproxyValue,
    }

    fn set(fd: RawFd, itp: &InTproxy) -> io::Result<()> {
        // SAFETY: `itp` is a live #[repr(C)] value and the length passed is its size.
        let ret = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_IP,
                IP_TPROXY,
                itp as *const InTproxy as *const libc::c_void,
                std::mem::size_of::<InTproxy>() as libc::socklen_t,
            )
        };
        if ret == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    pub(super) fn assign(fd: RawFd, foreign: &SocketAddr) -> io::Result<()> {
        let SocketAddr::V4(v4) = foreign else {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "NAT redirection only handles IPv4",
            ));
        };
        let itp = InTproxy {
            op: TPROXY_ASSIGN,
            v: InTproxyValue {
                addr: InTproxyAddr {
                    faddr: libc::in_addr {
                        s_addr: u32::from_ne_bytes(v4.ip().octets()),
                    },
                    fport: v4.port().to_be(),
                },
            },
        };
        set(fd, &itp)
    }

    pub(super) fn connect_once(fd: RawFd) -> io::Result<()> {
        let itp = InTproxy {
            op: TPROXY_FLAGS,
            v: InTproxyValue {
                flags: ITP_CONNECT | ITP_ONCE,
            },
        };
        set(fd, &itp)
    }
}

/// Socket ceiling taken from configuration or the process fd limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessLimits {
    max_sockets: usize,
}

impl ProcessLimits {
    pub fn fixed(max_sockets: usize) -> Self {
        Self { max_sockets }
    }

    /// Read RLIMIT_NOFILE's soft limit.
    pub fn from_rlimit() -> io::Result<Self> {
        let mut lim = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        // SAFETY: getrlimit only writes into the struct we hand it.
        let ret = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut lim) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        let max_sockets = if lim.rlim_cur == libc::RLIM_INFINITY {
            usize::MAX
        } else {
            usize::try_from(lim.rlim_cur).unwrap_or(usize::MAX)
        };
        Ok(Self { max_sockets })
    }
}

impl SocketLimit for ProcessLimits {
    fn max_sockets(&self) -> usize {
        self.max_sockets
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_socket_binds_and_listens_on_loopback() {
        let socket = SystemSockets
            .open(Domain::IPV4, Type::STREAM, Protocol::TCP)
            .unwrap();
        socket.set_nonblocking().unwrap();
        socket.set_nodelay().unwrap();
        socket.set_reuse_address().unwrap();
        socket.set_nolinger().unwrap();
        socket.bind(&"127.0.0.1:0".parse().unwrap()).unwrap();
        socket.listen(16).unwrap();
        assert!(socket.raw_fd() >= 0);
    }

    #[cfg(not(feature = "cttproxy"))]
    #[test]
    fn nat_fallback_unsupported_without_feature() {
        let socket = SystemSockets
            .open(Domain::IPV4, Type::STREAM, Protocol::TCP)
            .unwrap();
        let err = socket
            .nat_assign(&"192.0.2.1:80".parse().unwrap())
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }

    #[test]
    fn rlimit_is_positive() {
        let limits = ProcessLimits::from_rlimit().unwrap();
        assert!(limits.max_sockets() > 0);
    }
}
