//! Readiness tasks for registered fds.
//!
//! # Responsibilities
//! - Watch each listening fd for readability on the Tokio reactor
//! - Run the fd's read callback on readiness, never a write callback
//! - Accept pending connections and hand them to the session layer
//!
//! # Data Flow
//! ```text
//! FdTable (listening fds)
//!     → spawn_readiness: AsyncFd<RawFd> readable
//!         → FdEntry.read (Acceptor::on_ready)
//!             → accept until WouldBlock
//!             → Accepted ──bounded mpsc──► session::run_sessions
//! ```
//!
//! # Design Decisions
//! - The listener keeps ownership of its socket; tasks only borrow the fd
//!   and must be stopped before `unbind_all` closes it
//! - Accept stays synchronous inside the callback so the handler matches
//!   the fd table's callback shape
//! - The accept queue is bounded by the configured maxconn; when it is full
//!   new connections are closed right after accept

use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};

use socket2::SockRef;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::net::fd::{FdEntry, FdOwner, ReadyHandler};
use crate::config::ProxyConfig;
use crate::net::listener::ListenerId;
use crate::proxy::FrontendId;

/// A connection taken off a listening socket.
#[derive(Debug)]
pub struct Accepted {
    pub stream: std::net::TcpStream,
    pub peer: Option<SocketAddr>,
    pub frontend: FrontendId,
    pub listener: Option<ListenerId>,
}

/// Capacity of the accept queue: the sum of every listener's maxconn.
pub fn accept_queue_capacity(config: &ProxyConfig) -> usize {
    let default = config.defaults.maxconn as usize;
    let total: usize = config
        .proxies
        .iter()
        .flat_map(|px| px.bind.iter())
        .map(|bind| bind.maxconn.map_or(default, |n| n as usize))
        .sum();
    total.max(1)
}

/// Accept handler of one frontend's listeners.
#[derive(Debug, Clone)]
pub struct Acceptor {
    frontend: FrontendId,
    tx: mpsc::Sender<Accepted>,
}

impl Acceptor {
    pub fn new(frontend: FrontendId, tx: mpsc::Sender<Accepted>) -> Self {
        Self { frontend, tx }
    }
}

impl ReadyHandler for Acceptor {
    fn on_ready(&self, fd: BorrowedFd<'_>, owner: &FdOwner) -> io::Result<()> {
        let listener = match owner {
            FdOwner::Listener(id) => Some(*id),
            _ => None,
        };
        let sock = SockRef::from(&fd);

        loop {
            let (conn, peer) = match sock.accept() {
                Ok(pair) => pair,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            conn.set_nonblocking(true)?;
            let accepted = Accepted {
                stream: conn.into(),
                peer: peer.as_socket(),
                frontend: self.frontend,
                listener,
            };
            match self.tx.try_send(accepted) {
                Ok(()) => {}
                Err(TrySendError::Full(dropped)) => {
                    tracing::warn!(
                        frontend = %self.frontend,
                        peer = ?dropped.peer,
                        "accept queue full, dropping connection"
                    );
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!(fd = fd.as_raw_fd(), "no session runner, dropping connection");
                    return Ok(());
                }
            }
        }
    }
}

/// Start one readiness task per listening fd in `table`.
#[cfg(test)]
pub(crate) fn spawn_listeners(
    table: &crate::net::fd::FdTable,
    shutdown: &broadcast::Sender<()>,
) -> io::Result<Vec<JoinHandle<()>>> {
    table
        .listening()
        .map(|(fd, entry)| spawn_readiness(fd, entry.clone(), shutdown.subscribe()))
        .collect()
}

/// Drive `entry`'s read callback each time `fd` becomes readable, until
/// shutdown. `fd` must stay open until the returned task has finished.
pub(crate) fn spawn_readiness(
    fd: RawFd,
    entry: FdEntry,
    mut shutdown: broadcast::Receiver<()>,
) -> io::Result<JoinHandle<()>> {
    let async_fd = AsyncFd::with_interest(fd, Interest::READABLE)?;

    Ok(tokio::spawn(async move {
        tracing::debug!(fd, owner = ?entry.owner, "readiness task started");
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                ready = async_fd.readable() => {
                    let mut guard = match ready {
                        Ok(guard) => guard,
                        Err(e) => {
                            tracing::error!(fd, error = %e, "readiness wait failed");
                            break;
                        }
                    };
                    if let Some(read) = &entry.read {
                        // SAFETY: the fd is owned by a bound listener, which is
                        // only closed after every readiness task has stopped.
                        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
                        if let Err(e) = read.on_ready(borrowed, &entry.owner) {
                            tracing::warn!(fd, owner = ?entry.owner, error = %e, "read callback failed");
                        }
                    }
                    guard.clear_ready();
                }
            }
        }
        tracing::debug!(fd, "readiness task stopped");
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::TcpListener;
    use std::os::fd::AsFd;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::net::fd::{FdRegistrar, FdTable};

    #[tokio::test]
    async fn accepts_and_forwards_connections() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let addr = listener.local_addr().unwrap();
        let fd = listener.as_raw_fd();

        let (tx, mut rx) = mpsc::channel(8);
        let (shutdown, _) = broadcast::channel(1);
        let mut table = FdTable::new();
        table.register(
            fd,
            FdEntry::listener(ListenerId(4), Arc::new(Acceptor::new(FrontendId(2), tx))),
        );
        let tasks = spawn_listeners(&table, &shutdown).unwrap();
        assert_eq!(tasks.len(), 1);

        let mut client = std::net::TcpStream::connect(addr).unwrap();
        client.write_all(b"hi").unwrap();

        let accepted = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(accepted.frontend, FrontendId(2));
        assert_eq!(accepted.listener, Some(ListenerId(4)));
        assert_eq!(accepted.peer, Some(client.local_addr().unwrap()));

        shutdown.send(()).unwrap();
        for task in tasks {
            task.await.unwrap();
        }
    }

    #[test]
    fn acceptor_returns_when_nothing_pending() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let (tx, _rx) = mpsc::channel(1);
        let acceptor = Acceptor::new(FrontendId(0), tx);
        acceptor
            .on_ready(listener.as_fd(), &FdOwner::Listener(ListenerId(0)))
            .unwrap();
    }

    #[test]
    fn full_queue_drops_extra_connections() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let _first = std::net::TcpStream::connect(addr).unwrap();
        let _second = std::net::TcpStream::connect(addr).unwrap();
        // both handshakes are complete once connect returns; wait for the
        // kernel to move them to the accept queue
        std::thread::sleep(Duration::from_millis(50));
        listener.set_nonblocking(true).unwrap();

        let (tx, mut rx) = mpsc::channel(1);
        let acceptor = Acceptor::new(FrontendId(1), tx);
        acceptor
            .on_ready(listener.as_fd(), &FdOwner::Listener(ListenerId(5)))
            .unwrap();

        let queued = rx.try_recv().unwrap();
        assert_eq!(queued.listener, Some(ListenerId(5)));
        assert!(rx.try_recv().is_err());
        // the dropped connection was taken off the listener as well
        assert_eq!(
            listener.accept().unwrap_err().kind(),
            io::ErrorKind::WouldBlock
        );
    }

    #[test]
    fn closed_queue_stops_accepting() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = std::net::TcpStream::connect(addr).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        listener.set_nonblocking(true).unwrap();

        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let acceptor = Acceptor::new(FrontendId(0), tx);
        acceptor
            .on_ready(listener.as_fd(), &FdOwner::Listener(ListenerId(0)))
            .unwrap();
    }

    #[test]
    fn queue_capacity_sums_listener_maxconn() {
        let config: ProxyConfig = toml::from_str(
            r#"
            [defaults]
            maxconn = 100

            [[proxies]]
            name = "web"
            mode = "frontend"
            [[proxies.bind]]
            address = "127.0.0.1:0"
            [[proxies.bind]]
            address = "127.0.0.1:0"
            maxconn = 5
            "#,
        )
        .unwrap();
        assert_eq!(accept_queue_capacity(&config), 105);

        let empty: ProxyConfig = toml::from_str("").unwrap();
        assert_eq!(accept_queue_capacity(&empty), 1);
    }
}
