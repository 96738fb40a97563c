//! Shared utilities for integration tests.

use std::io::Write;
use std::net::{SocketAddr, TcpListener as StdListener};
use std::sync::Arc;
use std::time::Duration;

use tempfile::NamedTempFile;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use tcp_frontend::config::{build_proxies, load_config, ProxyConfig};
use tcp_frontend::lifecycle::startup::{attach_listeners, bind_protocols, enable_listeners, socket_limits, StartupError};
use tcp_frontend::lifecycle::{RetryPolicy, Shutdown};
use tcp_frontend::net::connection::ConnectionTracker;
use tcp_frontend::net::event_loop::{accept_queue_capacity, Acceptor};
use tcp_frontend::net::fd::{FdTable, ReadyHandler};
use tcp_frontend::net::listener::BindEnv;
use tcp_frontend::net::protocol::{ProtocolKind, ProtocolRegistry};
use tcp_frontend::net::socket::SystemSockets;
use tcp_frontend::session::run_sessions;

/// An unused loopback address.
pub fn free_addr() -> SocketAddr {
    let listener = StdListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

/// Write `text` to a temporary TOML file.
pub fn write_config(text: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(text.as_bytes()).unwrap();
    file
}

/// Start a backend that echoes everything it reads.
pub async fn start_echo_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    tokio::spawn(async move {
                        let mut buf = [0u8; 1024];
                        loop {
                            match socket.read(&mut buf).await {
                                Ok(0) | Err(_) => break,
                                Ok(n) => {
                                    if socket.write_all(&buf[..n]).await.is_err() {
                                        break;
                                    }
                                }
                            }
                        }
                    });
                }
                Err(_) => break,
            }
        }
    });
    addr
}

/// A frontend running in-process, wired the way the binary wires it.
pub struct Frontend {
    pub config: ProxyConfig,
    pub registry: ProtocolRegistry,
    pub fds: FdTable,
    pub shutdown: Shutdown,
    pub tracker: ConnectionTracker,
    tasks: Vec<JoinHandle<()>>,
}

impl Frontend {
    pub async fn start(text: &str) -> Result<Self, StartupError> {
        let file = write_config(text);
        let config = load_config(file.path()).unwrap();

        let (tx, rx) = mpsc::channel(accept_queue_capacity(&config));
        let mut registry = ProtocolRegistry::with_tcp();
        let loaded = build_proxies(&config, &mut registry, |frontend| -> Arc<dyn ReadyHandler> {
            Arc::new(Acceptor::new(frontend, tx.clone()))
        })
        .unwrap();

        attach_listeners(&mut registry, &loaded.proxies);
        let limits = socket_limits(&config.global)?;
        let mut fds = FdTable::new();
        {
            let mut env = BindEnv {
                sockets: &SystemSockets,
                limits: &limits,
                fds: &mut fds,
            };
            bind_protocols(&mut registry, &mut env, RetryPolicy::from(&config.global)).await?;
        }

        let shutdown = Shutdown::new();
        let mut tasks = enable_listeners(&mut registry, &fds, shutdown.sender())?;
        let tracker = ConnectionTracker::new();
        tasks.push(tokio::spawn(run_sessions(
            rx,
            Arc::new(loaded.proxies),
            tracker.clone(),
            shutdown.subscribe(),
        )));

        Ok(Self {
            config,
            registry,
            fds,
            shutdown,
            tracker,
            tasks,
        })
    }

    /// Stop, drain and unbind. Returns how many sockets were closed.
    pub async fn stop(mut self) -> usize {
        let tasks = std::mem::take(&mut self.tasks);
        self.shutdown
            .graceful(tasks, &self.tracker, Duration::from_millis(200))
            .await;
        let mut closed = 0;
        for kind in [ProtocolKind::TcpV4, ProtocolKind::TcpV6] {
            closed += self.registry.unbind_all(kind, &mut self.fds);
        }
        closed
    }
}
