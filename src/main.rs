//! TCP frontend (v1)
//!
//! Binds the configured listeners, optionally on foreign addresses, and runs
//! `tcp-request content` rules on every accepted connection before relaying
//! it.
//!
//! # Architecture Overview
//!
//! ```text
//!                 ┌───────────────────────────────────────────────────────┐
//!                 │                     TCP FRONTEND                      │
//!                 │                                                       │
//!   config.toml ──┼─▶ config ──▶ proxy records ──▶ protocol registry      │
//!                 │                                   │ bind_all          │
//!                 │                                   ▼                   │
//!                 │                     listener ──▶ foreign binder       │
//!                 │                         │                             │
//!   Client ───────┼─▶ readiness task ──▶ accept ──▶ session ──▶ rules ────┼──▶ forward_to
//!                 │                                                       │
//!                 │  lifecycle: startup / signals / shutdown              │
//!                 │  observability: tracing + prometheus                  │
//!                 └───────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde::Serialize;
use tokio::sync::mpsc;

use tcp_frontend::config::{build_proxies, load_config, LoadedProxies};
use tcp_frontend::lifecycle::startup::{attach_listeners, bind_protocols, enable_listeners, socket_limits};
use tcp_frontend::lifecycle::{signals, RetryPolicy, Shutdown};
use tcp_frontend::net::connection::ConnectionTracker;
use tcp_frontend::net::event_loop::{accept_queue_capacity, Acceptor};
use tcp_frontend::net::fd::{FdTable, ReadyHandler};
use tcp_frontend::net::listener::BindEnv;
use tcp_frontend::net::protocol::{ProtocolKind, ProtocolRegistry};
use tcp_frontend::net::socket::SystemSockets;
use tcp_frontend::observability::{logging, metrics};
use tcp_frontend::session::run_sessions;

#[derive(Debug, Parser)]
#[command(name = "tcp-frontend", version, about = "TCP frontend with transparent binding and content rules")]
struct Cli {
    /// Path to the TOML configuration.
    #[arg(short, long, default_value = "tcp-frontend.toml")]
    config: PathBuf,

    /// Validate the configuration and exit.
    #[arg(long)]
    check: bool,

    /// Print the `--check` summary as JSON.
    #[arg(long, requires = "check")]
    json: bool,
}

#[derive(Debug, Serialize)]
struct ProxySummary {
    name: String,
    mode: &'static str,
    listeners: Vec<String>,
    rules: usize,
    inspect_delay_ms: Option<u128>,
    forward_to: Option<String>,
}

#[derive(Debug, Serialize)]
struct CheckSummary {
    proxies: Vec<ProxySummary>,
    warnings: Vec<String>,
}

fn summarize(loaded: &LoadedProxies, registry: &ProtocolRegistry) -> CheckSummary {
    let proxies = loaded
        .proxies
        .iter()
        .map(|px| ProxySummary {
            name: px.name.clone(),
            mode: px.mode.type_str(),
            listeners: px
                .listeners
                .iter()
                .filter_map(|id| registry.listener(*id))
                .map(|l| l.addr().to_string())
                .collect(),
            rules: px.tcp_req.rules.len(),
            inspect_delay_ms: px.tcp_req.inspect_delay.map(|d| d.as_millis()),
            forward_to: px.forward_to.map(|a| a.to_string()),
        })
        .collect();
    CheckSummary {
        proxies,
        warnings: loaded.warnings.clone(),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = load_config(&cli.config)?;
    logging::init_logging(&config.observability);

    tracing::info!("tcp-frontend v{} starting", env!("CARGO_PKG_VERSION"));

    let (tx, rx) = mpsc::channel(accept_queue_capacity(&config));
    let mut registry = ProtocolRegistry::with_tcp();
    let loaded = build_proxies(&config, &mut registry, |frontend| -> Arc<dyn ReadyHandler> {
        Arc::new(Acceptor::new(frontend, tx.clone()))
    })?;
    drop(tx);

    tracing::info!(
        proxies = loaded.proxies.len(),
        warnings = loaded.warnings.len(),
        "Configuration loaded"
    );

    if cli.check {
        let summary = summarize(&loaded, &registry);
        if cli.json {
            println!("{}", serde_json::to_string_pretty(&summary)?);
        } else {
            for px in &summary.proxies {
                println!(
                    "{} '{}': {} listener(s), {} rule(s)",
                    px.mode,
                    px.name,
                    px.listeners.len(),
                    px.rules
                );
            }
            for warning in &summary.warnings {
                println!("warning: {}", warning);
            }
            println!("configuration is valid");
        }
        return Ok(());
    }

    if config.observability.metrics_enabled {
        if let Ok(addr) = config.observability.metrics_address.parse() {
            metrics::init_metrics(addr);
        } else {
            tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            );
        }
    }

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
    let proxies = Arc::new(loaded.proxies);
    tasks.push(tokio::spawn(run_sessions(
        rx,
        proxies,
        tracker.clone(),
        shutdown.subscribe(),
    )));

    signals::wait_for_shutdown().await?;

    let drain = Duration::from_millis(config.global.drain_timeout_ms);
    shutdown.graceful(tasks, &tracker, drain).await;

    for kind in [ProtocolKind::TcpV4, ProtocolKind::TcpV6] {
        registry.unbind_all(kind, &mut fds);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
