//! Per-connection content inspection and hand-off.
//!
//! # Responsibilities
//! - Buffer request bytes while the frontend's rules cannot decide yet
//! - Apply the verdict: close rejected connections, relay accepted ones
//! - Track live sessions for graceful shutdown
//!
//! # States
//! ```text
//! accepted ──(no rules)──────────────────────────────► relay
//!     │
//!     └─► inspect ──Wait──► read more (until inspect-delay or EOF) ─┐
//!            ▲                                                       │
//!            └───────────────────────────────────────────────────────┘
//!            ├─Accept──► relay (buffered bytes first)
//!            └─Reject──► close
//! ```
//!
//! # Design Decisions
//! - Without an inspect-delay the rules see whatever is there at once
//! - A full buffer closes the window early, like an expired delay

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

use crate::net::connection::{ConnectionId, ConnectionTracker};
use crate::net::event_loop::Accepted;
use crate::observability::metrics;
use crate::proxy::Proxy;
use crate::rules::{AclEvaluator, ConditionEvaluator, ConnectionFacts, TcpRuleSet, Verdict};

/// Largest request prefix kept while inspecting.
pub const MAX_INSPECT_BYTES: usize = 16 * 1024;

/// Run `rules` against `stream`, reading more while a condition may still
/// change and the window is open. Bytes read are left in `buf`.
pub async fn inspect<S, E>(
    stream: &mut S,
    rules: &TcpRuleSet,
    inspect_delay: Option<Duration>,
    evaluator: &E,
    buf: &mut Vec<u8>,
) -> io::Result<Verdict>
where
    S: AsyncRead + Unpin,
    E: ConditionEvaluator + ?Sized,
{
    if rules.is_empty() {
        return Ok(Verdict::Accept);
    }

    let deadline = inspect_delay.map(|d| Instant::now() + d);
    let mut closed = false;
    let mut chunk = [0u8; 4096];

    loop {
        let window_open = match deadline {
            Some(deadline) => !closed && buf.len() < MAX_INSPECT_BYTES && Instant::now() < deadline,
            None => false,
        };
        let facts = ConnectionFacts {
            request_len: Some(buf.len()),
        };
        let verdict = rules.evaluate(evaluator, &facts, window_open);
        if verdict != Verdict::Wait {
            return Ok(verdict);
        }

        let Some(deadline) = deadline else {
            return Ok(verdict);
        };
        let room = (MAX_INSPECT_BYTES - buf.len()).min(chunk.len());
        match tokio::time::timeout_at(deadline, stream.read(&mut chunk[..room])).await {
            Ok(Ok(0)) => closed = true,
            Ok(Ok(n)) => buf.extend_from_slice(&chunk[..n]),
            Ok(Err(e)) => return Err(e),
            // deadline passed: next round evaluates with the window closed
            Err(_) => {}
        }
    }
}

/// Write the inspected prefix to `upstream`, then relay both ways.
pub async fn relay<C, U>(client: &mut C, upstream: &mut U, prefix: &[u8]) -> io::Result<(u64, u64)>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    if !prefix.is_empty() {
        upstream.write_all(prefix).await?;
    }
    let (up, down) = tokio::io::copy_bidirectional(client, upstream).await?;
    Ok((up + prefix.len() as u64, down))
}

/// Serve one accepted connection to completion.
pub async fn handle(accepted: Accepted, proxy: &Proxy, id: ConnectionId) -> io::Result<()> {
    let mut client = TcpStream::from_std(accepted.stream)?;
    let mut buf = Vec::new();

    if proxy.inspects() {
        let verdict = inspect(
            &mut client,
            &proxy.tcp_req.rules,
            proxy.tcp_req.inspect_delay,
            &AclEvaluator,
            &mut buf,
        )
        .await?;
        metrics::record_tcp_verdict(&proxy.name, verdict);
        tracing::debug!(
            connection_id = %id,
            frontend = %proxy.name,
            verdict = verdict.as_str(),
            inspected = buf.len(),
            "content rules evaluated"
        );
        if verdict == Verdict::Reject {
            return Ok(());
        }
    }

    let Some(target) = proxy.forward_to else {
        tracing::debug!(connection_id = %id, frontend = %proxy.name, "no forward target, closing");
        return Ok(());
    };

    let mut upstream = TcpStream::connect(target).await?;
    let (up, down) = relay(&mut client, &mut upstream, &buf).await?;
    tracing::debug!(connection_id = %id, %target, bytes_up = up, bytes_down = down, "session finished");
    Ok(())
}

/// Receive accepted connections and serve each in its own task until
/// shutdown.
pub async fn run_sessions(
    mut rx: mpsc::Receiver<Accepted>,
    proxies: Arc<Vec<Proxy>>,
    tracker: ConnectionTracker,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.recv() => break,
            next = rx.recv() => match next {
                Some(accepted) => accepted,
                None => break,
            },
        };

        let proxy_index = accepted.frontend.0;
        if proxy_index >= proxies.len() {
            tracing::warn!(frontend = %accepted.frontend, "connection for unknown frontend dropped");
            continue;
        }

        let guard = tracker.track();
        metrics::record_active_sessions(tracker.active());
        let proxies = Arc::clone(&proxies);
        let tracker = tracker.clone();
        tokio::spawn(async move {
            let proxy = &proxies[proxy_index];
            let id = guard.id();
            tracing::debug!(connection_id = %id, peer = ?accepted.peer, frontend = %proxy.name, "connection accepted");
            if let Err(e) = handle(accepted, proxy, id).await {
                tracing::debug!(connection_id = %id, error = %e, "session ended with error");
            }
            drop(guard);
            metrics::record_active_sessions(tracker.active());
        });
    }
    tracing::debug!("session runner stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{Acl, AclSet, Condition, Polarity, TcpAction, TcpRule};

    fn rules(action: TcpAction, words: &[&str]) -> TcpRuleSet {
        let mut acls = AclSet::new();
        acls.add(Acl::parse(&["enough", "req_len", "ge", "4"]).unwrap());
        let mut set = TcpRuleSet::new();
        set.push(TcpRule {
            action,
            cond: Some(Condition::parse(Polarity::If, words, &acls).unwrap()),
        });
        set.push(TcpRule {
            action: TcpAction::Reject,
            cond: None,
        });
        set
    }

    #[tokio::test]
    async fn no_rules_accepts_without_reading() {
        let (mut client, _peer) = tokio::io::duplex(64);
        let mut buf = Vec::new();
        let verdict = inspect(&mut client, &TcpRuleSet::new(), None, &AclEvaluator, &mut buf)
            .await
            .unwrap();
        assert_eq!(verdict, Verdict::Accept);
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn waits_for_enough_bytes() {
        let (mut server, mut client) = tokio::io::duplex(64);
        let writer = tokio::spawn(async move {
            client.write_all(b"ab").await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            client.write_all(b"cd").await.unwrap();
            client
        });

        let mut buf = Vec::new();
        let verdict = inspect(
            &mut server,
            &rules(TcpAction::Accept, &["enough"]),
            Some(Duration::from_secs(5)),
            &AclEvaluator,
            &mut buf,
        )
        .await
        .unwrap();
        assert_eq!(verdict, Verdict::Accept);
        assert_eq!(buf, b"abcd");
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn expired_window_fails_pending_rule() {
        let (mut server, _client) = tokio::io::duplex(64);
        let mut buf = Vec::new();
        let verdict = inspect(
            &mut server,
            &rules(TcpAction::Accept, &["enough"]),
            Some(Duration::from_millis(30)),
            &AclEvaluator,
            &mut buf,
        )
        .await
        .unwrap();
        assert_eq!(verdict, Verdict::Reject);
    }

    #[tokio::test]
    async fn peer_close_ends_the_window() {
        let (mut server, mut client) = tokio::io::duplex(64);
        client.write_all(b"x").await.unwrap();
        drop(client);
        let mut buf = Vec::new();
        let verdict = inspect(
            &mut server,
            &rules(TcpAction::Accept, &["enough"]),
            Some(Duration::from_secs(30)),
            &AclEvaluator,
            &mut buf,
        )
        .await
        .unwrap();
        assert_eq!(verdict, Verdict::Reject);
        assert_eq!(buf, b"x");
    }

    #[tokio::test]
    async fn without_delay_rules_see_empty_request() {
        let (mut server, _client) = tokio::io::duplex(64);
        let mut buf = Vec::new();
        let verdict = inspect(
            &mut server,
            &rules(TcpAction::Accept, &["enough"]),
            None,
            &AclEvaluator,
            &mut buf,
        )
        .await
        .unwrap();
        assert_eq!(verdict, Verdict::Reject);
    }

    #[tokio::test]
    async fn relay_replays_prefix() {
        let (mut client, mut client_peer) = tokio::io::duplex(64);
        let (mut upstream, mut upstream_peer) = tokio::io::duplex(64);

        let backend = tokio::spawn(async move {
            let mut got = [0u8; 5];
            upstream_peer.read_exact(&mut got).await.unwrap();
            upstream_peer.write_all(b"ok").await.unwrap();
            upstream_peer.shutdown().await.unwrap();
            got
        });
        let front = tokio::spawn(async move {
            client_peer.write_all(b"lo").await.unwrap();
            client_peer.shutdown().await.unwrap();
            let mut reply = Vec::new();
            client_peer.read_to_end(&mut reply).await.unwrap();
            reply
        });

        let (up, down) = relay(&mut client, &mut upstream, b"hel").await.unwrap();
        assert_eq!(up, 5);
        assert_eq!(down, 2);
        assert_eq!(&backend.await.unwrap(), b"hello");
        assert_eq!(front.await.unwrap(), b"ok");
    }
}
