// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Vigilproxy: fan-in proxy for the vigil monitor daemon.
//!
//! Aggregates many small inbound client messages into fewer larger ones,
//! forwards to one or more upstream daemons with connect/send retries, and
//! can short-circuit one-way traffic into a local daemon's back-feed queue.

pub mod combine;
pub mod config;
pub mod upstream;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::combine::Combiner;
use crate::config::ProxyConfig;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Where one inbound message goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Answered by the proxy itself.
    Local,
    /// Status message: goes through the combining stage.
    Combine,
    /// Client data: annotated, sent to all upstreams, reply from the last.
    ClientAll,
    /// Request-response verb: last upstream only, reply relayed verbatim.
    RequestLast,
    /// Everything else: one-way to every upstream.
    OneWayAll,
}

const REQUEST_VERBS: &[&str] = &[
    "query", "xymond", "hostinfo", "config", "ghostlist", "ping", "clientlog", "clientconfig",
    "schedule", "senderstats", "histsync", "download",
];

pub fn classify(msg: &[u8]) -> Route {
    if msg.starts_with(b"proxyping") {
        return Route::Local;
    }
    if msg.starts_with(b"status") {
        return Route::Combine;
    }
    if msg.starts_with(b"client ") || msg.starts_with(b"client/") {
        return Route::ClientAll;
    }
    for verb in REQUEST_VERBS {
        if msg.starts_with(verb.as_bytes()) {
            return Route::RequestLast;
        }
    }
    Route::OneWayAll
}

#[derive(Debug, Default)]
pub struct ProxyStats {
    pub received: AtomicU64,
    pub status_msgs: AtomicU64,
    pub combined_msgs: AtomicU64,
    pub combo_flushes: AtomicU64,
    pub forwarded: AtomicU64,
    pub dropped: AtomicU64,
    pub proxypings: AtomicU64,
}

pub struct ProxyState {
    pub config: ProxyConfig,
    pub stats: ProxyStats,
    combiner: Mutex<Combiner>,
    flush_wanted: Notify,
}

impl ProxyState {
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            config,
            stats: ProxyStats::default(),
            combiner: Mutex::new(Combiner::new()),
            flush_wanted: Notify::new(),
        }
    }
}

/// Run the proxy until shutdown.
pub async fn run(config: ProxyConfig) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let listener = TcpListener::bind(&config.listen).await?;
    info!(addr = %config.listen, upstreams = config.servers.len(), "vigilproxy listening");

    let state = Arc::new(ProxyState::new(config));
    tokio::spawn(flusher(Arc::clone(&state), shutdown.clone()));
    if state.config.report.is_some() {
        tokio::spawn(reporter(Arc::clone(&state), shutdown.clone()));
    }

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(x) => x,
                    Err(e) => {
                        warn!(%e, "accept failed");
                        continue;
                    }
                };
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    if let Err(e) = handle_conn(stream, peer, state).await {
                        debug!(%peer, %e, "connection ended with error");
                    }
                });
            }
        }
    }

    // Flush whatever is still combining before we go.
    flush_and_forward(&state).await;
    Ok(())
}

async fn handle_conn(
    mut stream: TcpStream,
    peer: std::net::SocketAddr,
    state: Arc<ProxyState>,
) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + state.config.conn_deadline();

    let mut buf = Vec::with_capacity(8 * 1024);
    let mut chunk = [0u8; 16 * 1024];
    loop {
        let n = match tokio::time::timeout_at(deadline, stream.read(&mut chunk)).await {
            Err(_) => {
                debug!(%peer, "read deadline passed");
                state.stats.dropped.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
            Ok(res) => res?,
        };
        if n == 0 {
            break;
        }
        if buf.len() + n > state.config.max_msg_size {
            warn!(%peer, limit = state.config.max_msg_size, "oversize message dropped");
            state.stats.dropped.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    if buf.is_empty() {
        return Ok(());
    }
    state.stats.received.fetch_add(1, Ordering::Relaxed);

    match classify(&buf) {
        Route::Local => {
            state.stats.proxypings.fetch_add(1, Ordering::Relaxed);
            let reply = format!("vigilproxy {VERSION}\n");
            let _ = tokio::time::timeout_at(deadline, stream.write_all(reply.as_bytes())).await;
            let _ = stream.shutdown().await;
        }
        Route::Combine => {
            state.stats.status_msgs.fetch_add(1, Ordering::Relaxed);
            drop(stream); // one-way: the client side is done
            let mut combiner = state.combiner.lock().await;
            if combiner.wants_flush(buf.len()) {
                let flushed = combiner.flush();
                drop(combiner);
                if let Some((msg, count)) = flushed {
                    forward_combined(&state, msg, count).await;
                }
                combiner = state.combiner.lock().await;
            }
            if combiner.push(&buf) {
                state.flush_wanted.notify_one();
            }
        }
        Route::ClientAll => {
            append_proxy_section(&mut buf, &peer);
            let servers = state.config.servers.clone();
            let (head, last) = servers.split_at(servers.len().saturating_sub(1));
            for server in head {
                upstream::send_oneway(server, &buf).await;
            }
            let reply = match last.first() {
                Some(server) => upstream::request(server, &buf).await.unwrap_or_default(),
                None => Vec::new(),
            };
            state.stats.forwarded.fetch_add(1, Ordering::Relaxed);
            if !reply.is_empty() {
                let _ = tokio::time::timeout_at(deadline, stream.write_all(&reply)).await;
            }
            let _ = stream.shutdown().await;
        }
        Route::RequestLast => {
            let server = match state.config.servers.last() {
                Some(s) => s.clone(),
                None => return Ok(()),
            };
            match upstream::request(&server, &buf).await {
                Some(reply) => {
                    state.stats.forwarded.fetch_add(1, Ordering::Relaxed);
                    let _ = tokio::time::timeout_at(deadline, stream.write_all(&reply)).await;
                }
                None => {
                    state.stats.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
            let _ = stream.shutdown().await;
        }
        Route::OneWayAll => {
            drop(stream);
            forward_oneway(&state, buf).await;
        }
    }
    Ok(())
}

/// Client messages get the proxy's view of the sender appended, the way
/// downstream parsers expect.
fn append_proxy_section(buf: &mut Vec<u8>, peer: &std::net::SocketAddr) {
    if buf.starts_with(b"clientlog") || buf.starts_with(b"clientconfig") {
        return;
    }
    let section = format!("\n[proxy]\nClientIP:{}\n", peer.ip());
    buf.extend_from_slice(section.as_bytes());
}

/// One-way delivery: the back-feed queue when available, TCP otherwise.
async fn forward_oneway(state: &ProxyState, msg: Vec<u8>) {
    if let Some(ref path) = state.config.bfq {
        match feed_bfq(path, &msg) {
            Ok(()) => {
                state.stats.forwarded.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Err(e) => warn!(%e, "back-feed failed, falling back to TCP"),
        }
    }
    let delivered = upstream::broadcast_oneway(&state.config.servers, &msg).await;
    if delivered > 0 {
        state.stats.forwarded.fetch_add(1, Ordering::Relaxed);
    } else {
        state.stats.dropped.fetch_add(1, Ordering::Relaxed);
    }
}

async fn forward_combined(state: &ProxyState, msg: Vec<u8>, count: usize) {
    state.stats.combined_msgs.fetch_add(count as u64, Ordering::Relaxed);
    state.stats.combo_flushes.fetch_add(1, Ordering::Relaxed);
    forward_oneway(state, msg).await;
}

async fn flush_and_forward(state: &ProxyState) {
    let flushed = state.combiner.lock().await.flush();
    if let Some((msg, count)) = flushed {
        forward_combined(state, msg, count).await;
    }
}

/// Waits for a batch to start, then gives it the configured delay before
/// flushing. Size-triggered flushes happen inline on the pushing side.
async fn flusher(state: Arc<ProxyState>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = state.flush_wanted.notified() => {}
        }
        tokio::time::sleep(state.config.combo_delay()).await;
        flush_and_forward(&state).await;
    }
}

/// Periodic statistics report, sent upstream as an ordinary status.
async fn reporter(state: Arc<ProxyState>, shutdown: CancellationToken) {
    let Some(address) = state.config.report.clone() else {
        return;
    };
    let mut tick = tokio::time::interval(state.config.report_every());
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    tick.tick().await; // the first tick is immediate; skip it
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tick.tick() => {}
        }
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let body = format!(
            "status {address} green {now} vigilproxy {VERSION}\n\n\
             Messages received      : {}\n\
             Status messages        : {}\n\
             Messages combined      : {}\n\
             Combo flushes          : {}\n\
             Messages forwarded     : {}\n\
             Messages dropped       : {}\n\
             Proxypings answered    : {}\n",
            state.stats.received.load(Ordering::Relaxed),
            state.stats.status_msgs.load(Ordering::Relaxed),
            state.stats.combined_msgs.load(Ordering::Relaxed),
            state.stats.combo_flushes.load(Ordering::Relaxed),
            state.stats.forwarded.load(Ordering::Relaxed),
            state.stats.dropped.load(Ordering::Relaxed),
            state.stats.proxypings.load(Ordering::Relaxed),
        );
        forward_oneway(&state, body.into_bytes()).await;
    }
}

fn feed_bfq(path: &std::path::Path, msg: &[u8]) -> std::io::Result<()> {
    let sock = std::os::unix::net::UnixDatagram::unbound()?;
    sock.send_to(msg, path)?;
    Ok(())
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};
    tokio::spawn(async move {
        let (Ok(mut term), Ok(mut int)) =
            (signal(SignalKind::terminate()), signal(SignalKind::interrupt()))
        else {
            error!("cannot install signal handlers");
            return;
        };
        tokio::select! {
            _ = term.recv() => {}
            _ = int.recv() => {}
        }
        info!("shutting down");
        shutdown.cancel();
    });
}

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
