// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Vigild: the vigil monitor daemon.
//!
//! Accepts short textual status reports from monitoring agents, keeps
//! per-(host, test) state in memory, drives alert lifecycles, and fans
//! events out to workers over named channels.

pub mod alert;
pub mod bfq;
pub mod board;
pub mod bus;
pub mod checkpoint;
pub mod codec;
pub mod color;
pub mod config;
pub mod core;
pub mod hosts;
pub mod listener;
pub mod registry;
pub mod stats;
pub mod status;

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::DaemonConfig;

/// Current epoch seconds.
pub fn epoch_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Run the daemon until shutdown.
pub async fn run(config: DaemonConfig) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();
    let daemon = core::Daemon::new(config.clone())?;
    let (core_tx, core_rx) = mpsc::channel(1024);

    let tls = listener::build_tls(&config)?;

    // Plaintext listener, with STARTTLS available when a certificate is set.
    let plain = TcpListener::bind(&config.listen).await?;
    info!(addr = %config.listen, "listening");
    let ctx = Arc::new(listener::ListenerCtx {
        core_tx: core_tx.clone(),
        counters: Arc::clone(&daemon.conn_counters),
        tls: tls.clone(),
        tls_only: false,
        max_msg_size: config.max_msg_size,
        deadline: config.conn_deadline(),
    });
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = listener::serve_on(plain, ctx, shutdown).await {
                error!(%e, "plaintext listener failed");
            }
        });
    }

    if let Some(ref addr) = config.tls_listen {
        let Some(ref tls) = tls else {
            anyhow::bail!("--tls-listen requires --tls-certificate and --tls-key");
        };
        let sock = TcpListener::bind(addr).await?;
        info!(addr, "listening (TLS)");
        let ctx = Arc::new(listener::ListenerCtx {
            core_tx: core_tx.clone(),
            counters: Arc::clone(&daemon.conn_counters),
            tls: Some(Arc::clone(tls)),
            tls_only: true,
            max_msg_size: config.max_msg_size,
            deadline: config.conn_deadline(),
        });
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = listener::serve_on(sock, ctx, shutdown).await {
                error!(%e, "TLS listener failed");
            }
        });
    }

    if let Some(path) = config.bfq_socket() {
        let queue = bfq::BackfeedQueue::bind(&path)?;
        tokio::spawn(queue.run(
            core_tx.clone(),
            config.max_msg_size,
            config.bfq_chunk,
            shutdown.clone(),
        ));
    }

    // The alert manager consumes the page channel like any other worker.
    let rules = match config.alert_rules {
        Some(ref path) => alert::rules::AlertRules::load(path)?,
        None => alert::rules::AlertRules::default(),
    };
    let page_rx = daemon.bus.subscribe(bus::ChannelId::Page);
    let evaluator = alert::evaluator::AlertEvaluator::new(rules, daemon.policy);
    tokio::spawn(alert::evaluator::run(
        evaluator,
        page_rx,
        core_tx.clone(),
        config.alert_script.clone(),
        config.alert_checkpoint.clone(),
        shutdown.clone(),
    ));

    spawn_signal_handler(core_tx, shutdown.clone());

    core::core_loop(daemon, core_rx, shutdown).await;
    Ok(())
}

/// SIGTERM/SIGINT drain, SIGHUP reload + rotate, SIGUSR1 forced checkpoint.
fn spawn_signal_handler(core_tx: mpsc::Sender<core::CoreCmd>, shutdown: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let (Ok(mut term), Ok(mut int), Ok(mut hup), Ok(mut usr1)) = (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
            signal(SignalKind::hangup()),
            signal(SignalKind::user_defined1()),
        ) else {
            error!("cannot install signal handlers");
            return;
        };
        loop {
            tokio::select! {
                _ = term.recv() => {
                    info!("SIGTERM: draining");
                    shutdown.cancel();
                    return;
                }
                _ = int.recv() => {
                    info!("SIGINT: draining");
                    shutdown.cancel();
                    return;
                }
                _ = hup.recv() => {
                    info!("SIGHUP: reload and rotate");
                    let _ = core_tx.send(core::CoreCmd::Reload).await;
                    let _ = core_tx.send(core::CoreCmd::Rotate).await;
                }
                _ = usr1.recv() => {
                    info!("SIGUSR1: forced checkpoint");
                    let _ = core_tx.send(core::CoreCmd::Checkpoint).await;
                }
            }
        }
    });
}
