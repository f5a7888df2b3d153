// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Cross-crate scenario tests for the vigil daemon and proxy.
//!
//! The tests live in `tests/`; this crate only exports the shared harness.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use vigild::config::DaemonConfig;
use vigild::core::{core_loop, CoreCmd, Daemon};
use vigild::listener::{serve_on, ListenerCtx};

/// A daemon wired up like production: core task plus TCP listener on an
/// ephemeral port.
pub struct TestDaemon {
    pub addr: String,
    pub core_tx: mpsc::Sender<CoreCmd>,
    pub bus: Arc<vigild::bus::ChannelBus>,
    pub shutdown: CancellationToken,
}

impl TestDaemon {
    pub async fn spawn(mut args: Vec<&'static str>) -> anyhow::Result<TestDaemon> {
        let mut argv = vec!["vigild"];
        argv.append(&mut args);
        let config = <DaemonConfig as clap::Parser>::parse_from(argv);

        let daemon = Daemon::new(config.clone())?;
        let bus = Arc::clone(&daemon.bus);
        let counters = Arc::clone(&daemon.conn_counters);
        let shutdown = CancellationToken::new();
        let (core_tx, core_rx) = mpsc::channel(256);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?.to_string();
        let ctx = Arc::new(ListenerCtx {
            core_tx: core_tx.clone(),
            counters,
            tls: None,
            tls_only: false,
            max_msg_size: config.max_msg_size,
            deadline: config.conn_deadline(),
        });
        tokio::spawn(serve_on(listener, ctx, shutdown.clone()));
        tokio::spawn(core_loop(daemon, core_rx, shutdown.clone()));

        Ok(TestDaemon { addr, core_tx, bus, shutdown })
    }

    /// One protocol exchange over TCP, the way a real client does it.
    pub async fn talk(&self, msg: &str) -> anyhow::Result<String> {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let mut conn = tokio::net::TcpStream::connect(&self.addr).await?;
        conn.write_all(msg.as_bytes()).await?;
        conn.shutdown().await?;
        let mut reply = Vec::new();
        conn.read_to_end(&mut reply).await?;
        Ok(String::from_utf8_lossy(&reply).into_owned())
    }

    /// Fire-and-forget send.
    pub async fn send(&self, msg: &str) -> anyhow::Result<()> {
        self.talk(msg).await.map(|_| ())
    }
}

impl Drop for TestDaemon {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
