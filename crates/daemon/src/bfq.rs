// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Back-feed queue: a local datagram socket trusted producers write whole
//! messages to, bypassing TCP framing and the sender allow-lists.
//!
//! One datagram is one complete daemon command with the verb at the start.
//! The reader drains a bounded chunk per pass so a flood of local messages
//! cannot starve TCP work, and re-binds once on a receive error.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use tokio::net::UnixDatagram;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::{CoreCmd, IngestMessage};

/// Sender recorded for back-feed messages.
const BFQ_SENDER: &str = "127.0.0.1";

pub struct BackfeedQueue {
    path: PathBuf,
    sock: UnixDatagram,
}

impl BackfeedQueue {
    /// Bind the queue socket, replacing any stale socket file.
    pub fn bind(path: &Path) -> std::io::Result<Self> {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        let sock = UnixDatagram::bind(path)?;
        info!(path = %path.display(), "back-feed queue ready");
        Ok(Self { path: path.to_owned(), sock })
    }

    /// Drain datagrams into the core until shutdown.
    pub async fn run(
        mut self,
        core_tx: mpsc::Sender<CoreCmd>,
        max_size: usize,
        chunk: usize,
        shutdown: CancellationToken,
    ) {
        // One spare byte detects oversize datagrams.
        let mut buf = vec![0u8; max_size + 1];
        let mut rebound = false;

        loop {
            let n = tokio::select! {
                _ = shutdown.cancelled() => break,
                res = self.sock.recv(&mut buf) => match res {
                    Ok(n) => n,
                    Err(e) => {
                        error!(%e, "back-feed receive failed");
                        if rebound {
                            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                            continue;
                        }
                        // One re-init attempt, then keep limping.
                        rebound = true;
                        match Self::bind(&self.path) {
                            Ok(fresh) => {
                                self.sock = fresh.sock;
                                continue;
                            }
                            Err(e) => {
                                error!(%e, "back-feed re-bind failed");
                                continue;
                            }
                        }
                    }
                },
            };
            rebound = false;

            if n > max_size {
                warn!(size = n, limit = max_size, "oversize back-feed message dropped");
                continue;
            }
            if n == 0 {
                continue;
            }
            let msg = IngestMessage {
                buf: Bytes::copy_from_slice(&buf[..n]),
                sender: BFQ_SENDER.to_owned(),
                sender_cn: None,
                via_bfq: true,
            };
            if core_tx.send(CoreCmd::Message { msg, reply: None }).await.is_err() {
                break;
            }

            // Bounded drain: after `chunk` messages in a row, yield so the
            // core can interleave TCP work.
            let mut drained = 1;
            while drained < chunk {
                match self.sock.try_recv(&mut buf) {
                    Ok(n) if n > max_size => {
                        warn!(size = n, limit = max_size, "oversize back-feed message dropped");
                    }
                    Ok(0) => {}
                    Ok(n) => {
                        let msg = IngestMessage {
                            buf: Bytes::copy_from_slice(&buf[..n]),
                            sender: BFQ_SENDER.to_owned(),
                            sender_cn: None,
                            via_bfq: true,
                        };
                        if core_tx.send(CoreCmd::Message { msg, reply: None }).await.is_err() {
                            return;
                        }
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        debug!(%e, "back-feed drain stopped");
                        break;
                    }
                }
                drained += 1;
            }
            tokio::task::yield_now().await;
        }

        let _ = std::fs::remove_file(&self.path);
    }
}

/// Producer side: write one message to a back-feed socket.
pub fn feed(path: &Path, msg: &[u8]) -> std::io::Result<()> {
    let sock = std::os::unix::net::UnixDatagram::unbound()?;
    sock.send_to(msg, path)?;
    Ok(())
}

#[cfg(test)]
#[path = "bfq_tests.rs"]
mod tests;
