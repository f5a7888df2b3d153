// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Upstream forwarding with connect and send retries.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Connect attempts per upstream.
pub const CONNECT_TRIES: u32 = 5;
/// Seconds between connect attempts.
pub const CONNECT_INTERVAL: Duration = Duration::from_secs(12);
/// Send attempts per established upstream, each on a fresh socket.
pub const SEND_TRIES: u32 = 4;

async fn connect(server: &str) -> Option<TcpStream> {
    for attempt in 1..=CONNECT_TRIES {
        match TcpStream::connect(server).await {
            Ok(stream) => return Some(stream),
            Err(e) => {
                debug!(server, attempt, %e, "connect failed");
                if attempt < CONNECT_TRIES {
                    tokio::time::sleep(CONNECT_INTERVAL).await;
                }
            }
        }
    }
    warn!(server, tries = CONNECT_TRIES, "upstream unreachable");
    None
}

/// Send one message to a single upstream; no reply expected.
/// Returns true on success.
pub async fn send_oneway(server: &str, msg: &[u8]) -> bool {
    for attempt in 1..=SEND_TRIES {
        let Some(mut stream) = connect(server).await else {
            return false;
        };
        match write_and_close(&mut stream, msg).await {
            Ok(()) => return true,
            Err(e) => {
                debug!(server, attempt, %e, "send failed, retrying on a fresh socket");
            }
        }
    }
    warn!(server, tries = SEND_TRIES, "giving up on message");
    false
}

/// Send one message to every upstream in order.
pub async fn broadcast_oneway(servers: &[String], msg: &[u8]) -> usize {
    let mut delivered = 0;
    for server in servers {
        if send_oneway(server, msg).await {
            delivered += 1;
        }
    }
    delivered
}

/// Request-response exchange with one upstream: send, half-close, read the
/// reply to EOF.
pub async fn request(server: &str, msg: &[u8]) -> Option<Vec<u8>> {
    for attempt in 1..=SEND_TRIES {
        let Some(mut stream) = connect(server).await else {
            return None;
        };
        let result: std::io::Result<Vec<u8>> = async {
            stream.write_all(msg).await?;
            stream.flush().await?;
            // Half-close our sending side so the daemon sees the message end.
            stream.shutdown().await?;
            let mut reply = Vec::new();
            stream.read_to_end(&mut reply).await?;
            Ok(reply)
        }
        .await;
        match result {
            Ok(reply) => return Some(reply),
            Err(e) => debug!(server, attempt, %e, "request failed"),
        }
    }
    None
}

async fn write_and_close(stream: &mut TcpStream, msg: &[u8]) -> std::io::Result<()> {
    stream.write_all(msg).await?;
    stream.flush().await?;
    stream.shutdown().await
}

#[cfg(test)]
#[path = "upstream_tests.rs"]
mod tests;
