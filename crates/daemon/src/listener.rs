// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! TCP listener and per-connection state machine.
//!
//! A connection moves through Receiving → (StarttlsWaiting) → Responding →
//! close. The listener only decides message completeness (half-close, or a
//! `size:`/`compress:` frame); the core's dispatcher unwraps the framing.
//! Oversize declarations are drained and dropped without buffering the body.

use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::Framing;
use crate::core::{CoreCmd, IngestMessage};
use crate::stats::ConnCounters;

/// Initial read buffer; grown in steps up to the message ceiling.
pub const INITIAL_BUF: usize = 128 * 1024;
pub const BUF_STEP: usize = 256 * 1024;

trait Conn: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Conn for T {}

type BoxedConn = Box<dyn Conn>;

/// TLS material shared by the TLS listener and STARTTLS upgrades.
pub struct TlsSettings {
    pub acceptor: TlsAcceptor,
}

/// Everything a connection task needs.
pub struct ListenerCtx {
    pub core_tx: mpsc::Sender<CoreCmd>,
    pub counters: Arc<ConnCounters>,
    pub tls: Option<Arc<TlsSettings>>,
    /// Start with a TLS handshake instead of waiting for `starttls`.
    pub tls_only: bool,
    pub max_msg_size: usize,
    pub deadline: std::time::Duration,
}

/// Build TLS settings from the configured certificate and key.
pub fn build_tls(config: &crate::config::DaemonConfig) -> anyhow::Result<Option<Arc<TlsSettings>>> {
    let (Some(cert_path), Some(key_path)) = (&config.tls_certificate, &config.tls_key) else {
        return Ok(None);
    };

    let certs: Vec<rustls::pki_types::CertificateDer<'static>> = {
        let pem = std::fs::read(cert_path)?;
        rustls_pemfile::certs(&mut pem.as_slice()).collect::<Result<_, _>>()?
    };
    let key = {
        let pem = std::fs::read(key_path)?;
        rustls_pemfile::private_key(&mut pem.as_slice())?
            .ok_or_else(|| anyhow::anyhow!("no private key in {}", key_path.display()))?
    };

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = rustls::ServerConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()?;

    let server_config = match &config.tls_clientrootca {
        Some(ca_path) => {
            let mut roots = rustls::RootCertStore::empty();
            let pem = std::fs::read(ca_path)?;
            for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
                roots.add(cert?)?;
            }
            let mut verifier =
                rustls::server::WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider);
            if !config.tls_requireclientcert {
                verifier = verifier.allow_unauthenticated();
            }
            builder.with_client_cert_verifier(verifier.build()?).with_single_cert(certs, key)?
        }
        None => builder.with_no_client_auth().with_single_cert(certs, key)?,
    };

    Ok(Some(Arc::new(TlsSettings { acceptor: TlsAcceptor::from(Arc::new(server_config)) })))
}

/// Accept connections until shutdown.
pub async fn serve(
    addr: String,
    ctx: Arc<ListenerCtx>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(&addr).await?;
    info!(addr, tls = ctx.tls_only, "listening");
    serve_on(listener, ctx, shutdown).await
}

/// Accept loop over an already-bound socket.
pub async fn serve_on(
    listener: TcpListener,
    ctx: Arc<ListenerCtx>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(x) => x,
                    Err(e) => {
                        warn!(%e, "accept failed");
                        continue;
                    }
                };
                let ctx = Arc::clone(&ctx);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, peer, ctx).await {
                        debug!(%peer, %e, "connection ended with error");
                    }
                });
            }
        }
    }
}

async fn handle_connection(
    tcp: TcpStream,
    peer: std::net::SocketAddr,
    ctx: Arc<ListenerCtx>,
) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + ctx.deadline;
    let sender = peer.ip().to_string();
    let mut cn: Option<String> = None;

    let mut stream: BoxedConn = if ctx.tls_only {
        let Some(ref tls) = ctx.tls else {
            anyhow::bail!("TLS listener without TLS settings");
        };
        let accept = tls.acceptor.accept(tcp);
        match tokio::time::timeout_at(deadline, accept).await {
            Err(_) => {
                ctx.counters.bump_starttls();
                return Ok(());
            }
            Ok(Err(e)) => return Err(e.into()),
            Ok(Ok(tls_stream)) => {
                cn = peer_common_name(&tls_stream);
                if let Some(ref cn) = cn {
                    debug!(%peer, cn, "client certificate accepted");
                }
                Box::new(tls_stream)
            }
        }
    } else {
        Box::new(tcp)
    };

    let mut buf = BytesMut::with_capacity(INITIAL_BUF);
    let mut framing: Option<Framing> = None;
    let mut starttls_checked = ctx.tls_only;

    // Receiving.
    loop {
        if buf.capacity() - buf.len() == 0 {
            buf.reserve(BUF_STEP);
        }
        let n = match tokio::time::timeout_at(deadline, stream.read_buf(&mut buf)).await {
            Err(_) => {
                ctx.counters.bump_receiving();
                return Ok(());
            }
            Ok(Err(e)) => return Err(e.into()),
            Ok(Ok(n)) => n,
        };
        if n == 0 {
            break;
        }

        // STARTTLS is opportunistic: only valid before any message content.
        if !starttls_checked && buf.len() >= 9 {
            starttls_checked = true;
            if buf.starts_with(b"starttls\n") {
                match ctx.tls {
                    Some(ref tls) => {
                        stream.write_all(b"OK TLS\n").await?;
                        stream.flush().await?;
                        // The boxed plaintext stream wraps the raw socket, so
                        // the handshake happens over the same connection.
                        let accept = tls.acceptor.accept(StreamWrapper(stream));
                        let tls_stream =
                            match tokio::time::timeout_at(deadline, accept).await {
                                Err(_) => {
                                    ctx.counters.bump_starttls();
                                    return Ok(());
                                }
                                Ok(Err(e)) => return Err(e.into()),
                                Ok(Ok(s)) => s,
                            };
                        cn = tls_peer_common_name(&tls_stream);
                        if let Some(ref cn) = cn {
                            debug!(%peer, cn, "client certificate accepted");
                        }
                        stream = Box::new(tls_stream);
                        buf.clear();
                        continue;
                    }
                    None => {
                        stream.write_all(b"ERR No TLS\n").await?;
                        stream.flush().await?;
                        buf.clear();
                        continue;
                    }
                }
            }
        }

        if framing.is_none() {
            match Framing::detect(&buf) {
                None => continue,
                Some(Err(e)) => {
                    warn!(sender, %e, "bad framing header");
                    return Ok(());
                }
                Some(Ok(f)) => {
                    let declared = match &f {
                        Framing::Sized { body, .. } => Some(*body),
                        Framing::Compressed { inflated, .. } => Some(*inflated),
                        Framing::Plain => None,
                    };
                    if let Some(d) = declared {
                        if d > ctx.max_msg_size {
                            warn!(sender, declared = d, limit = ctx.max_msg_size, "oversize message dropped");
                            drain(&mut stream, deadline).await;
                            return Ok(());
                        }
                    }
                    framing = Some(f);
                }
            }
        }

        match framing {
            Some(Framing::Sized { header_len, body }) => {
                if buf.len() >= header_len + body {
                    break;
                }
            }
            _ => {
                if buf.len() > ctx.max_msg_size {
                    warn!(sender, size = buf.len(), limit = ctx.max_msg_size, "oversize message dropped");
                    drain(&mut stream, deadline).await;
                    return Ok(());
                }
            }
        }
    }

    if buf.is_empty() {
        return Ok(());
    }

    // Responding: hand the message to the core and relay any reply.
    let (reply_tx, reply_rx) = oneshot::channel();
    let msg = IngestMessage { buf: buf.freeze(), sender, sender_cn: cn, via_bfq: false };
    if ctx.core_tx.send(CoreCmd::Message { msg, reply: Some(reply_tx) }).await.is_err() {
        return Ok(());
    }
    let reply = match tokio::time::timeout_at(deadline, reply_rx).await {
        Err(_) => {
            ctx.counters.bump_responding();
            return Ok(());
        }
        Ok(Err(_)) => return Ok(()),
        Ok(Ok(r)) => r,
    };
    if !reply.is_empty() {
        match tokio::time::timeout_at(deadline, stream.write_all(&reply)).await {
            Err(_) => {
                ctx.counters.bump_responding();
                return Ok(());
            }
            Ok(res) => res?,
        }
        stream.flush().await?;
    }
    let _ = stream.shutdown().await;
    Ok(())
}

/// Discard inbound bytes until EOF or the deadline, so an oversize sender
/// sees a clean close instead of a reset.
async fn drain(stream: &mut BoxedConn, deadline: tokio::time::Instant) {
    let mut scratch = [0u8; 16 * 1024];
    loop {
        match tokio::time::timeout_at(deadline, stream.read(&mut scratch)).await {
            Ok(Ok(n)) if n > 0 => continue,
            _ => return,
        }
    }
}

/// Newtype so a boxed stream can be handed to the TLS acceptor for the
/// STARTTLS upgrade.
struct StreamWrapper(BoxedConn);

impl AsyncRead for StreamWrapper {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.0).poll_read(cx, buf)
    }
}

impl AsyncWrite for StreamWrapper {
    fn poll_write(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        data: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        std::pin::Pin::new(&mut self.0).poll_write(cx, data)
    }

    fn poll_flush(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.0).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.0).poll_shutdown(cx)
    }
}

fn peer_common_name(stream: &tokio_rustls::server::TlsStream<TcpStream>) -> Option<String> {
    let (_, conn) = stream.get_ref();
    conn.peer_certificates().and_then(|certs| certs.first()).and_then(|c| der_common_name(c))
}

fn tls_peer_common_name(stream: &tokio_rustls::server::TlsStream<StreamWrapper>) -> Option<String> {
    let (_, conn) = stream.get_ref();
    conn.peer_certificates().and_then(|certs| certs.first()).and_then(|c| der_common_name(c))
}

/// Pull the subject CN out of a certificate.
///
/// Deliberately minimal: scans for the last commonName attribute (the
/// subject follows the issuer in the TBS layout) instead of a full X.509
/// parse, which is all the CN-pinning log line needs.
fn der_common_name(cert: &rustls::pki_types::CertificateDer<'_>) -> Option<String> {
    const CN_OID: &[u8] = &[0x06, 0x03, 0x55, 0x04, 0x03];
    let der = cert.as_ref();
    let mut found: Option<String> = None;
    let mut i = 0;
    while i + CN_OID.len() + 2 < der.len() {
        if &der[i..i + CN_OID.len()] == CN_OID {
            let tag = der[i + CN_OID.len()];
            let len = der[i + CN_OID.len() + 1] as usize;
            // Short-form length, string tags only (UTF8, Printable, IA5).
            if matches!(tag, 0x0c | 0x13 | 0x16) && len < 0x80 {
                let start = i + CN_OID.len() + 2;
                if let Some(bytes) = der.get(start..start + len) {
                    if let Ok(s) = std::str::from_utf8(bytes) {
                        found = Some(s.to_owned());
                    }
                }
            }
        }
        i += 1;
    }
    found
}

#[cfg(test)]
#[path = "listener_tests.rs"]
mod tests;
