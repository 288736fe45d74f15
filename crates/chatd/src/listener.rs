// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Accepts transport-secured connections and spawns a `ConnectionHandler`
//! per socket. TLS is the default; a plaintext fallback exists only for
//! diagnostics and requires an explicit operator opt-in.

use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};

use crate::config::ChatConfig;
use crate::connection::ConnectionHandler;
use crate::state::ChatState;

/// Build a `rustls::ServerConfig` from the configured PEM cert chain and key.
fn load_tls_config(config: &ChatConfig) -> anyhow::Result<ServerConfig> {
    let cert_path = config.tls_cert_path.as_ref().ok_or_else(|| anyhow::anyhow!("no TLS cert configured"))?;
    let key_path = config.tls_key_path.as_ref().ok_or_else(|| anyhow::anyhow!("no TLS key configured"))?;

    let cert_file = std::fs::read(cert_path)?;
    let key_file = std::fs::read(key_path)?;

    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut cert_file.as_slice()).collect::<Result<_, _>>()?;
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_file.as_slice())?
        .ok_or_else(|| anyhow::anyhow!("no private key found in {}", key_path.display()))?;

    let server_config = ServerConfig::builder().with_no_client_auth().with_single_cert(certs, key)?;
    Ok(server_config)
}

/// Disable Nagle's algorithm for this line-oriented protocol and enable
/// `SO_KEEPALIVE` on the accepted socket, per §4.8's "sets a read timeout
/// (~60s) and keep-alive on the socket". The read-timeout half is handled at
/// the application level by `ConnectionHandler`'s per-read timeout; this is
/// the socket-level TCP keepalive the spec names alongside it, so a dead
/// peer that never sends and is never written to (no pending heartbeat, no
/// pending read) is still eventually reclaimed by the OS.
fn configure_socket(stream: &TcpStream) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    socket2::SockRef::from(stream).set_keepalive(true)
}

/// Run the accept loop until `chat.shutdown` is cancelled.
pub async fn run(chat: Arc<ChatState>) -> anyhow::Result<()> {
    let addr = format!("{}:{}", chat.config.host, chat.config.port);
    let tcp = TcpListener::bind(&addr).await?;

    let acceptor = match load_tls_config(&chat.config) {
        Ok(tls_config) => {
            info!("chatd listening on {addr} (TLS)");
            Some(TlsAcceptor::from(Arc::new(tls_config)))
        }
        Err(e) => {
            if chat.config.allow_plaintext {
                warn!(err = %e, "TLS setup failed, falling back to plaintext (diagnostic mode only)");
                info!("chatd listening on {addr} (PLAINTEXT, diagnostic fallback)");
                None
            } else {
                anyhow::bail!("TLS setup failed and --allow-plaintext is not set: {e}");
            }
        }
    };

    loop {
        tokio::select! {
            _ = chat.shutdown.cancelled() => {
                info!("listener shutting down");
                return Ok(());
            }
            accepted = tcp.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(err = %e, "failed to accept connection");
                        continue;
                    }
                };
                if let Err(e) = configure_socket(&stream) {
                    warn!(err = %e, %peer, "failed to configure accepted socket");
                }

                let chat = chat.clone();
                match &acceptor {
                    Some(acceptor) => {
                        let acceptor = acceptor.clone();
                        tokio::spawn(async move {
                            match acceptor.accept(stream).await {
                                Ok(tls_stream) => spawn_handler(tls_stream, chat).await,
                                Err(e) => warn!(err = %e, %peer, "TLS handshake failed"),
                            }
                        });
                    }
                    None => {
                        tokio::spawn(spawn_handler(stream, chat));
                    }
                }
            }
        }
    }
}

async fn spawn_handler<S>(stream: S, chat: Arc<ChatState>)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let handler = ConnectionHandler::new(Box::new(read_half), Box::new(write_half), chat);
    handler.run().await;
}

#[cfg(test)]
#[path = "listener_tests.rs"]
mod tests;
