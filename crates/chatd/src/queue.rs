// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-subscriber FIFO delivery queue with a single serial drain worker.
//!
//! `enqueue` is non-blocking: it just pushes onto an unbounded channel. A
//! dedicated task drains the channel serially and writes each line to the
//! subscriber's transport. A transport-dead error drops the message and
//! kills the drain; a transient error re-queues the message at the head and
//! backs off briefly before retrying.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Boxed writer half of a connection's transport (plaintext or TLS).
pub type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send>;

/// A cloneable handle onto a single transport writer, serialized by a mutex.
///
/// A connection hands out one clone to each `MessageQueue` it spawns over
/// its lifetime (one per room it joins) plus keeps one for its own direct
/// protocol replies, so "a fresh queue over the same socket" (§4.4) doesn't
/// require literally splitting the transport more than once.
#[derive(Clone)]
pub struct SharedWriter(Arc<Mutex<BoxedWriter>>);

impl SharedWriter {
    pub fn new(writer: BoxedWriter) -> Self {
        Self(Arc::new(Mutex::new(writer)))
    }

    pub async fn write_line(&self, msg: &str) -> io::Result<()> {
        let mut buf = Vec::with_capacity(msg.len() + 1);
        buf.extend_from_slice(msg.as_bytes());
        buf.push(b'\n');
        let mut clone = self.clone();
        tokio::io::AsyncWriteExt::write_all(&mut clone, &buf).await?;
        tokio::io::AsyncWriteExt::flush(&mut clone).await
    }
}

impl AsyncWrite for SharedWriter {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let mut guard = self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Pin::new(&mut *guard).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut guard = self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Pin::new(&mut *guard).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut guard = self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Pin::new(&mut *guard).poll_shutdown(cx)
    }
}

const ROOM_MESSAGE_PREFIX: &[u8] = b"ROOM_MESSAGE ";

/// Wraps a transport writer so every line written through it is framed as
/// `ROOM_MESSAGE <line>` on the wire (§6). `Room`/`MessageQueue` themselves
/// stay protocol-agnostic — they only ever see the unframed payload (the same
/// strings stored in history and fed to the AI context extractor) — so the
/// framing is applied once, where `ConnectionHandler` hands a writer to
/// `Room::add_user`.
pub struct RoomMessageWriter<W> {
    inner: W,
    /// Bytes of `ROOM_MESSAGE ` already confirmed written for the line
    /// currently in flight; `ROOM_MESSAGE_PREFIX.len()` once the prefix is
    /// fully flushed and only the caller's own bytes remain to be written.
    prefix_sent: usize,
}

impl<W: AsyncWrite + Unpin> RoomMessageWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, prefix_sent: 0 }
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for RoomMessageWriter<W> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.prefix_sent >= ROOM_MESSAGE_PREFIX.len() {
            return Pin::new(&mut this.inner).poll_write(cx, buf);
        }
        // Write the unsent remainder of the prefix and `buf` as one combined
        // buffer so a single logical line reaches the transport in one
        // underlying write, the same way an unframed line does.
        let mut combined = Vec::with_capacity(ROOM_MESSAGE_PREFIX.len() - this.prefix_sent + buf.len());
        combined.extend_from_slice(&ROOM_MESSAGE_PREFIX[this.prefix_sent..]);
        combined.extend_from_slice(buf);
        match Pin::new(&mut this.inner).poll_write(cx, &combined) {
            Poll::Ready(Ok(n)) => {
                let remaining_prefix = ROOM_MESSAGE_PREFIX.len() - this.prefix_sent;
                if n < remaining_prefix {
                    this.prefix_sent += n;
                    Poll::Ready(Ok(0))
                } else {
                    this.prefix_sent = ROOM_MESSAGE_PREFIX.len();
                    Poll::Ready(Ok(n - remaining_prefix))
                }
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_flush(cx) {
            Poll::Ready(Ok(())) => {
                this.prefix_sent = 0;
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

const RETRY_BACKOFF: Duration = Duration::from_millis(500);
const PACING_DELAY: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeliveryError {
    TransportDead,
    Transient,
}

/// Classify a write failure as dead-forever or worth retrying once.
fn classify(err: &io::Error) -> DeliveryError {
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted => {
            DeliveryError::Transient
        }
        _ => DeliveryError::TransportDead,
    }
}

async fn write_line(writer: &mut BoxedWriter, msg: &str) -> Result<(), DeliveryError> {
    let mut buf = Vec::with_capacity(msg.len() + 1);
    buf.extend_from_slice(msg.as_bytes());
    buf.push(b'\n');
    writer.write_all(&buf).await.map_err(|e| classify(&e))?;
    writer.flush().await.map_err(|e| classify(&e))?;
    Ok(())
}

/// A single subscriber's outbound queue. One per (user, room) pair.
pub struct MessageQueue {
    tx: mpsc::UnboundedSender<String>,
    drain: JoinHandle<()>,
    dead: Arc<AtomicBool>,
}

impl MessageQueue {
    /// Spawn the drain worker over `writer` and return the handle to enqueue on.
    pub fn spawn(writer: BoxedWriter) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let dead = Arc::new(AtomicBool::new(false));
        let drain = tokio::spawn(Self::run(writer, rx, dead.clone()));
        Self { tx, drain, dead }
    }

    async fn run(mut writer: BoxedWriter, mut rx: mpsc::UnboundedReceiver<String>, dead: Arc<AtomicBool>) {
        let mut pending: Option<String> = None;
        loop {
            let msg = match pending.take() {
                Some(m) => m,
                None => match rx.recv().await {
                    Some(m) => m,
                    None => return, // sender (queue handle) dropped
                },
            };
            match write_line(&mut writer, &msg).await {
                Ok(()) => {
                    tokio::time::sleep(PACING_DELAY).await;
                }
                Err(DeliveryError::Transient) => {
                    pending = Some(msg);
                    tokio::time::sleep(RETRY_BACKOFF).await;
                }
                Err(DeliveryError::TransportDead) => {
                    debug!("message queue drain terminating: transport dead");
                    dead.store(true, Ordering::Release);
                    return;
                }
            }
        }
    }

    /// Non-blocking, order-preserving enqueue. A no-op once the queue is dead.
    pub fn enqueue(&self, msg: impl Into<String>) {
        if self.dead.load(Ordering::Acquire) {
            return;
        }
        // Send failure means the drain task already exited (e.g. dropped the
        // receiver); either way the caller's fire-and-forget contract holds.
        let _ = self.tx.send(msg.into());
    }

    /// Whether the drain worker has observed a transport-dead condition.
    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }
}

impl Drop for MessageQueue {
    fn drop(&mut self) {
        self.drain.abort();
    }
}

#[cfg(test)]
#[path = "queue_tests.rs"]
mod tests;
