//! One established connection: the transport, its framing halves, the write
//! and read locks, and the per-connection shutdown signal.

use crate::error::{Error, Result};
use crate::framing::{FrameReader, FrameWriter};
use courier_protocol::{FrameHeader, Status};
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, watch};
use tracing::debug;

/// Bounded wait for graceful-close notices.
const NOTICE_TIMEOUT: Duration = Duration::from_secs(1);

/// The transport under a connection: raw TCP or a TLS session over it.
pub(crate) enum PeerStream {
    Plain(TcpStream),
    ServerTls(Box<tokio_rustls::server::TlsStream<TcpStream>>),
    ClientTls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for PeerStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            PeerStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            PeerStream::ServerTls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            PeerStream::ClientTls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for PeerStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            PeerStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            PeerStream::ServerTls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            PeerStream::ClientTls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            PeerStream::Plain(s) => Pin::new(s).poll_flush(cx),
            PeerStream::ServerTls(s) => Pin::new(s.as_mut()).poll_flush(cx),
            PeerStream::ClientTls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            PeerStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            PeerStream::ServerTls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            PeerStream::ClientTls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// A live connection.
///
/// The write lock makes a whole frame (header + payload) atomic with respect
/// to other senders on the same connection; the read lock keeps framing reads
/// structural (one reader walks headers and payloads, nobody else touches the
/// stream).  The shutdown signal fires once, on close, and every task parked
/// on this connection is expected to observe it.
pub(crate) struct Connection {
    peer_addr: SocketAddr,
    pub(crate) reader: Mutex<FrameReader<ReadHalf<PeerStream>>>,
    writer: Mutex<FrameWriter<WriteHalf<PeerStream>>>,
    shutdown: watch::Sender<bool>,
    buffer_size: usize,
}

impl Connection {
    pub(crate) fn new(stream: PeerStream, peer_addr: SocketAddr, buffer_size: usize) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        let (shutdown, _) = watch::channel(false);
        Connection {
            peer_addr,
            reader: Mutex::new(FrameReader::new(read_half)),
            writer: Mutex::new(FrameWriter::new(write_half)),
            shutdown,
            buffer_size,
        }
    }

    pub(crate) fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub(crate) fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Send one frame with an in-memory payload.  Header and payload are
    /// written back to back under the write lock.
    pub(crate) async fn send_bytes(&self, header: &FrameHeader, payload: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(Error::NotConnected);
        }
        let mut writer = self.writer.lock().await;
        writer.write_frame(header, payload).await
    }

    /// Send one frame streaming `header.len` payload bytes from `source`.
    pub(crate) async fn send_stream(
        &self,
        header: &FrameHeader,
        source: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<()> {
        if self.is_closed() {
            return Err(Error::NotConnected);
        }
        let mut writer = self.writer.lock().await;
        writer
            .write_frame_from(header, source, self.buffer_size)
            .await
    }

    /// Best-effort graceful-close notice: a zero-payload control frame with
    /// a bounded wait, so a peer that stopped reading cannot stall the
    /// disconnect path.
    pub(crate) async fn send_notice(&self, status: Status) {
        let header = FrameHeader::control(status);
        match tokio::time::timeout(NOTICE_TIMEOUT, self.send_bytes(&header, &[])).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(error = %e, "close notice not delivered"),
            Err(_elapsed) => debug!("close notice timed out"),
        }
    }

    /// Fire the shutdown signal and close the write side.  Idempotent.
    pub(crate) async fn close(&self) {
        let already_closed = self.shutdown.send_replace(true);
        if already_closed {
            return;
        }
        // A writer blocked mid-frame keeps the lock; the socket itself is
        // torn down when the last reference to the connection drops.
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.shutdown().await;
        }
    }
}
