//! Frame reading and writing over a raw byte stream.
//!
//! A frame is `<json-header> \r\n\r\n <payload>`; the header's `len` field is
//! authoritative, so the reader consumes exactly that many payload bytes
//! before the next header.  Header reads fetch a 24-byte prefix first (floor
//! against tiny-read attacks), re-inspect the whole buffer in case the
//! terminator already sits inside it, then scan one byte at a time watching
//! the trailing four-byte window.  Bytes fetched past a terminator are kept
//! and consumed first by the payload path, so an overshoot never corrupts
//! framing.

use crate::error::{Error, Result};
use courier_protocol::{self as protocol, FrameHeader, MIN_HEADER_PREFIX, TERMINATOR};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

pub(crate) struct FrameReader<R> {
    inner: R,
    /// Bytes read off the wire but not yet handed out.
    pending: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub(crate) fn new(inner: R) -> Self {
        FrameReader {
            inner,
            pending: Vec::new(),
        }
    }

    /// Read the next frame header, leaving the stream positioned at the
    /// first payload byte.
    pub(crate) async fn read_header(&mut self) -> Result<FrameHeader> {
        // A previous over-read may already hold a complete header.
        if let Some(at) = protocol::find_terminator(&self.pending) {
            return self.take_header(at);
        }

        // Initial prefix: demand MIN_HEADER_PREFIX bytes, but re-inspect
        // after every read so a terminator inside the prefix is honored.
        while self.pending.len() < MIN_HEADER_PREFIX {
            let mut buf = [0u8; MIN_HEADER_PREFIX];
            let want = MIN_HEADER_PREFIX - self.pending.len();
            let n = self.inner.read(&mut buf[..want]).await?;
            if n == 0 {
                return Err(Error::PeerClosed);
            }
            self.pending.extend_from_slice(&buf[..n]);
            if let Some(at) = protocol::find_terminator(&self.pending) {
                return self.take_header(at);
            }
        }

        // One byte at a time, watching the trailing four-byte window.
        loop {
            let mut byte = [0u8; 1];
            let n = self.inner.read(&mut byte).await?;
            if n == 0 {
                return Err(Error::PeerClosed);
            }
            self.pending.push(byte[0]);
            let tail = &self.pending[self.pending.len() - TERMINATOR.len()..];
            if tail == TERMINATOR {
                return self.take_header(self.pending.len() - TERMINATOR.len());
            }
            if tail == [0u8; 4] {
                // NetworkStream-style peer loss: the wire degenerates to zeros.
                return Err(Error::PeerClosed);
            }
        }
    }

    fn take_header(&mut self, terminator_at: usize) -> Result<FrameHeader> {
        let header = protocol::parse_header(&self.pending[..terminator_at])
            .map_err(|e| Error::Protocol(format!("malformed header: {e}")));
        self.pending.drain(..terminator_at + TERMINATOR.len());
        header
    }

    /// Read exactly `len` payload bytes into memory.
    pub(crate) async fn read_payload(&mut self, len: u64) -> Result<Vec<u8>> {
        let len = checked_len(len)?;
        let take = len.min(self.pending.len());
        let mut data: Vec<u8> = self.pending.drain(..take).collect();
        if data.len() < len {
            let offset = data.len();
            data.resize(len, 0);
            self.inner
                .read_exact(&mut data[offset..])
                .await
                .map_err(eof_as_peer_closed)?;
        }
        Ok(data)
    }

    /// Discard exactly `len` payload bytes (expired or unwanted frames are
    /// still fully consumed from the wire).
    pub(crate) async fn drain_payload(&mut self, len: u64) -> Result<()> {
        let mut remaining = checked_len(len)?;
        let take = remaining.min(self.pending.len());
        self.pending.drain(..take);
        remaining -= take;
        let mut scratch = [0u8; 8 * 1024];
        while remaining > 0 {
            let want = remaining.min(scratch.len());
            let n = self
                .inner
                .read(&mut scratch[..want])
                .await
                .map_err(Error::Transport)?;
            if n == 0 {
                return Err(Error::PeerClosed);
            }
            remaining -= n;
        }
        Ok(())
    }

    /// Copy exactly `len` payload bytes into `sink`, chunked by
    /// `chunk_size`.  If the sink goes away mid-copy (the consumer dropped
    /// its reader), the remaining wire bytes are still drained so the next
    /// frame stays aligned.
    pub(crate) async fn pump_payload<W: AsyncWrite + Unpin>(
        &mut self,
        len: u64,
        sink: &mut W,
        chunk_size: usize,
    ) -> Result<()> {
        let mut remaining = checked_len(len)?;
        let mut scratch = vec![0u8; chunk_size.max(1)];
        let mut sink_gone = false;

        while remaining > 0 {
            let filled = if self.pending.is_empty() {
                let want = remaining.min(scratch.len());
                let n = self
                    .inner
                    .read(&mut scratch[..want])
                    .await
                    .map_err(Error::Transport)?;
                if n == 0 {
                    return Err(Error::PeerClosed);
                }
                scratch[..n].to_vec()
            } else {
                let take = remaining.min(self.pending.len());
                self.pending.drain(..take).collect()
            };
            remaining -= filled.len();
            if !sink_gone && sink.write_all(&filled).await.is_err() {
                debug!("payload consumer went away; draining remaining bytes");
                sink_gone = true;
            }
        }
        if !sink_gone {
            let _ = sink.shutdown().await;
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn with_pending(inner: R, pending: Vec<u8>) -> Self {
        FrameReader { inner, pending }
    }
}

fn checked_len(len: u64) -> Result<usize> {
    usize::try_from(len)
        .map_err(|_| Error::Protocol(format!("payload length {len} exceeds addressable memory")))
}

fn eof_as_peer_closed(e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        Error::PeerClosed
    } else {
        Error::Transport(e)
    }
}

// ---------------------------------------------------------------------------
// FrameWriter
// ---------------------------------------------------------------------------

pub(crate) struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub(crate) fn new(inner: W) -> Self {
        FrameWriter { inner }
    }

    /// Write a complete frame from an in-memory payload.
    pub(crate) async fn write_frame(&mut self, header: &FrameHeader, payload: &[u8]) -> Result<()> {
        let head = protocol::encode_header(header)
            .map_err(|e| Error::Protocol(format!("header serialization: {e}")))?;
        self.inner.write_all(&head).await?;
        if !payload.is_empty() {
            self.inner.write_all(payload).await?;
        }
        self.inner.flush().await?;
        Ok(())
    }

    /// Write a frame whose payload is streamed from `source`; exactly
    /// `header.len` bytes are copied in `chunk_size` chunks.
    pub(crate) async fn write_frame_from<R: AsyncRead + Unpin + ?Sized>(
        &mut self,
        header: &FrameHeader,
        source: &mut R,
        chunk_size: usize,
    ) -> Result<()> {
        let head = protocol::encode_header(header)
            .map_err(|e| Error::Protocol(format!("header serialization: {e}")))?;
        self.inner.write_all(&head).await?;

        let mut remaining = checked_len(header.len)?;
        let mut scratch = vec![0u8; chunk_size.max(1)];
        while remaining > 0 {
            let want = remaining.min(scratch.len());
            let n = source.read(&mut scratch[..want]).await?;
            if n == 0 {
                return Err(Error::Protocol(format!(
                    "payload source ended {remaining} bytes early"
                )));
            }
            self.inner.write_all(&scratch[..n]).await?;
            remaining -= n;
        }
        self.inner.flush().await?;
        Ok(())
    }

    pub(crate) async fn shutdown(&mut self) {
        let _ = self.inner.shutdown().await;
    }
}
