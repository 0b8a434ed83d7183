use std::io;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Async reader with an unread buffer.
///
/// The protocol has no delimiters, so a single receive can carry the tail of
/// one message and the start of the next. Whoever over-reads pushes the
/// surplus back with [`PushbackReader::unread`] and the next read sees it
/// first.
#[derive(Debug)]
pub struct PushbackReader<R> {
    inner: R,
    pending: BytesMut,
}

impl<R> PushbackReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            pending: BytesMut::new(),
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Puts `bytes` in front of anything already pending.
    pub fn unread(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let mut merged = BytesMut::with_capacity(bytes.len() + self.pending.len());
        merged.extend_from_slice(bytes);
        merged.extend_from_slice(&self.pending);
        self.pending = merged;
    }

    /// Single read. Cancel safe: nothing is consumed unless it is returned.
    pub async fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.pending.is_empty() {
            let n = buf.len().min(self.pending.len());
            buf[..n].copy_from_slice(&self.pending[..n]);
            self.pending.advance(n);
            return Ok(n);
        }
        self.inner.read(buf).await
    }

    pub async fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        let filled = self.read_up_to(buf).await?;
        if filled < buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("stream ended after {filled} of {} bytes", buf.len()),
            ));
        }
        Ok(())
    }

    /// Fills `buf` unless the stream ends first; returns the filled length.
    pub async fn read_up_to(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read_some(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }
}
