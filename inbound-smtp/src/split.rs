//! Bounded-memory splitting of a message body stream.
//!
//! The first [`HEADER_WINDOW`] bytes are captured for header parsing. The
//! object store then receives the window followed by the rest of the same
//! stream, so the body is read exactly once and never held in full.

use std::{
    io,
    pin::Pin,
    task::{Context, Poll, ready},
};

use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

/// Bytes captured from the start of a message for header extraction
pub const HEADER_WINDOW: usize = 64 * 1024;

/// Counts bytes read through it and fails once `limit` is passed.
///
/// The failure is sticky: [`CountingReader::exceeded`] reports it after the
/// consumer has given up on the stream.
#[derive(Debug)]
pub struct CountingReader<R> {
    inner: R,
    limit: u64,
    count: u64,
    exceeded: bool,
}

impl<R> CountingReader<R> {
    pub const fn new(inner: R, limit: u64) -> Self {
        Self {
            inner,
            limit,
            count: 0,
            exceeded: false,
        }
    }

    /// Bytes read so far
    pub const fn count(&self) -> u64 {
        self.count
    }

    pub const fn exceeded(&self) -> bool {
        self.exceeded
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for CountingReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.exceeded {
            return Poll::Ready(Err(too_large(self.limit)));
        }

        let before = buf.filled().len();
        ready!(Pin::new(&mut self.inner).poll_read(cx, buf))?;
        self.count += (buf.filled().len() - before) as u64;

        if self.count > self.limit {
            self.exceeded = true;
            // a failed read must not hand out data
            buf.set_filled(before);
            return Poll::Ready(Err(too_large(self.limit)));
        }

        Poll::Ready(Ok(()))
    }
}

fn too_large(limit: u64) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("message exceeds {limit} bytes"),
    )
}

/// The captured start of a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderWindow {
    bytes: Vec<u8>,
}

impl HeaderWindow {
    /// Read up to [`HEADER_WINDOW`] bytes from `reader`
    pub async fn capture<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Self> {
        let mut bytes = Vec::with_capacity(HEADER_WINDOW);
        reader
            .take(HEADER_WINDOW as u64)
            .read_to_end(&mut bytes)
            .await?;
        Ok(Self { bytes })
    }

    /// The stream ended inside the window, so this is the whole message
    pub fn is_complete(&self) -> bool {
        self.bytes.len() < HEADER_WINDOW
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[tokio::test]
    async fn small_message_fits_in_the_window() {
        let mut body: &[u8] = b"Subject: hi\r\n\r\nbody\r\n";
        let window = HeaderWindow::capture(&mut body).await.unwrap();

        assert!(window.is_complete());
        assert_eq!(window.as_bytes(), b"Subject: hi\r\n\r\nbody\r\n");
    }

    #[tokio::test]
    async fn window_then_remainder_reassembles_the_stream() {
        let message: Vec<u8> = (0..HEADER_WINDOW + 1000).map(|i| (i % 251) as u8).collect();
        let mut reader = CountingReader::new(message.as_slice(), u64::MAX);

        let window = HeaderWindow::capture(&mut reader).await.unwrap();
        assert!(!window.is_complete());
        assert_eq!(window.len(), HEADER_WINDOW);

        let mut forwarded = Vec::new();
        std::io::Cursor::new(window.into_bytes())
            .chain(&mut reader)
            .read_to_end(&mut forwarded)
            .await
            .unwrap();

        assert_eq!(forwarded, message);
        assert_eq!(reader.count(), message.len() as u64);
    }

    #[tokio::test]
    async fn exceeding_the_limit_is_sticky() {
        let message = vec![b'a'; 100];
        let mut reader = CountingReader::new(message.as_slice(), 64);

        let mut sink = Vec::new();
        let err = reader.read_to_end(&mut sink).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(reader.exceeded());

        let mut buf = [0; 8];
        assert!(reader.read(&mut buf).await.is_err());
    }

    #[tokio::test]
    async fn failed_read_hands_out_nothing() {
        let message = vec![b'a'; 100];
        let mut reader = CountingReader::new(message.as_slice(), 64);

        let mut buf = [0; 128];
        let mut read_buf = ReadBuf::new(&mut buf);
        let result = std::future::poll_fn(|cx| Pin::new(&mut reader).poll_read(cx, &mut read_buf)).await;

        assert!(result.is_err());
        assert!(read_buf.filled().is_empty());
    }

    #[tokio::test]
    async fn crossing_the_limit_mid_stream_fails_the_whole_read() {
        let message: Vec<u8> = (0..HEADER_WINDOW * 2).map(|i| (i % 251) as u8).collect();
        let mut reader = CountingReader::new(
            tokio::io::BufReader::with_capacity(4096, message.as_slice()),
            HEADER_WINDOW as u64 + 10,
        );

        let window = HeaderWindow::capture(&mut reader).await.unwrap();
        let mut forwarded = Vec::new();
        let err = std::io::Cursor::new(window.into_bytes())
            .chain(&mut reader)
            .read_to_end(&mut forwarded)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(reader.exceeded());
        assert!(forwarded.len() <= HEADER_WINDOW + 10);
    }

    #[tokio::test]
    async fn limit_is_inclusive() {
        let message = vec![b'a'; 64];
        let mut reader = CountingReader::new(message.as_slice(), 64);

        let mut sink = Vec::new();
        reader.read_to_end(&mut sink).await.unwrap();
        assert!(!reader.exceeded());
        assert_eq!(reader.count(), 64);
    }
}
