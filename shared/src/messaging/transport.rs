//! Newline-delimited JSON framing over a persistent stream connection.
//!
//! Every frame is one JSON object followed by `\n`. Blank lines are
//! ignored. A line that is not valid JSON surfaces as
//! [`MessageError::Serialization`] and leaves the connection usable, so the
//! caller decides whether to drop it or keep reading.

use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use super::{MessageError, MessageResult};

/// Upper bound for a single frame
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// Serialize a message into a single frame, trailing newline included
pub fn encode_frame<T: Serialize>(message: &T) -> MessageResult<String> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

/// Reads JSON frames from the read half of a connection
pub struct FrameReader<R> {
    inner: BufReader<R>,
    /// Bytes of the line being read, kept across cancelled reads
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
            buf: Vec::new(),
        }
    }

    /// Next frame, or `None` once the peer closed the connection.
    ///
    /// Never buffers more than [`MAX_FRAME_BYTES`] of one line; a longer
    /// line fails with [`MessageError::Protocol`] as soon as the limit is
    /// crossed. Cancel safe: usable as a `tokio::select!` branch.
    pub async fn read_frame(&mut self) -> MessageResult<Option<Value>> {
        loop {
            let limit = (MAX_FRAME_BYTES + 1).saturating_sub(self.buf.len()) as u64;
            let read = (&mut self.inner)
                .take(limit)
                .read_until(b'\n', &mut self.buf)
                .await?;

            if self.buf.len() > MAX_FRAME_BYTES {
                let size = self.buf.len();
                self.buf = Vec::new();
                return Err(MessageError::Protocol(format!(
                    "frame exceeds limit of {} bytes ({} read)",
                    MAX_FRAME_BYTES, size
                )));
            }

            let complete = self.buf.last() == Some(&b'\n');
            if !complete && read > 0 {
                // Hit end of stream mid-line; the next read reports it
                continue;
            }
            if self.buf.is_empty() {
                return Ok(None);
            }

            let raw = std::mem::take(&mut self.buf);
            let line = match std::str::from_utf8(&raw) {
                Ok(line) => line,
                Err(e) => return Err(MessageError::Serialization(format!("invalid UTF-8: {}", e))),
            };

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            return serde_json::from_str(trimmed)
                .map(Some)
                .map_err(|e| MessageError::Serialization(format!("{}: {}", e, trimmed)));
        }
    }
}

/// Writes JSON frames to the write half of a connection
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn write_frame<T: Serialize>(&mut self, message: &T) -> MessageResult<()> {
        let line = encode_frame(message)?;
        self.write_line(&line).await
    }

    /// Write an already encoded frame
    pub async fn write_line(&mut self, line: &str) -> MessageResult<()> {
        self.inner.write_all(line.as_bytes()).await?;
        if !line.ends_with('\n') {
            self.inner.write_all(b"\n").await?;
        }
        self.inner.flush().await?;
        Ok(())
    }
}
