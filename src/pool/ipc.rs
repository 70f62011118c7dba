//! Buffered line framing for the control channel.
//!
//! A single read may carry half a message or several coalesced ones, so bytes
//! are buffered until a newline arrives and only complete frames are parsed.

use std::collections::VecDeque;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use super::protocol::ControlMessage;
use crate::error::{PoolError, Result};

/// Default read buffer size (64KB).
const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Frames longer than this are treated as a protocol error.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Splits a byte stream into newline-delimited frames.
#[derive(Debug, Default)]
pub struct LineFramer {
    buffer: Vec<u8>,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `chunk` and return every complete, non-empty frame it finished,
    /// in order.
    ///
    /// A frame that is not UTF-8 comes out as an error in its place, so the
    /// frames before it are still delivered. Trailing `\r` is stripped. An
    /// incomplete tail stays buffered for the next call; one that grows past
    /// [`MAX_FRAME_BYTES`] is discarded and reported after the good frames.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<String>> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.buffer[start..].iter().position(|&b| b == b'\n') {
            let end = start + offset;
            let mut line = &self.buffer[start..end];
            if let Some(stripped) = line.strip_suffix(b"\r") {
                line = stripped;
            }
            if !line.is_empty() {
                frames.push(
                    std::str::from_utf8(line)
                        .map(str::to_string)
                        .map_err(|e| PoolError::Protocol(format!("Frame is not UTF-8: {}", e))),
                );
            }
            start = end + 1;
        }
        self.buffer.drain(..start);

        if self.buffer.len() > MAX_FRAME_BYTES {
            self.buffer.clear();
            frames.push(Err(PoolError::Protocol(format!(
                "Frame exceeds {} bytes without a delimiter",
                MAX_FRAME_BYTES
            ))));
        }
        frames
    }

    /// Bytes waiting for a delimiter.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

/// Reads control messages from one side of a connection, in arrival order.
pub struct FrameReader<R> {
    inner: R,
    framer: LineFramer,
    ready: VecDeque<Result<String>>,
    chunk: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            framer: LineFramer::new(),
            ready: VecDeque::new(),
            chunk: vec![0; DEFAULT_BUFFER_SIZE],
        }
    }

    /// Read the next complete frame. Returns `None` on EOF.
    pub async fn next_line(&mut self) -> Result<Option<String>> {
        loop {
            if let Some(frame) = self.ready.pop_front() {
                return frame.map(Some);
            }
            let n = self.inner.read(&mut self.chunk).await?;
            if n == 0 {
                if self.framer.pending() > 0 {
                    tracing::debug!(
                        bytes = self.framer.pending(),
                        "Dropping unterminated frame at EOF"
                    );
                }
                return Ok(None);
            }
            self.ready.extend(self.framer.push(&self.chunk[..n]));
        }
    }

    /// Read and parse the next message. Returns `None` on EOF.
    pub async fn next_message(&mut self) -> Result<Option<ControlMessage>> {
        match self.next_line().await? {
            Some(line) => ControlMessage::from_line(&line)
                .map(Some)
                .map_err(|e| PoolError::Protocol(format!("Invalid message {:?}: {}", line, e))),
            None => Ok(None),
        }
    }
}

/// Item queued for a connection's writer task.
#[derive(Debug)]
pub enum Outgoing {
    /// Send a message and keep the connection open.
    Message(ControlMessage),
    /// Send a one-off JSON reply, then close.
    Reply(serde_json::Value),
    /// Close without sending anything further.
    Close,
}

/// Sending side of a connection's writer task.
pub type Outbox = mpsc::UnboundedSender<Outgoing>;

/// Write one message and flush.
pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &ControlMessage,
) -> Result<()> {
    writer.write_all(message.to_line().as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Drain `outbox` into `writer` until a reply or close is queued or every
/// sender is dropped, then shut the write side down.
pub async fn write_loop<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut outbox: mpsc::UnboundedReceiver<Outgoing>,
) {
    while let Some(item) = outbox.recv().await {
        let result = match item {
            Outgoing::Message(message) => write_message(&mut writer, &message).await,
            Outgoing::Reply(value) => {
                let mut line = value.to_string();
                line.push('\n');
                let _ = writer.write_all(line.as_bytes()).await;
                break;
            }
            Outgoing::Close => break,
        };
        if let Err(e) = result {
            tracing::debug!(error = %e, "Control connection write failed");
            break;
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixStream;

    fn frames(framer: &mut LineFramer, chunk: &[u8]) -> Vec<String> {
        framer
            .push(chunk)
            .into_iter()
            .collect::<Result<Vec<_>>>()
            .unwrap()
    }

    #[test]
    fn test_framer_splits_coalesced_messages() {
        let mut framer = LineFramer::new();
        let frames = frames(&mut framer, b"{\"cmd\":\"ready\"}\n{\"cmd\":\"status\"}\n");
        assert_eq!(frames, vec!["{\"cmd\":\"ready\"}", "{\"cmd\":\"status\"}"]);
        assert_eq!(framer.pending(), 0);
    }

    #[test]
    fn test_framer_buffers_partial_frames() {
        let mut framer = LineFramer::new();
        assert!(framer.push(b"{\"cmd\":\"re").is_empty());
        assert_eq!(framer.pending(), 10);
        let frames = frames(&mut framer, b"ady\"}\n{\"cmd\"");
        assert_eq!(frames, vec!["{\"cmd\":\"ready\"}"]);
        assert_eq!(framer.pending(), 6);
    }

    #[test]
    fn test_crlf_and_blank_lines() {
        let mut framer = LineFramer::new();
        let frames = frames(&mut framer, b"line1\r\n\n\r\nline2\n");
        assert_eq!(frames, vec!["line1", "line2"]);
    }

    #[test]
    fn test_oversized_frame_is_protocol_error() {
        let mut framer = LineFramer::new();
        let junk = vec![b'x'; MAX_FRAME_BYTES + 1];
        let out = framer.push(&junk);
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0], Err(PoolError::Protocol(_))));
        assert_eq!(framer.pending(), 0);
    }

    #[test]
    fn test_invalid_utf8_is_protocol_error() {
        let mut framer = LineFramer::new();
        let out = framer.push(b"\xff\xfe\n");
        assert!(matches!(out[..], [Err(PoolError::Protocol(_))]));
    }

    #[test]
    fn test_frames_before_invalid_utf8_survive() {
        let mut framer = LineFramer::new();
        let out = framer.push(b"{\"cmd\":\"register\",\"pid\":1,\"slot\":1}\n\xff\n");
        assert_eq!(out.len(), 2);
        assert_eq!(
            out[0].as_deref().unwrap(),
            "{\"cmd\":\"register\",\"pid\":1,\"slot\":1}"
        );
        assert!(matches!(out[1], Err(PoolError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_reader_delivers_message_coalesced_with_garbage() {
        let (mut left, right) = UnixStream::pair().unwrap();
        left.write_all(b"{\"cmd\":\"ready\"}\n\xff\xfe\n").await.unwrap();
        drop(left);

        let mut reader = FrameReader::new(right);
        assert_eq!(
            reader.next_message().await.unwrap(),
            Some(ControlMessage::Ready)
        );
        assert!(matches!(
            reader.next_message().await,
            Err(PoolError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_reader_writer_over_socket_pair() {
        let (left, right) = UnixStream::pair().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_loop(left, rx));

        tx.send(Outgoing::Message(ControlMessage::Register { pid: 7, slot: 2 }))
            .unwrap();
        tx.send(Outgoing::Message(ControlMessage::Ready)).unwrap();
        tx.send(Outgoing::Close).unwrap();
        writer.await.unwrap();

        let mut reader = FrameReader::new(right);
        assert_eq!(
            reader.next_message().await.unwrap(),
            Some(ControlMessage::Register { pid: 7, slot: 2 })
        );
        assert_eq!(
            reader.next_message().await.unwrap(),
            Some(ControlMessage::Ready)
        );
        assert_eq!(reader.next_message().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_reply_closes_connection() {
        let (left, right) = UnixStream::pair().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_loop(left, rx));

        tx.send(Outgoing::Reply(serde_json::json!({}))).unwrap();
        // Queued after the reply, so never written.
        tx.send(Outgoing::Message(ControlMessage::Bootstrap)).ok();
        writer.await.unwrap();

        let mut reader = FrameReader::new(right);
        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some("{}"));
        assert_eq!(reader.next_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_reader_reports_garbage() {
        let (mut left, right) = UnixStream::pair().unwrap();
        left.write_all(b"{\"cmd\":\"nope\"}\n").await.unwrap();
        drop(left);

        let mut reader = FrameReader::new(right);
        assert!(matches!(
            reader.next_message().await,
            Err(PoolError::Protocol(_))
        ));
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// However the byte stream is chunked, the same frames come out.
            #[test]
            fn framing_ignores_chunk_boundaries(
                lines in proptest::collection::vec("[a-z{}\":,0-9]{1,40}", 1..12),
                cuts in proptest::collection::vec(0usize..400, 0..10),
            ) {
                let stream: Vec<u8> = lines.iter().flat_map(|l| format!("{}\n", l).into_bytes()).collect();
                let mut cuts: Vec<usize> = cuts.into_iter().map(|c| c % (stream.len() + 1)).collect();
                cuts.sort_unstable();

                let mut framer = LineFramer::new();
                let mut frames = Vec::new();
                let mut last = 0;
                for cut in cuts.into_iter().chain(std::iter::once(stream.len())) {
                    frames.extend(super::frames(&mut framer, &stream[last..cut]));
                    last = cut;
                }
                prop_assert_eq!(frames, lines);
                prop_assert_eq!(framer.pending(), 0);
            }
        }
    }
}
