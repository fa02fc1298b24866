//! Newline-delimited message framing.
//!
//! Server stdout arrives in arbitrary chunks. [`FrameReader`] accumulates
//! them and hands back one parsed [`IncomingMessage`] per complete line,
//! keeping any unterminated tail for the next chunk.

use crate::error::McpError;
use crate::jsonrpc::IncomingMessage;
use bytes::{Buf, BytesMut};

/// Incremental line-delimited JSON-RPC decoder.
pub struct FrameReader {
    buffer: BytesMut,
    /// Bytes of `buffer` already known to contain no newline.
    scanned: usize,
    max_frame_len: usize,
    skipped: u64,
}

impl FrameReader {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            scanned: 0,
            max_frame_len,
            skipped: 0,
        }
    }

    /// Append a chunk of raw output.
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Return the next complete message, or `None` if more bytes are needed.
    ///
    /// Blank and unparseable lines are skipped. A line longer than the
    /// configured limit is an error; the buffer is discarded and the caller
    /// is expected to drop the connection.
    pub fn next_frame(&mut self) -> Result<Option<IncomingMessage>, McpError> {
        loop {
            let Some(offset) = self.buffer[self.scanned..].iter().position(|b| *b == b'\n')
            else {
                let held = self.buffer.len();
                self.scanned = held;
                if held > self.max_frame_len {
                    return Err(self.overflow(held));
                }
                return Ok(None);
            };

            let line_len = self.scanned + offset;
            self.scanned = 0;
            if line_len > self.max_frame_len {
                return Err(self.overflow(line_len));
            }

            let line = self.buffer.split_to(line_len);
            self.buffer.advance(1);

            let line = line.trim_ascii();
            if line.is_empty() {
                continue;
            }

            match IncomingMessage::parse(line) {
                Ok(message) => return Ok(Some(message)),
                Err(e) => {
                    self.skipped += 1;
                    tracing::warn!(
                        "Skipping malformed MCP line ({e}): {}",
                        String::from_utf8_lossy(preview(line))
                    );
                }
            }
        }
    }

    /// Drain every complete message currently buffered.
    pub fn drain(&mut self) -> Result<Vec<IncomingMessage>, McpError> {
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Number of bytes held for an incomplete line.
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    /// Number of lines dropped because they failed to parse.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    fn overflow(&mut self, len: usize) -> McpError {
        self.buffer.clear();
        self.scanned = 0;
        McpError::FrameTooLarge {
            len,
            max: self.max_frame_len,
        }
    }
}

fn preview(line: &[u8]) -> &[u8] {
    &line[..line.len().min(200)]
}
