//! Syslog line framing.
//!
//! Splits the raw TCP byte stream into newline-terminated lines, bounded by
//! `max_line_size`. A connection that accumulates more than `max_line_size`
//! bytes without a newline is torn down; nothing shorter survives of it.
//!
//! # Per-line behavior
//! - A `\r` immediately before the `\n` is stripped.
//! - Empty lines are skipped without emitting anything.
//! - Lines that are not valid UTF-8 are dropped; the connection stays up.

use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;
use tracing::debug;

/// Decoder for the inbound syslog stream.
///
/// Use with `FramedRead::with_capacity` so the read-buffer chunk size can be
/// tuned independently of the line bound.
#[derive(Debug)]
pub struct LineCodec {
    max_line_size: usize,
    // Index into the buffer where the newline scan should resume, so that
    // repeated `decode` calls on a growing buffer stay linear.
    next_index: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum LineError {
    #[error("line exceeded the maximum length of {0} bytes")]
    TooLong(usize),
    #[error("socket: {0}")]
    Io(#[from] std::io::Error),
}

impl LineCodec {
    pub fn new(max_line_size: usize) -> Self {
        LineCodec {
            max_line_size,
            next_index: 0,
        }
    }
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = LineError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<String>, LineError> {
        loop {
            match buf[self.next_index..].iter().position(|b| *b == b'\n') {
                Some(offset) => {
                    let newline_index = self.next_index + offset;
                    if newline_index > self.max_line_size {
                        return Err(LineError::TooLong(self.max_line_size));
                    }
                    let mut line = buf.split_to(newline_index + 1);
                    self.next_index = 0;
                    line.truncate(line.len() - 1);
                    if line.last() == Some(&b'\r') {
                        line.truncate(line.len() - 1);
                    }
                    if line.is_empty() {
                        continue;
                    }
                    match String::from_utf8(line.to_vec()) {
                        Ok(line) => return Ok(Some(line)),
                        Err(_) => {
                            debug!("dropping non-UTF-8 line");
                            continue;
                        }
                    }
                }
                None => {
                    if buf.len() > self.max_line_size {
                        return Err(LineError::TooLong(self.max_line_size));
                    }
                    self.next_index = buf.len();
                    return Ok(None);
                }
            }
        }
    }

    // A partial line left in the buffer at EOF is discarded, not surfaced as
    // an error; the peer hung up before terminating it.
    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<String>, LineError> {
        match self.decode(buf)? {
            Some(line) => Ok(Some(line)),
            None => {
                buf.advance(buf.len());
                self.next_index = 0;
                Ok(None)
            }
        }
    }
}
