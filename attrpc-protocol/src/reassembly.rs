//! Fragment reassembly.
//!
//! The link delivers a frame in pieces no larger than its transmission unit.
//! [`Reassembler`] accumulates those pieces and reports a complete frame once
//! the buffer ends in an end marker that is not itself escaped.
//!
//! An unescaped start marker always opens a new frame: whatever was buffered
//! before it belonged to a frame whose tail never arrived and is dropped.

use crate::error::FramingError;
use crate::frame::{EOF, ESC, SOF};
use crate::DEFAULT_MAX_FRAME_SIZE;
use bytes::{Bytes, BytesMut};

/// Result of pushing a fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reassembly {
    /// A whole frame, markers included. Feed it to [`crate::frame::decode`].
    Complete(Bytes),
    /// More fragments are needed.
    Incomplete,
}

/// Accumulates fragments into frames.
pub struct Reassembler {
    buffer: BytesMut,
    max_frame_size: usize,
}

impl Reassembler {
    /// Creates a reassembler with the default maximum frame size.
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Creates a reassembler that rejects frames larger than `max_frame_size`.
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(max_frame_size.min(DEFAULT_MAX_FRAME_SIZE)),
            max_frame_size,
        }
    }

    /// Appends a fragment.
    ///
    /// On overflow the buffer is discarded so the next frame starts clean.
    pub fn push(&mut self, fragment: &[u8]) -> Result<Reassembly, FramingError> {
        let fragment = match self.last_frame_start(fragment) {
            Some(start) => {
                self.buffer.clear();
                &fragment[start..]
            }
            None => fragment,
        };

        let size = self.buffer.len() + fragment.len();
        if size > self.max_frame_size {
            self.buffer.clear();
            return Err(FramingError::Overflow {
                size,
                max: self.max_frame_size,
            });
        }

        self.buffer.extend_from_slice(fragment);

        if self.ends_with_terminator() {
            Ok(Reassembly::Complete(self.buffer.split().freeze()))
        } else {
            Ok(Reassembly::Incomplete)
        }
    }

    /// Offset of the last unescaped start marker in `fragment`, taking an
    /// escape left pending at the end of the buffer into account.
    fn last_frame_start(&self, fragment: &[u8]) -> Option<usize> {
        let mut escaped = self.trailing_escapes() % 2 == 1;
        let mut start = None;
        for (i, &byte) in fragment.iter().enumerate() {
            if escaped {
                escaped = false;
            } else if byte == ESC {
                escaped = true;
            } else if byte == SOF {
                start = Some(i);
            }
        }
        start
    }

    fn trailing_escapes(&self) -> usize {
        self.buffer.iter().rev().take_while(|&&b| b == ESC).count()
    }

    /// An end marker terminates the frame only when the run of escape bytes
    /// in front of it has even length.
    fn ends_with_terminator(&self) -> bool {
        match self.buffer.split_last() {
            Some((&EOF, rest)) => {
                let escapes = rest.iter().rev().take_while(|&&b| b == ESC).count();
                escapes % 2 == 0
            }
            _ => false,
        }
    }

    /// Number of bytes waiting for the rest of their frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Drops any partially assembled frame.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}
