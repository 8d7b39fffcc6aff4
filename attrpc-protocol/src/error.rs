//! Framing error types.

use thiserror::Error;

/// Errors produced while decoding or reassembling frames.
///
/// A framing error only fails the request it occurred in; the session that
/// produced it stays usable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FramingError {
    #[error("frame too short: {len} bytes (need at least 2)")]
    Truncated { len: usize },

    #[error("missing end marker: frame ends with {0:#04x}")]
    MissingTerminator(u8),

    #[error("escape byte with nothing to escape before end marker")]
    DanglingEscape,

    #[error("frame overflow: {size} bytes buffered (max {max})")]
    Overflow { size: usize, max: usize },
}
