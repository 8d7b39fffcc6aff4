//! # attrpc-protocol
//!
//! Framing layer for attrpc.
//!
//! This crate provides:
//! - Byte-stuffed frames with start/end markers and an escape byte
//! - Fragment reassembly bounded by a maximum frame size
//! - Correlation id allocation
//! - Request envelopes that carry the correlation id next to an opaque payload

pub mod correlation;
pub mod envelope;
pub mod error;
pub mod frame;
pub mod reassembly;

pub use correlation::{CorrelationId, IdAllocator, NO_CORRELATION};
pub use envelope::{Envelope, EnvelopeKind, PrefixedEnvelope, VarintEnvelope};
pub use error::FramingError;
pub use frame::{EOF, ESC, SOF};
pub use reassembly::{Reassembler, Reassembly};

/// Default upper bound on a reassembled frame, markers included (8 KiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 8 * 1024;
