//! Correlation ids.

/// Identifier echoed by the peer in the reply to a request.
pub type CorrelationId = u32;

/// Reserved id: carried by unsolicited messages that answer no request.
pub const NO_CORRELATION: CorrelationId = 0;

/// Hands out correlation ids for one session.
///
/// Ids start at 1, increase by one per request and wrap around on overflow,
/// skipping [`NO_CORRELATION`].
#[derive(Debug, Clone)]
pub struct IdAllocator {
    next: CorrelationId,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self { next: 1 }
    }

    /// Starts allocation at `first` (0 is bumped to 1).
    pub fn starting_at(first: CorrelationId) -> Self {
        Self {
            next: first.max(1),
        }
    }

    /// Returns the next id.
    pub fn next_id(&mut self) -> CorrelationId {
        let id = self.next;
        self.next = match self.next.wrapping_add(1) {
            NO_CORRELATION => 1,
            n => n,
        };
        id
    }

    /// Returns the id the next call to [`next_id`](Self::next_id) will hand out.
    pub fn peek(&self) -> CorrelationId {
        self.next
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}
