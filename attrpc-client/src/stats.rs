//! Per-session counters.

/// Counters kept by an [`RpcClient`](crate::RpcClient).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientStats {
    /// Requests written to the link.
    pub requests: u64,
    /// Replies matched to their request.
    pub replies: u64,
    /// Complete frames dropped because their id matched no pending request.
    pub correlation_misses: u64,
    /// Requests that reached their deadline.
    pub timeouts: u64,
    /// Frames or fragments discarded as malformed or oversized.
    pub framing_errors: u64,
    /// Fragments received from the link.
    pub fragments: u64,
}
