//! Correlated request/response over a link.

use crate::config::RpcConfig;
use crate::error::ClientError;
use crate::stats::ClientStats;
use attrpc_link::{Link, LinkError};
use attrpc_protocol::{frame, CorrelationId, Envelope, IdAllocator, Reassembler, Reassembly};
use bytes::Bytes;
use std::time::Duration;
use tokio::time::Instant;

/// The request currently waiting for its reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingRequest {
    pub id: CorrelationId,
    pub deadline: Instant,
}

/// A reply matched to its request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Correlation id shared by the request and this reply.
    pub id: CorrelationId,
    /// The decoded reply message, envelope included.
    pub payload: Bytes,
}

/// RPC client over an exclusively owned link.
///
/// Every call takes `&mut self`, so at most one request is outstanding.
pub struct RpcClient<L> {
    link: L,
    envelope: Box<dyn Envelope + Send + Sync>,
    ids: IdAllocator,
    reassembler: Reassembler,
    request_timeout: Duration,
    pending: Option<PendingRequest>,
    broken: bool,
    stats: ClientStats,
}

impl<L: Link> RpcClient<L> {
    /// Wraps a link that is connected, negotiated and has delivery enabled.
    pub fn new(link: L, config: &RpcConfig) -> Self {
        Self {
            link,
            envelope: config.envelope.build(),
            ids: IdAllocator::new(),
            reassembler: Reassembler::with_max_frame_size(config.max_frame_size),
            request_timeout: config.request_timeout(),
            pending: None,
            broken: false,
            stats: ClientStats::default(),
        }
    }

    /// Replaces the envelope layout.
    pub fn with_envelope(mut self, envelope: Box<dyn Envelope + Send + Sync>) -> Self {
        self.envelope = envelope;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sends `payload` and waits for the reply carrying the same id.
    ///
    /// Replies for other ids are counted as correlation misses and dropped.
    /// A transport failure breaks the session; other errors fail this
    /// request only.
    pub async fn send(&mut self, payload: &[u8]) -> Result<Reply, ClientError> {
        if self.broken {
            return Err(ClientError::SessionBroken);
        }
        if !self.link.is_connected() {
            return Err(ClientError::NotConnected);
        }

        let id = self.ids.next_id();
        let sealed = self.envelope.seal(id, payload);
        let framed = frame::encode(&sealed);

        let deadline = Instant::now() + self.request_timeout;
        self.pending = Some(PendingRequest { id, deadline });
        tracing::debug!(
            "Sending request {} ({} bytes, {} framed)",
            id,
            payload.len(),
            framed.len()
        );

        if let Err(e) = self.write_frame(&framed).await {
            return Err(self.fail(e));
        }
        self.stats.requests += 1;

        self.await_reply(id, deadline).await
    }

    async fn write_frame(&mut self, framed: &[u8]) -> Result<(), LinkError> {
        let unit = self.link.unit();
        for chunk in framed.chunks(unit) {
            tracing::trace!("Writing fragment {}", hex::encode(chunk));
            self.link.write(chunk).await?;
        }
        Ok(())
    }

    async fn await_reply(
        &mut self,
        id: CorrelationId,
        deadline: Instant,
    ) -> Result<Reply, ClientError> {
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(self.time_out(id));
            }

            let fragment = match self.link.poll_delivery(deadline - now).await {
                Ok(Some(fragment)) => fragment,
                Ok(None) => continue,
                Err(LinkError::Timeout) => return Err(self.time_out(id)),
                Err(e) => return Err(self.fail(e)),
            };
            self.stats.fragments += 1;
            tracing::trace!("Received fragment {}", hex::encode(&fragment));

            let framed = match self.reassembler.push(&fragment) {
                Ok(Reassembly::Complete(framed)) => framed,
                Ok(Reassembly::Incomplete) => continue,
                Err(e) => {
                    self.stats.framing_errors += 1;
                    self.pending = None;
                    return Err(e.into());
                }
            };

            let message = match frame::decode(&framed) {
                Ok(message) => message,
                Err(e) => {
                    self.stats.framing_errors += 1;
                    self.pending = None;
                    return Err(e.into());
                }
            };

            match self.envelope.correlation_id(&message) {
                Some(reply_id) if reply_id == id => {
                    self.pending = None;
                    self.stats.replies += 1;
                    tracing::debug!("Reply {} received ({} bytes)", id, message.len());
                    return Ok(Reply {
                        id,
                        payload: message,
                    });
                }
                other => {
                    self.stats.correlation_misses += 1;
                    tracing::warn!(
                        "Dropping reply with id {:?} while waiting for {}",
                        other,
                        id
                    );
                }
            }
        }
    }

    fn time_out(&mut self, id: CorrelationId) -> ClientError {
        self.pending = None;
        self.stats.timeouts += 1;
        tracing::debug!("Request {} timed out", id);
        ClientError::Timeout
    }

    /// Clears the pending request and breaks the session on fatal errors.
    fn fail(&mut self, err: LinkError) -> ClientError {
        self.pending = None;
        if err.is_fatal() {
            tracing::warn!("Link failed, session broken: {}", err);
            self.broken = true;
        }
        if matches!(err, LinkError::Timeout) {
            self.stats.timeouts += 1;
        }
        err.into()
    }

    /// Returns the request waiting for its reply, if any.
    pub fn pending(&self) -> Option<PendingRequest> {
        self.pending
    }

    pub fn stats(&self) -> ClientStats {
        self.stats
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    /// Returns whether a transport failure has made this session unusable.
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Disconnects the link. The client cannot send afterwards.
    pub async fn close(&mut self) -> Result<(), ClientError> {
        self.pending = None;
        self.reassembler.reset();
        self.link.disconnect().await?;
        Ok(())
    }

    /// Returns the link, giving up the client.
    pub fn into_link(self) -> L {
        self.link
    }
}
