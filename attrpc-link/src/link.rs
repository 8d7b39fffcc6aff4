//! The link contract shared by both backends.

use crate::att_link::AttLink;
use crate::bus_link::BusLink;
use crate::error::LinkError;
use bluer::l2cap::SeqPacket;
use bytes::Bytes;
use std::time::Duration;

/// Lifecycle of a link.
///
/// A link object only exists once its connect call has succeeded, so the
/// connecting phase is the connect future itself. A disconnected link cannot
/// be reconnected; build a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connected,
    Disconnected,
}

/// A connected, exclusively owned channel to one peer data endpoint.
///
/// Every waiting operation is bounded: request/acknowledge exchanges by the
/// backend's configured timeouts, deliveries by the caller's timeout.
#[allow(async_fn_in_trait)]
pub trait Link {
    fn state(&self) -> LinkState;

    /// Largest payload accepted by a single [`write`](Link::write).
    fn unit(&self) -> usize;

    /// Agrees on the transmission unit. Returns the agreed ATT MTU.
    async fn negotiate_unit(&mut self, preferred: u16) -> Result<u16, LinkError>;

    /// Asks the peer to start pushing data endpoint updates.
    async fn enable_delivery(&mut self) -> Result<(), LinkError>;

    /// Writes `bytes` and waits for the acknowledgment.
    async fn write(&mut self, bytes: &[u8]) -> Result<(), LinkError>;

    /// Waits up to `timeout` for the next pushed fragment.
    ///
    /// `Ok(None)` means nothing arrived in time.
    async fn poll_delivery(&mut self, timeout: Duration) -> Result<Option<Bytes>, LinkError>;

    /// Releases the channel. Calling it again is a no-op.
    async fn disconnect(&mut self) -> Result<(), LinkError>;

    fn is_connected(&self) -> bool {
        self.state() == LinkState::Connected
    }
}

/// A link whose backend is picked at runtime.
pub enum AnyLink {
    Att(AttLink<SeqPacket>),
    Bus(BusLink),
}

impl AnyLink {
    /// Returns whether this link goes through the Bluetooth daemon.
    pub fn is_mediated(&self) -> bool {
        matches!(self, AnyLink::Bus(_))
    }
}

impl From<AttLink<SeqPacket>> for AnyLink {
    fn from(link: AttLink<SeqPacket>) -> Self {
        AnyLink::Att(link)
    }
}

impl From<BusLink> for AnyLink {
    fn from(link: BusLink) -> Self {
        AnyLink::Bus(link)
    }
}

impl Link for AnyLink {
    fn state(&self) -> LinkState {
        match self {
            AnyLink::Att(link) => link.state(),
            AnyLink::Bus(link) => link.state(),
        }
    }

    fn unit(&self) -> usize {
        match self {
            AnyLink::Att(link) => link.unit(),
            AnyLink::Bus(link) => link.unit(),
        }
    }

    async fn negotiate_unit(&mut self, preferred: u16) -> Result<u16, LinkError> {
        match self {
            AnyLink::Att(link) => link.negotiate_unit(preferred).await,
            AnyLink::Bus(link) => link.negotiate_unit(preferred).await,
        }
    }

    async fn enable_delivery(&mut self) -> Result<(), LinkError> {
        match self {
            AnyLink::Att(link) => link.enable_delivery().await,
            AnyLink::Bus(link) => link.enable_delivery().await,
        }
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        match self {
            AnyLink::Att(link) => link.write(bytes).await,
            AnyLink::Bus(link) => link.write(bytes).await,
        }
    }

    async fn poll_delivery(&mut self, timeout: Duration) -> Result<Option<Bytes>, LinkError> {
        match self {
            AnyLink::Att(link) => link.poll_delivery(timeout).await,
            AnyLink::Bus(link) => link.poll_delivery(timeout).await,
        }
    }

    async fn disconnect(&mut self) -> Result<(), LinkError> {
        match self {
            AnyLink::Att(link) => link.disconnect().await,
            AnyLink::Bus(link) => link.disconnect().await,
        }
    }
}
