//! Exclusive ATT channel over an L2CAP socket.
//!
//! The link owns the peer's ATT bearer outright: no daemon sits between the
//! socket and this code, so the link itself negotiates the MTU, enables
//! pushes on the configuration descriptor and confirms indications.

use crate::att::{
    self, error_code, opcode, Pdu, ATT_CID, CCCD_UUID16, CHARACTERISTIC_UUID16, DEFAULT_MTU,
    MAX_MTU, VALUE_HEADER_SIZE,
};
use crate::config::{AttConfig, LeAddressType};
use crate::error::{LinkError, ProtocolError, TransportError};
use crate::link::{Link, LinkState};
use bluer::l2cap::{SeqPacket, Socket, SocketAddr};
use bluer::Address;
use bytes::Bytes;
use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::time::Duration;
use tokio::time::Instant;

/// Bytes of pushes held back while requests wait for their responses.
const BACKLOG_BYTES: usize = 8 * 1024;

/// Carries one ATT PDU per send/receive.
#[allow(async_fn_in_trait)]
pub trait AttBearer {
    async fn send_pdu(&mut self, pdu: &[u8]) -> io::Result<()>;

    /// Receives one PDU into `buf`. Returns 0 once the channel is closed.
    async fn recv_pdu(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

impl AttBearer for SeqPacket {
    async fn send_pdu(&mut self, pdu: &[u8]) -> io::Result<()> {
        let sent = self.send(pdu).await?;
        if sent != pdu.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short ATT send: {} of {} bytes", sent, pdu.len()),
            ));
        }
        Ok(())
    }

    async fn recv_pdu(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.recv(buf).await
    }
}

/// ATT link to a single data characteristic.
pub struct AttLink<B = SeqPacket> {
    bearer: Option<B>,
    config: AttConfig,
    mtu: u16,
    cccd_handle: Option<u16>,
    /// Pushes that arrived while a request was waiting for its response.
    backlog: VecDeque<Bytes>,
    recv_buf: Vec<u8>,
}

impl AttLink<SeqPacket> {
    /// Opens the ATT channel to `config.address`.
    ///
    /// The whole attempt, including the retry with the alternate address
    /// kind after a refusal, is bounded by the configured connect timeout.
    pub async fn connect(config: &AttConfig) -> Result<Self, LinkError> {
        tracing::debug!(
            "Connecting ATT channel to {} ({:?})",
            config.address,
            config.address_type
        );
        let socket = establish(config, open_socket).await?;
        tracing::debug!("ATT channel to {} connected", config.address);
        Ok(Self::from_bearer(socket, config.clone()))
    }
}

async fn open_socket(address: Address, kind: LeAddressType) -> Result<SeqPacket, TransportError> {
    let socket = Socket::<SeqPacket>::new_seq_packet().map_err(TransportError::Socket)?;

    let local = SocketAddr {
        addr: Address::any(),
        addr_type: bluer::AddressType::LePublic,
        psm: 0,
        cid: ATT_CID,
    };
    socket.bind(local).map_err(TransportError::Bind)?;

    let remote = SocketAddr {
        addr: address,
        addr_type: kind.into(),
        psm: 0,
        cid: ATT_CID,
    };
    socket
        .connect(remote)
        .await
        .map_err(|e| classify_connect_error(address, e))
}

fn classify_connect_error(address: Address, err: io::Error) -> TransportError {
    if err.kind() == io::ErrorKind::ConnectionRefused {
        return TransportError::ConnectionRefused(address.to_string());
    }
    match err.raw_os_error() {
        Some(libc::ENODEV | libc::ENETUNREACH | libc::EHOSTDOWN | libc::EHOSTUNREACH) => {
            TransportError::DeviceNotFound(format!("{}: {}", address, err))
        }
        _ => TransportError::Socket(err),
    }
}

/// Runs `connect` against the configured address kind, then once against the
/// alternate kind if the first attempt was refused.
async fn establish<B, F, Fut>(config: &AttConfig, mut connect: F) -> Result<B, LinkError>
where
    F: FnMut(Address, LeAddressType) -> Fut,
    Fut: Future<Output = Result<B, TransportError>>,
{
    let deadline = Instant::now() + config.connect_timeout();

    let first = tokio::time::timeout_at(deadline, connect(config.address, config.address_type))
        .await
        .map_err(|_| LinkError::Timeout)?;

    match first {
        Ok(bearer) => Ok(bearer),
        Err(TransportError::ConnectionRefused(_)) => {
            let alternate = config.address_type.alternate();
            tracing::debug!(
                "{} refused {:?} connection, retrying as {:?}",
                config.address,
                config.address_type,
                alternate
            );
            let bearer = tokio::time::timeout_at(deadline, connect(config.address, alternate))
                .await
                .map_err(|_| LinkError::Timeout)??;
            Ok(bearer)
        }
        Err(e) => Err(e.into()),
    }
}

impl<B: AttBearer> AttLink<B> {
    /// Wraps an already connected bearer.
    pub fn from_bearer(bearer: B, config: AttConfig) -> Self {
        Self {
            bearer: Some(bearer),
            config,
            mtu: DEFAULT_MTU,
            cccd_handle: None,
            backlog: VecDeque::new(),
            recv_buf: vec![0u8; MAX_MTU as usize],
        }
    }

    /// Returns the negotiated ATT MTU.
    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    /// Returns the configuration descriptor handle once delivery is enabled.
    pub fn cccd_handle(&self) -> Option<u16> {
        self.cccd_handle
    }

    pub fn config(&self) -> &AttConfig {
        &self.config
    }

    /// Returns the bearer while the link is connected.
    pub fn bearer(&self) -> Option<&B> {
        self.bearer.as_ref()
    }

    /// Reads the current value of the data characteristic.
    pub async fn read(&mut self) -> Result<Bytes, LinkError> {
        let request = Pdu::ReadRequest {
            handle: self.config.data_handle,
        };
        match self.transact(request, opcode::READ_RSP).await? {
            Pdu::ReadResponse { value } => Ok(value),
            other => Err(mismatch(opcode::READ_RSP, &other)),
        }
    }

    async fn send(&mut self, pdu: &Pdu) -> Result<(), LinkError> {
        let bearer = self.bearer.as_mut().ok_or(LinkError::NotConnected)?;
        let bytes = pdu.encode();
        tracing::trace!("ATT tx {}", hex::encode(&bytes));
        bearer
            .send_pdu(&bytes)
            .await
            .map_err(|e| TransportError::Socket(e).into())
    }

    /// Receives the next PDU, or `None` once `deadline` passes.
    async fn recv_until(&mut self, deadline: Instant) -> Result<Option<Pdu>, LinkError> {
        let bearer = self.bearer.as_mut().ok_or(LinkError::NotConnected)?;
        let received =
            match tokio::time::timeout_at(deadline, bearer.recv_pdu(&mut self.recv_buf)).await {
                Ok(result) => result.map_err(TransportError::Socket)?,
                Err(_) => return Ok(None),
            };

        if received == 0 {
            return Err(TransportError::Socket(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "ATT channel closed by peer",
            ))
            .into());
        }

        let raw = &self.recv_buf[..received];
        tracing::trace!("ATT rx {}", hex::encode(raw));
        match Pdu::decode(raw) {
            Ok(pdu) => Ok(Some(pdu)),
            Err(e) => {
                // The peer sends no further indication until this one is confirmed.
                if raw[0] == opcode::HANDLE_VALUE_IND {
                    self.send(&Pdu::Confirmation).await?;
                }
                Err(e.into())
            }
        }
    }

    /// Sends `request` and waits for the PDU with opcode `expected`.
    ///
    /// Pushes arriving in between are queued for [`Link::poll_delivery`].
    async fn transact(&mut self, request: Pdu, expected: u8) -> Result<Pdu, LinkError> {
        let request_opcode = request.opcode();
        self.send(&request).await?;

        let deadline = Instant::now() + self.config.response_timeout();
        loop {
            let Some(pdu) = self.recv_until(deadline).await? else {
                tracing::debug!("No response to ATT request {:#04x}", request_opcode);
                return Err(LinkError::Timeout);
            };

            match pdu {
                Pdu::ErrorResponse {
                    request,
                    handle,
                    code,
                } if request == request_opcode => {
                    return Err(ProtocolError::ErrorResponse {
                        request,
                        handle,
                        code,
                    }
                    .into());
                }
                pdu if pdu.opcode() == expected => return Ok(pdu),
                pdu @ (Pdu::Notification { .. } | Pdu::Indication { .. }) => {
                    if let Some(value) = self.accept_push(pdu).await? {
                        self.queue_push(value);
                    }
                }
                pdu if pdu.is_request() => self.answer_peer_request(pdu).await?,
                other => return Err(mismatch(expected, &other)),
            }
        }
    }

    /// Extracts the value of a push, confirming indications.
    ///
    /// Pushes for other handles are confirmed if needed and dropped.
    async fn accept_push(&mut self, pdu: Pdu) -> Result<Option<Bytes>, LinkError> {
        let (handle, value) = match pdu {
            Pdu::Notification { handle, value } => (handle, value),
            Pdu::Indication { handle, value } => {
                self.send(&Pdu::Confirmation).await?;
                (handle, value)
            }
            _ => return Ok(None),
        };

        if handle != self.config.data_handle {
            tracing::debug!("Dropping push for foreign handle {:#06x}", handle);
            return Ok(None);
        }
        Ok(Some(value))
    }

    /// Queues a push for a later poll, dropping the oldest once the backlog
    /// holds a frame's worth of fragments.
    fn queue_push(&mut self, value: Bytes) {
        let limit = (BACKLOG_BYTES / self.unit()).max(1);
        if self.backlog.len() >= limit {
            self.backlog.pop_front();
            tracing::warn!("Push backlog full ({} fragments), dropping oldest", limit);
        }
        self.backlog.push_back(value);
    }

    /// Answers requests the peer sends us as a GATT server would.
    async fn answer_peer_request(&mut self, pdu: Pdu) -> Result<(), LinkError> {
        let reply = match pdu {
            Pdu::ExchangeMtuRequest { mtu } => {
                tracing::debug!("Peer requested MTU {}", mtu);
                Pdu::ExchangeMtuResponse { mtu: self.mtu }
            }
            other => {
                tracing::warn!("Rejecting unsupported peer request {:#04x}", other.opcode());
                Pdu::ErrorResponse {
                    request: other.opcode(),
                    handle: 0x0000,
                    code: error_code::REQUEST_NOT_SUPPORTED,
                }
            }
        };
        self.send(&reply).await
    }

    async fn resolve_cccd(&mut self) -> Result<u16, LinkError> {
        let data_handle = self.config.data_handle;
        if !self.config.discover_cccd {
            return data_handle
                .checked_add(self.config.cccd_offset)
                .ok_or_else(|| ProtocolError::DescriptorNotFound(data_handle).into());
        }

        let cccd = att::uuid16(CCCD_UUID16);
        let declaration = att::uuid16(CHARACTERISTIC_UUID16);
        let mut start = data_handle
            .checked_add(1)
            .ok_or(ProtocolError::DescriptorNotFound(data_handle))?;

        loop {
            let request = Pdu::FindInformationRequest { start, end: 0xFFFF };
            let entries = match self.transact(request, opcode::FIND_INFO_RSP).await {
                Ok(Pdu::FindInformationResponse { entries }) => entries,
                Ok(other) => return Err(mismatch(opcode::FIND_INFO_RSP, &other)),
                Err(LinkError::Protocol(ProtocolError::ErrorResponse { code, .. }))
                    if code == error_code::ATTRIBUTE_NOT_FOUND =>
                {
                    return Err(ProtocolError::DescriptorNotFound(data_handle).into());
                }
                Err(e) => return Err(e),
            };

            for (handle, uuid) in &entries {
                if *uuid == cccd {
                    tracing::debug!("Found configuration descriptor at {:#06x}", handle);
                    return Ok(*handle);
                }
                if *uuid == declaration {
                    // Next characteristic begins; ours has no descriptor.
                    return Err(ProtocolError::DescriptorNotFound(data_handle).into());
                }
            }

            match entries.last().map(|(handle, _)| *handle) {
                Some(last) if last < 0xFFFF => start = last + 1,
                _ => return Err(ProtocolError::DescriptorNotFound(data_handle).into()),
            }
        }
    }

    fn ensure_connected(&self) -> Result<(), LinkError> {
        if self.bearer.is_some() {
            Ok(())
        } else {
            Err(LinkError::NotConnected)
        }
    }
}

fn mismatch(expected: u8, actual: &Pdu) -> LinkError {
    ProtocolError::OpcodeMismatch {
        expected,
        actual: actual.opcode(),
    }
    .into()
}

impl<B: AttBearer> Link for AttLink<B> {
    fn state(&self) -> LinkState {
        if self.bearer.is_some() {
            LinkState::Connected
        } else {
            LinkState::Disconnected
        }
    }

    fn unit(&self) -> usize {
        usize::from(self.mtu) - VALUE_HEADER_SIZE
    }

    async fn negotiate_unit(&mut self, preferred: u16) -> Result<u16, LinkError> {
        self.ensure_connected()?;
        let preferred = preferred.clamp(DEFAULT_MTU, MAX_MTU);

        let request = Pdu::ExchangeMtuRequest { mtu: preferred };
        match self.transact(request, opcode::EXCHANGE_MTU_RSP).await? {
            Pdu::ExchangeMtuResponse { mtu } => {
                self.mtu = preferred.min(mtu).max(DEFAULT_MTU);
                tracing::debug!(
                    "ATT MTU agreed at {} (ours {}, peer {})",
                    self.mtu,
                    preferred,
                    mtu
                );
                Ok(self.mtu)
            }
            other => Err(mismatch(opcode::EXCHANGE_MTU_RSP, &other)),
        }
    }

    async fn enable_delivery(&mut self) -> Result<(), LinkError> {
        self.ensure_connected()?;
        let handle = self.resolve_cccd().await?;
        let value = self.config.delivery.cccd_value().to_le_bytes();

        let request = Pdu::WriteRequest {
            handle,
            value: Bytes::copy_from_slice(&value),
        };
        self.transact(request, opcode::WRITE_RSP).await?;
        self.cccd_handle = Some(handle);
        tracing::debug!(
            "Enabled {:?} delivery via descriptor {:#06x}",
            self.config.delivery,
            handle
        );
        Ok(())
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        self.ensure_connected()?;
        if bytes.len() > self.unit() {
            return Err(LinkError::PayloadTooLarge {
                size: bytes.len(),
                max: self.unit(),
            });
        }

        let request = Pdu::WriteRequest {
            handle: self.config.data_handle,
            value: Bytes::copy_from_slice(bytes),
        };
        self.transact(request, opcode::WRITE_RSP).await?;
        Ok(())
    }

    async fn poll_delivery(&mut self, timeout: Duration) -> Result<Option<Bytes>, LinkError> {
        self.ensure_connected()?;
        if let Some(value) = self.backlog.pop_front() {
            return Ok(Some(value));
        }

        let deadline = Instant::now() + timeout;
        loop {
            let Some(pdu) = self.recv_until(deadline).await? else {
                return Ok(None);
            };

            match pdu {
                pdu @ (Pdu::Notification { .. } | Pdu::Indication { .. }) => {
                    if let Some(value) = self.accept_push(pdu).await? {
                        return Ok(Some(value));
                    }
                }
                pdu if pdu.is_request() => self.answer_peer_request(pdu).await?,
                other => {
                    tracing::warn!(
                        "Ignoring unsolicited ATT PDU {:#04x} while polling",
                        other.opcode()
                    );
                }
            }
        }
    }

    async fn disconnect(&mut self) -> Result<(), LinkError> {
        if self.bearer.take().is_some() {
            tracing::debug!("ATT channel to {} closed", self.config.address);
        }
        self.backlog.clear();
        self.cccd_handle = None;
        Ok(())
    }
}
