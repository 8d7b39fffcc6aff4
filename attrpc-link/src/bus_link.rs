//! Link mediated by the BlueZ daemon over the system D-Bus.
//!
//! The daemon owns the LE connection and the MTU exchange. Writes become
//! `WriteValue` calls and deliveries arrive as changes of the
//! characteristic's `Value` property.

use crate::att::{DEFAULT_MTU, MAX_MTU, VALUE_HEADER_SIZE};
use crate::config::BusConfig;
use crate::error::{LinkError, TransportError};
use crate::link::{Link, LinkState};
use bluer::gatt::remote::{Characteristic, Service};
use bluer::{Adapter, Device, Session};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Values pushed by the daemon for one characteristic.
pub type ValueStream = Pin<Box<dyn Stream<Item = Vec<u8>> + Send>>;

/// Daemon calls on a resolved characteristic.
///
/// [`DaemonEndpoint`] forwards these to BlueZ.
#[allow(async_fn_in_trait)]
pub trait GattEndpoint {
    /// The `MTU` property of the characteristic.
    async fn mtu(&mut self) -> Result<usize, LinkError>;

    /// `WriteValue` with a response.
    async fn write_value(&mut self, value: &[u8]) -> Result<(), LinkError>;

    /// Starts notifications or indications. Dropping the stream stops them.
    async fn subscribe(&mut self) -> Result<ValueStream, LinkError>;

    /// Asks the daemon to drop the device connection.
    async fn release(&mut self) -> Result<(), LinkError>;
}

/// A characteristic resolved through BlueZ.
pub struct DaemonEndpoint {
    // Keeps the D-Bus connection alive for the objects below.
    _session: Session,
    device: Device,
    characteristic: Characteristic,
}

impl GattEndpoint for DaemonEndpoint {
    async fn mtu(&mut self) -> Result<usize, LinkError> {
        Ok(self.characteristic.mtu().await?)
    }

    async fn write_value(&mut self, value: &[u8]) -> Result<(), LinkError> {
        Ok(self.characteristic.write(value).await?)
    }

    async fn subscribe(&mut self) -> Result<ValueStream, LinkError> {
        let stream = self.characteristic.notify().await?;
        Ok(Box::pin(stream))
    }

    async fn release(&mut self) -> Result<(), LinkError> {
        Ok(self.device.disconnect().await?)
    }
}

/// Link to one characteristic of a daemon-managed device.
pub struct BusLink<E = DaemonEndpoint> {
    config: BusConfig,
    endpoint: E,
    /// Installed by `enable_delivery`; dropping it stops notifications.
    values: Option<ValueStream>,
    mtu: u16,
    state: LinkState,
}

impl BusLink<DaemonEndpoint> {
    /// Resolves the device and its data characteristic through the daemon.
    pub async fn connect(config: &BusConfig) -> Result<Self, LinkError> {
        let deadline = Instant::now() + config.connect_timeout();

        let session = Session::new().await?;
        let adapter = match &config.adapter {
            Some(name) => session.adapter(name)?,
            None => session.default_adapter().await?,
        };
        tracing::debug!(
            "Resolving {} on adapter {}",
            config.address,
            adapter.name()
        );

        let device = find_device(&adapter, config).await?;

        if !device.is_connected().await? {
            tracing::debug!("Asking daemon to connect {}", config.address);
            tokio::time::timeout_at(deadline, device.connect())
                .await
                .map_err(|_| LinkError::Timeout)??;
        }
        wait_services_resolved(&device, deadline).await?;

        let characteristic = find_characteristic(device.services().await?, config).await?;
        tracing::debug!(
            "Characteristic {} resolved on {}",
            config.characteristic,
            config.address
        );

        let endpoint = DaemonEndpoint {
            _session: session,
            device,
            characteristic,
        };
        Ok(Self::from_endpoint(endpoint, config.clone()))
    }
}

impl<E: GattEndpoint> BusLink<E> {
    /// Wraps an already resolved characteristic.
    pub fn from_endpoint(endpoint: E, config: BusConfig) -> Self {
        Self {
            config,
            endpoint,
            values: None,
            mtu: DEFAULT_MTU,
            state: LinkState::Connected,
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn endpoint(&self) -> &E {
        &self.endpoint
    }

    /// Returns whether the notify subscription is installed.
    pub fn delivery_enabled(&self) -> bool {
        self.values.is_some()
    }

    fn ensure_connected(&self) -> Result<(), LinkError> {
        match self.state {
            LinkState::Connected => Ok(()),
            LinkState::Disconnected => Err(LinkError::NotConnected),
        }
    }
}

async fn find_device(adapter: &Adapter, config: &BusConfig) -> Result<Device, LinkError> {
    let known = adapter.device_addresses().await?;
    if !known.contains(&config.address) {
        return Err(TransportError::DeviceNotFound(format!(
            "{} is not known to adapter {}",
            config.address,
            adapter.name()
        ))
        .into());
    }
    Ok(adapter.device(config.address)?)
}

async fn wait_services_resolved(device: &Device, deadline: Instant) -> Result<(), LinkError> {
    const RESOLVE_POLL: Duration = Duration::from_millis(100);

    while !device.is_services_resolved().await? {
        if Instant::now() + RESOLVE_POLL > deadline {
            tracing::debug!("Services of {} not resolved in time", device.address());
            return Err(LinkError::Timeout);
        }
        tokio::time::sleep(RESOLVE_POLL).await;
    }
    Ok(())
}

/// A GATT service as seen while walking a device.
#[allow(async_fn_in_trait)]
pub(crate) trait RemoteService {
    type Characteristic: RemoteCharacteristic;

    fn id(&self) -> u16;
    async fn uuid(&self) -> Result<Uuid, LinkError>;
    async fn characteristics(&self) -> Result<Vec<Self::Characteristic>, LinkError>;
}

#[allow(async_fn_in_trait)]
pub(crate) trait RemoteCharacteristic {
    fn id(&self) -> u16;
    async fn uuid(&self) -> Result<Uuid, LinkError>;
}

impl RemoteService for Service {
    type Characteristic = Characteristic;

    fn id(&self) -> u16 {
        Service::id(self)
    }

    async fn uuid(&self) -> Result<Uuid, LinkError> {
        Ok(Service::uuid(self).await?)
    }

    async fn characteristics(&self) -> Result<Vec<Characteristic>, LinkError> {
        Ok(Service::characteristics(self).await?)
    }
}

impl RemoteCharacteristic for Characteristic {
    fn id(&self) -> u16 {
        Characteristic::id(self)
    }

    async fn uuid(&self) -> Result<Uuid, LinkError> {
        Ok(Characteristic::uuid(self).await?)
    }
}

/// Walks `services` for the configured characteristic UUID.
///
/// Objects that vanish or fail to answer mid-walk are skipped.
async fn find_characteristic<S: RemoteService>(
    services: Vec<S>,
    config: &BusConfig,
) -> Result<S::Characteristic, LinkError> {
    for service in services {
        if !service_matches(&service, config.service).await {
            continue;
        }

        let characteristics = match service.characteristics().await {
            Ok(characteristics) => characteristics,
            Err(e) => {
                tracing::debug!("Skipping service {}: {}", service.id(), e);
                continue;
            }
        };

        for characteristic in characteristics {
            match characteristic.uuid().await {
                Ok(uuid) if uuid == config.characteristic => return Ok(characteristic),
                Ok(_) => {}
                Err(e) => tracing::debug!("Skipping characteristic {}: {}", characteristic.id(), e),
            }
        }
    }

    Err(TransportError::DeviceNotFound(format!(
        "characteristic {} not found on {}",
        config.characteristic, config.address
    ))
    .into())
}

async fn service_matches<S: RemoteService>(service: &S, wanted: Option<Uuid>) -> bool {
    let Some(wanted) = wanted else {
        return true;
    };
    match service.uuid().await {
        Ok(uuid) => uuid == wanted,
        Err(e) => {
            tracing::debug!("Skipping service {}: {}", service.id(), e);
            false
        }
    }
}

/// Agreed ATT MTU given our preference and the daemon's report.
fn agreed_mtu(preferred: u16, reported: Option<usize>) -> u16 {
    let reported = reported
        .and_then(|mtu| u16::try_from(mtu).ok())
        .unwrap_or(DEFAULT_MTU);
    preferred.min(reported).clamp(DEFAULT_MTU, MAX_MTU)
}

impl<E: GattEndpoint> Link for BusLink<E> {
    fn state(&self) -> LinkState {
        self.state
    }

    fn unit(&self) -> usize {
        usize::from(self.mtu) - VALUE_HEADER_SIZE
    }

    async fn negotiate_unit(&mut self, preferred: u16) -> Result<u16, LinkError> {
        self.ensure_connected()?;
        let reported = match self.endpoint.mtu().await {
            Ok(mtu) => Some(mtu),
            Err(e) => {
                tracing::debug!("MTU property unavailable, assuming default: {}", e);
                None
            }
        };
        self.mtu = agreed_mtu(preferred, reported);
        tracing::debug!("Daemon MTU {:?}, agreed {}", reported, self.mtu);
        Ok(self.mtu)
    }

    async fn enable_delivery(&mut self) -> Result<(), LinkError> {
        self.ensure_connected()?;
        if self.values.is_some() {
            return Ok(());
        }
        self.values = Some(self.endpoint.subscribe().await?);
        tracing::debug!("Notify subscription installed on {}", self.config.characteristic);
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

        tracing::trace!("WriteValue {}", hex::encode(bytes));
        let write_timeout = self.config.write_timeout();
        tokio::time::timeout(write_timeout, self.endpoint.write_value(bytes))
            .await
            .map_err(|_| LinkError::Timeout)??;
        Ok(())
    }

    async fn poll_delivery(&mut self, timeout: Duration) -> Result<Option<Bytes>, LinkError> {
        self.ensure_connected()?;
        let values = self.values.as_mut().ok_or(LinkError::DeliveryNotEnabled)?;

        match tokio::time::timeout(timeout, values.next()).await {
            Ok(Some(value)) => {
                tracing::trace!("Value changed {}", hex::encode(&value));
                Ok(Some(Bytes::from(value)))
            }
            Ok(None) => {
                self.values = None;
                Err(TransportError::DaemonCall("notification stream ended".to_string()).into())
            }
            Err(_) => Ok(None),
        }
    }

    async fn disconnect(&mut self) -> Result<(), LinkError> {
        if self.state == LinkState::Disconnected {
            return Ok(());
        }
        self.state = LinkState::Disconnected;
        self.values = None;

        if self.config.disconnect_on_close {
            tracing::debug!("Disconnecting {}", self.config.address);
            self.endpoint.release().await?;
        }
        Ok(())
    }
}
