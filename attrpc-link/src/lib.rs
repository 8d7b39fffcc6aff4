//! # attrpc-link
//!
//! Link layer for attrpc.
//!
//! This crate provides:
//! - The [`Link`] contract shared by both backends
//! - [`AttLink`]: an exclusive ATT channel over an L2CAP socket
//! - [`BusLink`]: the same contract mediated by BlueZ over D-Bus
//! - [`AnyLink`]: a backend chosen at runtime
//! - An ATT PDU codec

pub mod att;
pub mod att_link;
pub mod bus_link;
pub mod config;
pub mod error;
pub mod link;

pub use att_link::{AttBearer, AttLink};
pub use bus_link::{BusLink, DaemonEndpoint, GattEndpoint, ValueStream};
pub use config::{AttConfig, BusConfig, DeliveryKind, LeAddressType};
pub use error::{LinkError, ProtocolError, TransportError};
pub use link::{AnyLink, Link, LinkState};

pub use bluer::Address;
