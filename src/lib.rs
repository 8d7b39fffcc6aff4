//! # attrpc
//!
//! Request/response RPC transport over Bluetooth LE attribute channels.
//!
//! - [`protocol`]: framing, reassembly, correlation ids, envelopes
//! - [`link`]: the link contract with ATT socket and BlueZ backends
//! - [`client`]: the correlating client, sessions and configuration

pub use attrpc_client as client;
pub use attrpc_link as link;
pub use attrpc_protocol as protocol;

pub use attrpc_client::{open, ClientError, Config, Reply, RpcClient};
pub use attrpc_link::{AnyLink, AttLink, BusLink, Link};
