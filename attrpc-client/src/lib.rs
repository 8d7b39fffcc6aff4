//! # attrpc-client
//!
//! Client library for attrpc.
//!
//! This crate provides:
//! - [`RpcClient`]: one correlated request at a time over a [`Link`](attrpc_link::Link)
//! - Session opening with runtime backend selection
//! - YAML and environment configuration
//! - Per-session counters

pub mod client;
pub mod config;
pub mod error;
pub mod session;
pub mod stats;

pub use client::{PendingRequest, Reply, RpcClient};
pub use config::{Backend, Config, ConfigError, RpcConfig};
pub use error::ClientError;
pub use session::open;
pub use stats::ClientStats;
