//! Client configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via ATTRPC_CONFIG)
//! 3. Environment variables

use attrpc_link::att::{DEFAULT_MTU, MAX_MTU};
use attrpc_link::{Address, AttConfig, BusConfig, LeAddressType};
use attrpc_protocol::{EnvelopeKind, DEFAULT_MAX_FRAME_SIZE};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Which link backend a session uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// Exclusive L2CAP ATT socket.
    #[default]
    Att,
    /// BlueZ over the system D-Bus.
    Bus,
}

/// Client configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Link backend.
    pub backend: Backend,
    /// ATT socket backend configuration.
    pub att: AttConfig,
    /// Daemon-mediated backend configuration.
    pub bus: BusConfig,
    /// Request/response configuration.
    pub rpc: RpcConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("ATTRPC_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();

        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Applies environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(backend) = var("ATTRPC_BACKEND") {
            match backend.to_lowercase().as_str() {
                "att" => self.backend = Backend::Att,
                "bus" | "bluez" | "dbus" => self.backend = Backend::Bus,
                other => tracing::warn!("Ignoring unknown ATTRPC_BACKEND '{}'", other),
            }
        }

        if let Some(addr) = var("ATTRPC_ADDRESS") {
            if let Ok(parsed) = addr.parse::<Address>() {
                self.att.address = parsed;
                self.bus.address = parsed;
            }
        }

        if let Some(kind) = var("ATTRPC_ADDRESS_TYPE") {
            match kind.to_lowercase().as_str() {
                "public" => self.att.address_type = LeAddressType::Public,
                "random" => self.att.address_type = LeAddressType::Random,
                other => tracing::warn!("Ignoring unknown ATTRPC_ADDRESS_TYPE '{}'", other),
            }
        }

        if let Some(handle) = var("ATTRPC_DATA_HANDLE") {
            if let Some(parsed) = parse_handle(&handle) {
                self.att.data_handle = parsed;
            }
        }

        if let Some(uuid) = var("ATTRPC_CHARACTERISTIC") {
            if let Ok(parsed) = uuid.parse() {
                self.bus.characteristic = parsed;
            }
        }

        if let Some(adapter) = var("ATTRPC_ADAPTER") {
            self.bus.adapter = Some(adapter).filter(|a| !a.is_empty());
        }

        if let Some(timeout) = var("ATTRPC_CONNECT_TIMEOUT_MS") {
            if let Ok(ms) = timeout.parse() {
                self.att.connect_timeout_ms = ms;
                self.bus.connect_timeout_ms = ms;
            }
        }

        self.rpc.apply_overrides(var);
    }

    /// Validates the configuration of the selected backend.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.backend {
            Backend::Att => {
                if self.att.address == Address::any() {
                    return Err(ConfigError::ValidationError(
                        "att backend selected but address not set".to_string(),
                    ));
                }
                if self.att.data_handle == 0 {
                    return Err(ConfigError::ValidationError(
                        "data_handle 0x0000 is not a valid attribute handle".to_string(),
                    ));
                }
            }
            Backend::Bus => {
                if self.bus.address == Address::any() {
                    return Err(ConfigError::ValidationError(
                        "bus backend selected but address not set".to_string(),
                    ));
                }
                if self.bus.characteristic.is_nil() {
                    return Err(ConfigError::ValidationError(
                        "bus backend selected but characteristic not set".to_string(),
                    ));
                }
            }
        }

        self.rpc.validate()
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }
}

/// Accepts `0x`-prefixed hex or decimal handles.
fn parse_handle(s: &str) -> Option<u16> {
    let s = s.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

/// Request/response configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Overall deadline of one request, write included, in milliseconds.
    pub request_timeout_ms: u64,
    /// ATT MTU proposed during unit negotiation.
    pub preferred_mtu: u16,
    /// Largest reassembled reply frame in bytes.
    pub max_frame_size: usize,
    /// Where the correlation id lives in requests and replies.
    pub envelope: EnvelopeKind,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 5_000,
            preferred_mtu: 247,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            envelope: EnvelopeKind::Prefixed,
        }
    }
}

impl RpcConfig {
    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(timeout) = var("ATTRPC_REQUEST_TIMEOUT_MS") {
            if let Ok(ms) = timeout.parse() {
                self.request_timeout_ms = ms;
            }
        }

        if let Some(mtu) = var("ATTRPC_PREFERRED_MTU") {
            if let Ok(n) = mtu.parse() {
                self.preferred_mtu = n;
            }
        }

        if let Some(size) = var("ATTRPC_MAX_FRAME_SIZE") {
            if let Ok(n) = size.parse() {
                self.max_frame_size = n;
            }
        }

        if let Some(envelope) = var("ATTRPC_ENVELOPE") {
            match envelope.to_lowercase().as_str() {
                "prefixed" => self.envelope = EnvelopeKind::Prefixed,
                "varint" | "protobuf" => self.envelope = EnvelopeKind::Varint,
                other => tracing::warn!("Ignoring unknown ATTRPC_ENVELOPE '{}'", other),
            }
        }
    }

    /// Returns the request timeout as Duration.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Validates request/response settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "request_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if !(DEFAULT_MTU..=MAX_MTU).contains(&self.preferred_mtu) {
            return Err(ConfigError::ValidationError(format!(
                "preferred_mtu {} outside {}..={}",
                self.preferred_mtu, DEFAULT_MTU, MAX_MTU
            )));
        }
        // Smallest frame is the two markers.
        if self.max_frame_size < 2 {
            return Err(ConfigError::ValidationError(format!(
                "max_frame_size {} cannot hold a frame",
                self.max_frame_size
            )));
        }
        Ok(())
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use uuid::Uuid;

    fn overrides(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.backend, Backend::Att);
        assert_eq!(config.rpc.request_timeout(), Duration::from_secs(5));
        assert_eq!(config.rpc.preferred_mtu, 247);
        assert_eq!(config.rpc.max_frame_size, DEFAULT_MAX_FRAME_SIZE);
        assert_eq!(config.rpc.envelope, EnvelopeKind::Prefixed);
        assert!(config.rpc.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_overrides(overrides(&[
            ("ATTRPC_BACKEND", "bus"),
            ("ATTRPC_ADDRESS", "C0:FF:EE:00:11:22"),
            ("ATTRPC_ADDRESS_TYPE", "random"),
            ("ATTRPC_DATA_HANDLE", "0x0021"),
            (
                "ATTRPC_CHARACTERISTIC",
                "6e400003-b5a3-f393-e0a9-e50e24dcca9e",
            ),
            ("ATTRPC_ADAPTER", "hci1"),
            ("ATTRPC_CONNECT_TIMEOUT_MS", "2500"),
            ("ATTRPC_REQUEST_TIMEOUT_MS", "750"),
            ("ATTRPC_PREFERRED_MTU", "185"),
            ("ATTRPC_MAX_FRAME_SIZE", "4096"),
            ("ATTRPC_ENVELOPE", "varint"),
        ]));

        assert_eq!(config.backend, Backend::Bus);
        assert_eq!(config.att.address.to_string(), "C0:FF:EE:00:11:22");
        assert_eq!(config.bus.address, config.att.address);
        assert_eq!(config.att.address_type, LeAddressType::Random);
        assert_eq!(config.att.data_handle, 0x0021);
        assert_eq!(
            config.bus.characteristic,
            Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e)
        );
        assert_eq!(config.bus.adapter.as_deref(), Some("hci1"));
        assert_eq!(config.att.connect_timeout_ms, 2500);
        assert_eq!(config.bus.connect_timeout_ms, 2500);
        assert_eq!(config.rpc.request_timeout(), Duration::from_millis(750));
        assert_eq!(config.rpc.preferred_mtu, 185);
        assert_eq!(config.rpc.max_frame_size, 4096);
        assert_eq!(config.rpc.envelope, EnvelopeKind::Varint);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_overrides_ignored() {
        let mut config = Config::default();
        config.apply_overrides(overrides(&[
            ("ATTRPC_BACKEND", "carrier-pigeon"),
            ("ATTRPC_ADDRESS", "not-an-address"),
            ("ATTRPC_DATA_HANDLE", "0xzz"),
            ("ATTRPC_PREFERRED_MTU", "lots"),
        ]));

        assert_eq!(config.backend, Backend::Att);
        assert_eq!(config.att.address, Address::any());
        assert_eq!(config.att.data_handle, AttConfig::default().data_handle);
        assert_eq!(config.rpc.preferred_mtu, 247);
    }

    #[test]
    fn test_parse_handle() {
        assert_eq!(parse_handle("0x000e"), Some(0x000e));
        assert_eq!(parse_handle("0X1F"), Some(0x1f));
        assert_eq!(parse_handle("42"), Some(42));
        assert_eq!(parse_handle("0x10000"), None);
        assert_eq!(parse_handle(""), None);
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));

        config.att.address = "C0:FF:EE:00:11:22".parse().unwrap();
        assert!(config.validate().is_ok());

        config.rpc.preferred_mtu = 12;
        assert!(config.validate().is_err());
        config.rpc.preferred_mtu = 247;

        config.rpc.request_timeout_ms = 0;
        assert!(config.validate().is_err());
        config.rpc.request_timeout_ms = 1000;

        config.backend = Backend::Bus;
        config.bus.address = config.att.address;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("characteristic"));
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("attrpc.yaml");

        let mut config = Config::default();
        config.backend = Backend::Bus;
        config.bus.address = "12:34:56:78:9A:BC".parse().unwrap();
        config.bus.characteristic = Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e);
        config.rpc.envelope = EnvelopeKind::Varint;
        config.save(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.backend, Backend::Bus);
        assert_eq!(loaded.bus.address, config.bus.address);
        assert_eq!(loaded.bus.characteristic, config.bus.characteristic);
        assert_eq!(loaded.rpc.envelope, EnvelopeKind::Varint);
    }

    #[test]
    fn test_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.yaml");
        std::fs::write(
            &path,
            "att:\n  address: \"AA:BB:CC:DD:EE:FF\"\n  data_handle: 42\nrpc:\n  request_timeout_ms: 1500\n",
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.att.data_handle, 42);
        assert_eq!(config.att.cccd_offset, 1);
        assert_eq!(config.rpc.request_timeout(), Duration::from_millis(1500));
        assert_eq!(config.rpc.preferred_mtu, 247);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_and_malformed_files() {
        let dir = tempfile::tempdir().unwrap();

        let missing = Config::from_file(dir.path().join("absent.yaml")).unwrap_err();
        assert!(matches!(missing, ConfigError::IoError(_, _)));

        let path = dir.path().join("broken.yaml");
        std::fs::write(&path, "att: [not, a, map]\n").unwrap();
        let broken = Config::from_file(&path).unwrap_err();
        assert!(matches!(broken, ConfigError::ParseError(_, _)));
        assert!(broken.to_string().contains("broken.yaml"));
    }
}
