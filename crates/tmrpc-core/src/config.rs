//! Client configuration.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::RpcError;

/// Which chain the client expects to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkKind {
    #[default]
    TestNet,
    ProdNet,
    TmpTestNet,
}

impl NetworkKind {
    /// Chain id reported by nodes of this network.
    pub fn chain_id(&self) -> &'static str {
        match self {
            Self::TestNet | Self::TmpTestNet => "Binance-Chain-Ganges",
            Self::ProdNet => "Binance-Chain-Tigris",
        }
    }

    /// Bech32 human-readable prefix of account addresses on this network.
    pub fn address_hrp(&self) -> &'static str {
        match self {
            Self::TestNet | Self::TmpTestNet => "tbnb",
            Self::ProdNet => "bnb",
        }
    }
}

impl FromStr for NetworkKind {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "testnet" | "test" => Ok(Self::TestNet),
            "prodnet" | "prod" | "mainnet" => Ok(Self::ProdNet),
            "tmptestnet" | "tmp" => Ok(Self::TmpTestNet),
            other => Err(RpcError::InvalidArgument(format!("unknown network: {other}"))),
        }
    }
}

impl std::fmt::Display for NetworkKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TestNet => write!(f, "testnet"),
            Self::ProdNet => write!(f, "prodnet"),
            Self::TmpTestNet => write!(f, "tmptestnet"),
        }
    }
}

/// Configuration shared by every call made through one client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Per-call timeout for calls issued after construction (see `set_timeout`).
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Upper bound for a single connection attempt.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Pause between connection probes while a call waits for the peer.
    #[serde(default = "default_probe_interval_ms")]
    pub connect_probe_interval_ms: u64,
    /// Keep probing an unreachable peer until the call's deadline, instead
    /// of failing on the first refused connection.
    #[serde(default = "bool_true")]
    pub wait_for_connection: bool,
    /// Event buffer depth used when a subscriber passes no capacity.
    #[serde(default = "default_buffer_capacity")]
    pub default_buffer_capacity: usize,
    /// Expected network.
    #[serde(default)]
    pub network: NetworkKind,
}

fn default_request_timeout_ms() -> u64 { 5_000 }
fn default_connect_timeout_ms() -> u64 { 5_000 }
fn default_probe_interval_ms() -> u64 { 200 }
fn default_buffer_capacity() -> usize { 100 }
fn bool_true() -> bool { true }

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            connect_probe_interval_ms: default_probe_interval_ms(),
            wait_for_connection: true,
            default_buffer_capacity: default_buffer_capacity(),
            network: NetworkKind::default(),
        }
    }
}

impl ClientConfig {
    /// Load a JSON config file; missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, RpcError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            RpcError::InvalidArgument(format!("cannot read config {}: {e}", path.display()))
        })?;
        let config: Self = serde_json::from_str(&content)?;
        tracing::debug!(path = %path.display(), network = %config.network, "loaded client config");
        Ok(config)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_network(mut self, network: NetworkKind) -> Self {
        self.network = network;
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn connect_probe_interval(&self) -> Duration {
        Duration::from_millis(self.connect_probe_interval_ms.max(1))
    }
}
