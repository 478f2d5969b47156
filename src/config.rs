//! Node configuration.
//!
//! Loads optional `starling.toml` from the data directory. CLI flags
//! override config file values; missing sections fall back to defaults.

use std::path::Path;

use serde::Deserialize;

use crate::constants;
use crate::ids::ShortId;

/// Top-level configuration.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub network: NetworkConfig,
    pub genesis: GenesisConfig,
    pub bootstrap: BootstrapConfig,
}

/// Network-wide economic and identity parameters.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub network_id: u32,
    pub tx_fee: u64,
    pub min_stake: u64,
    pub min_staking_duration_secs: u64,
    pub max_staking_duration_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            network_id: 1,
            tx_fee: constants::DEFAULT_TX_FEE,
            min_stake: constants::DEFAULT_MIN_STAKE,
            min_staking_duration_secs: 24 * 60 * 60,
            max_staking_duration_secs: 365 * 24 * 60 * 60,
        }
    }
}

/// Initial-state parameters consumed by the genesis machinery.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct GenesisConfig {
    /// CB58 addresses holding the initial supply.
    pub funded_addresses: Vec<String>,
    /// CB58 addresses holding mint authority over the primary asset.
    pub mint_addresses: Vec<String>,
    /// CB58 node IDs of the initial stakers; these double as bootstrap
    /// beacons.
    pub staker_ids: Vec<String>,
    /// Hex-encoded genesis data for the contract chain.
    pub evm_bytes: String,
    /// Network greeting embedded in the genesis.
    pub message: String,
}

impl GenesisConfig {
    /// Staker IDs that parse; malformed entries are skipped.
    pub fn parsed_staker_ids(&self) -> Vec<ShortId> {
        self.staker_ids
            .iter()
            .filter_map(|s| match s.parse() {
                Ok(id) => Some(id),
                Err(err) => {
                    tracing::warn!(staker = %s, %err, "skipping unparseable staker id");
                    None
                }
            })
            .collect()
    }

    pub fn evm_bytes(&self) -> Vec<u8> {
        hex::decode(&self.evm_bytes).unwrap_or_default()
    }
}

/// Bootstrap engine tuning.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct BootstrapConfig {
    /// Weight threshold for the accepted-frontier vote.
    pub alpha: u64,
    /// Beacons sampled for frontier discovery.
    pub sample_size: u32,
    pub gossip_frequency_ms: u64,
    pub shutdown_timeout_ms: u64,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        BootstrapConfig {
            alpha: 1,
            sample_size: constants::DEFAULT_SAMPLE_SIZE,
            gossip_frequency_ms: constants::DEFAULT_GOSSIP_FREQUENCY_MS,
            shutdown_timeout_ms: constants::DEFAULT_SHUTDOWN_TIMEOUT_MS,
        }
    }
}

impl NodeConfig {
    /// Load configuration from `starling.toml` in the given directory.
    /// Returns defaults if the file doesn't exist or fails to parse.
    pub fn load(data_dir: &Path) -> Self {
        let config_path = data_dir.join("starling.toml");
        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => {
                    tracing::info!("loaded config from {}", config_path.display());
                    config
                }
                Err(err) => {
                    tracing::warn!(
                        "failed to parse {}: {}, using defaults",
                        config_path.display(),
                        err
                    );
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }
}
