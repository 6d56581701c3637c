//! Engine configuration: network selection, Electrum server pools and the
//! persisted config record.

use std::fmt;
use std::str::FromStr;

use rand::rngs::OsRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::WalletError;

/// Storage key for the engine configuration record.
pub const CONFIG_STORAGE_KEY: &str = "config";

/// Default Electrum server pools per network.
/// When no custom electrum_url is configured, a random server is selected
/// per connection.
pub const MAINNET_ELECTRUM_SERVERS: &[&str] = &[
    "ssl://electrum.blockstream.info:50002",
    "ssl://electrum.bitaroo.net:50002",
    "ssl://electrum.emzy.de:50002",
];

pub const TESTNET4_ELECTRUM_SERVERS: &[&str] = &[
    "ssl://mempool.space:40002",
    "ssl://electrum.blockstream.info:60002",
];

/// Signet has no default servers and requires an explicit electrum_url.
pub const SIGNET_ELECTRUM_SERVERS: &[&str] = &[];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Mainnet,
    Testnet4,
    Signet,
}

impl Network {
    /// Chain parameters for address encoding and key versions.
    /// Testnet4 uses the same address format as testnet3 (tb1... addresses).
    pub fn chain_params(self) -> bitcoin::Network {
        match self {
            Network::Mainnet => bitcoin::Network::Bitcoin,
            Network::Testnet4 => bitcoin::Network::Testnet,
            Network::Signet => bitcoin::Network::Signet,
        }
    }

    /// BIP44 coin type: 0 for mainnet, 1 for all test networks.
    pub fn coin_type(self) -> u32 {
        match self {
            Network::Mainnet => 0,
            Network::Testnet4 | Network::Signet => 1,
        }
    }

    pub fn default_servers(self) -> &'static [&'static str] {
        match self {
            Network::Mainnet => MAINNET_ELECTRUM_SERVERS,
            Network::Testnet4 => TESTNET4_ELECTRUM_SERVERS,
            Network::Signet => SIGNET_ELECTRUM_SERVERS,
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Network::Mainnet => "mainnet",
            Network::Testnet4 => "testnet4",
            Network::Signet => "signet",
        };
        f.write_str(s)
    }
}

impl FromStr for Network {
    type Err = WalletError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mainnet" => Ok(Network::Mainnet),
            "testnet4" => Ok(Network::Testnet4),
            "signet" => Ok(Network::Signet),
            other => Err(WalletError::InvalidInput(format!(
                "unknown network: {} (supported: mainnet, testnet4, signet)",
                other
            ))),
        }
    }
}

/// Persisted engine configuration (storage key `config`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub electrum_url: Option<String>,
    pub network: Network,
    pub min_confirmations: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            electrum_url: None,
            network: Network::Mainnet,
            min_confirmations: 1,
        }
    }
}

/// Pick a random server from the pool for the given network.
/// Uses the OS CSPRNG; `gen_range` avoids modulo bias.
pub fn random_server(network: Network) -> Option<&'static str> {
    let servers = network.default_servers();
    if servers.is_empty() {
        return None;
    }
    let idx = OsRng.gen_range(0..servers.len());
    Some(servers[idx])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_parsing() {
        assert_eq!("mainnet".parse::<Network>().unwrap(), Network::Mainnet);
        assert_eq!("testnet4".parse::<Network>().unwrap(), Network::Testnet4);
        assert_eq!("signet".parse::<Network>().unwrap(), Network::Signet);
        assert!("regtest".parse::<Network>().is_err());
    }

    #[test]
    fn test_testnet4_shares_testnet3_params() {
        assert_eq!(Network::Testnet4.chain_params(), bitcoin::Network::Testnet);
        assert_eq!(Network::Testnet4.coin_type(), 1);
        assert_eq!(Network::Mainnet.coin_type(), 0);
    }

    #[test]
    fn test_random_server_selection() {
        for _ in 0..16 {
            let server = random_server(Network::Mainnet).unwrap();
            assert!(MAINNET_ELECTRUM_SERVERS.contains(&server));
        }
        assert!(random_server(Network::Signet).is_none());
    }

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.network, Network::Mainnet);
        assert_eq!(config.min_confirmations, 1);
        assert!(config.electrum_url.is_none());
    }
}
