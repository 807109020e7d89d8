//! Scanner configuration, parsed from a TOML file plus environment overrides.
//!
//! Priority: environment variables > config file > defaults.

use anyhow::{Context, Result};
use farvault_discovery::DiscoveryConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level scanner configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanConfig {
    #[serde(default)]
    pub scan: ScanSection,

    /// Bitcoin / Electrum settings
    #[serde(default)]
    pub bitcoin: BitcoinSection,

    /// Gap limits for account and address discovery
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Where the wallet seed comes from
    #[serde(default)]
    pub wallet: WalletSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanSection {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ScanSection {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

/// Bitcoin network settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BitcoinSection {
    /// Bitcoin network: "bitcoin", "testnet", "signet", "regtest"
    #[serde(default = "default_network")]
    pub network: String,

    /// Electrum server URL; the network's default server when unset
    pub electrum_url: Option<String>,
}

impl Default for BitcoinSection {
    fn default() -> Self {
        Self {
            network: default_network(),
            electrum_url: None,
        }
    }
}

/// Wallet seed source.
///
/// Prefer `mnemonic_env` over writing the mnemonic into the file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletSection {
    pub mnemonic: Option<String>,

    /// Environment variable holding the mnemonic
    #[serde(default = "default_mnemonic_env")]
    pub mnemonic_env: String,

    /// BIP-39 passphrase
    #[serde(default)]
    pub passphrase: String,
}

impl Default for WalletSection {
    fn default() -> Self {
        Self {
            mnemonic: None,
            mnemonic_env: default_mnemonic_env(),
            passphrase: String::new(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_network() -> String {
    "testnet".to_string()
}

fn default_mnemonic_env() -> String {
    "FARVAULT_MNEMONIC".to_string()
}

impl ScanConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: ScanConfig =
            toml::from_str(&contents).with_context(|| "Failed to parse TOML config")?;
        Ok(config)
    }

    /// Apply environment variable overrides.
    ///
    /// Supported env vars:
    /// - `FARVAULT_LOG_LEVEL`
    /// - `FARVAULT_NETWORK`
    /// - `FARVAULT_ELECTRUM_URL`
    /// - `FARVAULT_GAP_LIMIT`
    /// - `FARVAULT_GAP_ACCOUNT_LIMIT`
    /// - `FARVAULT_FORCE_FETCH_CHANGE`
    /// - `FARVAULT_PASSPHRASE`
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("FARVAULT_LOG_LEVEL") {
            self.scan.log_level = v;
        }
        if let Ok(v) = std::env::var("FARVAULT_NETWORK") {
            self.bitcoin.network = v;
        }
        if let Ok(v) = std::env::var("FARVAULT_ELECTRUM_URL") {
            self.bitcoin.electrum_url = Some(v);
        }
        if let Ok(v) = std::env::var("FARVAULT_GAP_LIMIT") {
            if let Ok(limit) = v.parse::<u32>() {
                self.discovery.gap_limit = limit;
            }
        }
        if let Ok(v) = std::env::var("FARVAULT_GAP_ACCOUNT_LIMIT") {
            if let Ok(limit) = v.parse::<u32>() {
                self.discovery.gap_account_limit = limit;
            }
        }
        if let Ok(v) = std::env::var("FARVAULT_FORCE_FETCH_CHANGE") {
            if let Ok(force) = v.parse::<bool>() {
                self.discovery.force_fetch_change = force;
            }
        }
        if let Ok(v) = std::env::var("FARVAULT_PASSPHRASE") {
            self.wallet.passphrase = v;
        }
    }

    /// Parse the bitcoin network string.
    pub fn network(&self) -> Result<bitcoin::Network> {
        Ok(match self.bitcoin.network.as_str() {
            "bitcoin" | "mainnet" => bitcoin::Network::Bitcoin,
            "testnet" | "testnet3" => bitcoin::Network::Testnet,
            "signet" => bitcoin::Network::Signet,
            "regtest" => bitcoin::Network::Regtest,
            other => anyhow::bail!("Unknown bitcoin.network: {}", other),
        })
    }

    /// Configured Electrum URL, or the network default
    pub fn electrum_url(&self) -> Result<String> {
        Ok(match &self.bitcoin.electrum_url {
            Some(url) => url.clone(),
            None => farvault_electrum::default_server(self.network()?).to_string(),
        })
    }

    /// The wallet mnemonic, from the file or from `wallet.mnemonic_env`.
    pub fn mnemonic(&self) -> Result<String> {
        if let Some(words) = &self.wallet.mnemonic {
            return Ok(words.clone());
        }
        std::env::var(&self.wallet.mnemonic_env).with_context(|| {
            format!(
                "No wallet.mnemonic configured and {} is not set",
                self.wallet.mnemonic_env
            )
        })
    }

    /// Validate that the configuration is usable.
    pub fn validate(&self) -> Result<()> {
        self.network()?;
        self.discovery
            .validate()
            .context("Invalid [discovery] section")?;
        anyhow::ensure!(
            !self.wallet.mnemonic_env.is_empty() || self.wallet.mnemonic.is_some(),
            "wallet.mnemonic or wallet.mnemonic_env must be set"
        );
        if let Some(url) = &self.bitcoin.electrum_url {
            anyhow::ensure!(!url.is_empty(), "bitcoin.electrum_url must not be empty");
        }
        Ok(())
    }
}
