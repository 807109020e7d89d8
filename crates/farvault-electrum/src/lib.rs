//! FarVault Electrum Source
//!
//! Address data for discovery over the Electrum protocol:
//! - Address usage and confirmed balance (discovery scans)
//! - Unspent outputs with their funding transactions (spending)
//! - Fee estimates and transaction broadcasting
//!
//! The Electrum client is blocking, so every call runs on tokio's blocking
//! pool.
//!
//! # Example
//!
//! ```ignore
//! use farvault_electrum::{default_server, ElectrumSource};
//! use bitcoin::Network;
//!
//! let source = ElectrumSource::new(default_server(Network::Testnet), Network::Testnet)?;
//! let fees = source.fee_estimates()?;
//! println!("Next block: {:?} sat/vB", fees.get(&1));
//! ```

use async_trait::async_trait;
use bitcoin::{Address, Amount, Network, ScriptBuf, Transaction, Txid};
use electrum_client::{ElectrumApi, Error as ClientError};
use farvault_discovery::{AddressInfo, AddressSource};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// Confirmation targets queried for fee estimates
pub const FEE_TARGETS: [u16; 11] = [1, 2, 3, 4, 5, 6, 10, 20, 144, 504, 1008];

/// Errors from Electrum operations
#[derive(Error, Debug)]
pub enum ElectrumError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Electrum protocol error: {0}")]
    Protocol(#[from] ClientError),

    #[error("Transaction not found: {0}")]
    TxNotFound(Txid),

    #[error("Output {vout} missing from transaction {txid}")]
    MissingOutput { txid: Txid, vout: u32 },

    #[error("Broadcast failed: {0}")]
    BroadcastFailed(String),
}

/// Electrum-backed address data source
#[derive(Clone)]
pub struct ElectrumSource {
    client: Arc<electrum_client::Client>,
    network: Network,
}

impl ElectrumSource {
    /// Connect to an Electrum server
    ///
    /// # Security
    /// Always use SSL URLs in production. Plaintext connections can be MITM'd.
    pub fn new(url: &str, network: Network) -> Result<Self, ElectrumError> {
        if !url.starts_with("ssl://") && !url.contains("tls") {
            log::warn!("Connecting to Electrum without SSL - insecure for mainnet!");
        }

        let client = electrum_client::Client::new(url)
            .map_err(|e: ClientError| ElectrumError::Connection(e.to_string()))?;

        Ok(Self {
            client: Arc::new(client),
            network,
        })
    }

    pub fn network(&self) -> Network {
        self.network
    }

    /// Usage and confirmed balance of a script
    pub fn script_info(&self, script: &ScriptBuf) -> Result<AddressInfo, ElectrumError> {
        let history = self.client.script_get_history(script)?;
        let balance = self.client.script_get_balance(script)?;
        Ok(AddressInfo {
            used: !history.is_empty(),
            balance: Amount::from_sat(balance.confirmed),
        })
    }

    /// Unspent outputs of a script with their full funding transactions
    pub fn script_utxos(&self, script: &ScriptBuf) -> Result<Vec<(Transaction, u32)>, ElectrumError> {
        let unspent = self.client.script_list_unspent(script)?;
        let mut utxos = Vec::with_capacity(unspent.len());
        for u in unspent {
            let tx = self
                .client
                .transaction_get(&u.tx_hash)
                .map_err(|_| ElectrumError::TxNotFound(u.tx_hash))?;
            let vout = u.tx_pos as u32;
            if tx.output.get(u.tx_pos).is_none() {
                return Err(ElectrumError::MissingOutput {
                    txid: u.tx_hash,
                    vout,
                });
            }
            utxos.push((tx, vout));
        }
        Ok(utxos)
    }

    /// Fee rates in sat/vB for [`FEE_TARGETS`]; targets the server cannot
    /// estimate are left out.
    pub fn fee_estimates(&self) -> Result<BTreeMap<u16, f64>, ElectrumError> {
        let mut estimates = BTreeMap::new();
        for target in FEE_TARGETS {
            let btc_per_kvb = self.client.estimate_fee(usize::from(target))?;
            if btc_per_kvb > 0.0 {
                estimates.insert(target, btc_per_kvb_to_sat_per_vb(btc_per_kvb));
            }
        }
        Ok(estimates)
    }

    /// Broadcast a signed transaction
    pub fn broadcast(&self, tx: &Transaction) -> Result<Txid, ElectrumError> {
        self.client
            .transaction_broadcast(tx)
            .map_err(|e: ClientError| ElectrumError::BroadcastFailed(e.to_string()))
    }
}

fn btc_per_kvb_to_sat_per_vb(rate: f64) -> f64 {
    rate * 100_000.0
}

#[async_trait]
impl AddressSource for ElectrumSource {
    async fn fetch_address(&self, address: &Address) -> anyhow::Result<AddressInfo> {
        let this = self.clone();
        let script = address.script_pubkey();
        Ok(tokio::task::spawn_blocking(move || this.script_info(&script)).await??)
    }

    async fn fetch_utxos(&self, address: &Address) -> anyhow::Result<Vec<(Transaction, u32)>> {
        let this = self.clone();
        let script = address.script_pubkey();
        Ok(tokio::task::spawn_blocking(move || this.script_utxos(&script)).await??)
    }

    async fn fetch_fee_estimates(&self) -> anyhow::Result<BTreeMap<u16, f64>> {
        let this = self.clone();
        Ok(tokio::task::spawn_blocking(move || this.fee_estimates()).await??)
    }
}

/// Default Electrum servers for each network
pub fn default_server(network: Network) -> &'static str {
    match network {
        Network::Bitcoin => "ssl://electrum.blockstream.info:60002",
        Network::Testnet => "ssl://electrum.blockstream.info:60004",
        Network::Signet => "ssl://mempool.space:60602",
        Network::Regtest => "tcp://127.0.0.1:60401",
        _ => "ssl://electrum.blockstream.info:60002",
    }
}
