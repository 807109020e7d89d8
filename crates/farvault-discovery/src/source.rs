//! Address data source consumed by discovery
//!
//! Implementations talk to an indexer (Electrum, Esplora, a local node).
//! Failures are returned as-is; discovery does not retry.

use async_trait::async_trait;
use bitcoin::{Address, Amount, Transaction};
use std::collections::BTreeMap;

/// History summary for one address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AddressInfo {
    /// The address appears in at least one transaction
    pub used: bool,
    /// Confirmed balance
    pub balance: Amount,
}

#[async_trait]
pub trait AddressSource: Send + Sync {
    async fn fetch_address(&self, address: &Address) -> anyhow::Result<AddressInfo>;

    /// Unspent outputs paying to `address`, as (funding transaction, output index)
    async fn fetch_utxos(&self, address: &Address) -> anyhow::Result<Vec<(Transaction, u32)>>;

    /// Fee rates in sat/vB keyed by confirmation target in blocks
    async fn fetch_fee_estimates(&self) -> anyhow::Result<BTreeMap<u16, f64>>;
}
