//! Discovery snapshot and its update functions
//!
//! All update functions take the current value and return a new one. Paths
//! and UTXOs, once recorded, are never removed; a balance may drop to zero
//! but the path stays used.

use crate::DiscoveryError;
use bitcoin::{Amount, Network, OutPoint};
use farvault_core::{DerivationPath, ExtPub, Utxo};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Serde helper for Amount
mod amount_serde {
    use bitcoin::Amount;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(amount: &Amount, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(amount.to_sat())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Amount, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sats = u64::deserialize(deserializer)?;
        Ok(Amount::from_sat(sats))
    }
}

/// A used path and what is known about it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathEntry {
    pub path: DerivationPath,
    /// Last known confirmed balance
    #[serde(with = "amount_serde")]
    pub balance: Amount,
    /// Absent until UTXOs were fetched for this path
    pub utxos: Option<BTreeMap<OutPoint, Utxo>>,
}

/// One extended public key with at least one used address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub ext_pub: ExtPub,
    pub paths: BTreeMap<DerivationPath, PathEntry>,
    pub paths_being_fetched: bool,
    pub utxos_being_fetched: bool,
    /// Unix time of the last completed path scan
    pub paths_fetch_time: Option<u64>,
    /// Unix time of the last completed UTXO fetch
    pub utxos_fetch_time: Option<u64>,
}

impl Account {
    fn new(ext_pub: ExtPub) -> Self {
        Self {
            ext_pub,
            paths: BTreeMap::new(),
            paths_being_fetched: false,
            utxos_being_fetched: false,
            paths_fetch_time: None,
            utxos_fetch_time: None,
        }
    }

    pub fn balance(&self) -> Amount {
        self.paths.values().map(|entry| entry.balance).sum()
    }

    pub fn funded_paths(&self) -> impl Iterator<Item = &PathEntry> {
        self.paths.values().filter(|entry| entry.balance > Amount::ZERO)
    }
}

/// Everything discovered on one network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSnapshot {
    pub network: Network,
    pub accounts: BTreeMap<ExtPub, Account>,
}

impl NetworkSnapshot {
    fn new(network: Network) -> Self {
        Self {
            network,
            accounts: BTreeMap::new(),
        }
    }
}

/// Discovery results for every network
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryData {
    pub networks: BTreeMap<Network, NetworkSnapshot>,
}

impl DiscoveryData {
    pub fn network(&self, network: Network) -> Option<&NetworkSnapshot> {
        self.networks.get(&network)
    }

    fn account_mut(&mut self, network: Network, ext_pub: &ExtPub) -> &mut Account {
        self.networks
            .entry(network)
            .or_insert_with(|| NetworkSnapshot::new(network))
            .accounts
            .entry(ext_pub.clone())
            .or_insert_with(|| Account::new(ext_pub.clone()))
    }

    fn existing_account_mut(&mut self, network: Network, ext_pub: &ExtPub) -> Option<&mut Account> {
        self.networks
            .get_mut(&network)
            .and_then(|snapshot| snapshot.accounts.get_mut(ext_pub))
    }

    // Updates

    /// Record a used path and its current balance.
    pub fn path_found(
        &self,
        network: Network,
        ext_pub: &ExtPub,
        path: DerivationPath,
        balance: Amount,
    ) -> DiscoveryData {
        let mut next = self.clone();
        let account = next.account_mut(network, ext_pub);
        account.paths_being_fetched = true;
        account
            .paths
            .entry(path)
            .and_modify(|entry| entry.balance = balance)
            .or_insert(PathEntry {
                path,
                balance,
                utxos: None,
            });
        next
    }

    /// Mark the path scan of an account as complete.
    pub fn account_paths_fetched(&self, network: Network, ext_pub: &ExtPub, time: u64) -> DiscoveryData {
        let mut next = self.clone();
        if let Some(account) = next.existing_account_mut(network, ext_pub) {
            account.paths_being_fetched = false;
            account.paths_fetch_time = Some(time);
        }
        next
    }

    /// Record one unspent output of a used path.
    pub fn utxo_found(&self, network: Network, ext_pub: &ExtPub, utxo: Utxo) -> DiscoveryData {
        let mut next = self.clone();
        let account = next.account_mut(network, ext_pub);
        account.utxos_being_fetched = true;
        let path = utxo.path;
        let entry = account.paths.entry(path).or_insert(PathEntry {
            path,
            balance: Amount::ZERO,
            utxos: None,
        });
        entry
            .utxos
            .get_or_insert_with(BTreeMap::new)
            .insert(utxo.outpoint(), utxo);
        next
    }

    /// Mark the UTXO fetch of an account as complete.
    pub fn account_utxos_fetched(&self, network: Network, ext_pub: &ExtPub, time: u64) -> DiscoveryData {
        let mut next = self.clone();
        if let Some(account) = next.existing_account_mut(network, ext_pub) {
            account.utxos_being_fetched = false;
            account.utxos_fetch_time = Some(time);
        }
        next
    }

    // Queries

    pub fn accounts(&self, network: Network) -> Vec<Account> {
        self.network(network)
            .map(|snapshot| snapshot.accounts.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn network_ids(&self) -> Vec<Network> {
        self.networks.keys().copied().collect()
    }

    /// Every used path on `network`, sorted
    pub fn used_derivation_paths(&self, network: Network) -> Vec<DerivationPath> {
        let mut paths: Vec<DerivationPath> = self
            .network(network)
            .into_iter()
            .flat_map(|snapshot| snapshot.accounts.values())
            .flat_map(|account| account.paths.keys().copied())
            .collect();
        paths.sort();
        paths
    }

    /// Used paths with a positive balance, sorted
    pub fn funded_derivation_paths(&self, network: Network) -> Vec<DerivationPath> {
        let mut paths: Vec<DerivationPath> = self
            .network(network)
            .into_iter()
            .flat_map(|snapshot| snapshot.accounts.values())
            .flat_map(|account| account.funded_paths().map(|entry| entry.path))
            .collect();
        paths.sort();
        paths
    }

    /// Confirmed balance of one account or of the whole network
    pub fn balance(&self, network: Network, ext_pub: Option<&ExtPub>) -> Amount {
        self.network(network)
            .into_iter()
            .flat_map(|snapshot| snapshot.accounts.values())
            .filter(|account| ext_pub.map_or(true, |e| &account.ext_pub == e))
            .map(Account::balance)
            .sum()
    }

    /// Fetched UTXOs of one account or of the whole network.
    ///
    /// Fails if any selected account never completed a UTXO fetch.
    pub fn utxos(&self, network: Network, ext_pub: Option<&ExtPub>) -> Result<Vec<Utxo>, DiscoveryError> {
        let mut utxos = Vec::new();
        let accounts = self
            .network(network)
            .into_iter()
            .flat_map(|snapshot| snapshot.accounts.values())
            .filter(|account| ext_pub.map_or(true, |e| &account.ext_pub == e));
        for account in accounts {
            if account.utxos_fetch_time.is_none() {
                return Err(DiscoveryError::NotYetRetrieved(account.ext_pub.clone()));
            }
            for entry in account.paths.values() {
                if let Some(found) = &entry.utxos {
                    utxos.extend(found.values().cloned());
                }
            }
        }
        Ok(utxos)
    }
}
