//! The discovery engine

use crate::config::DiscoveryConfig;
use crate::source::AddressSource;
use crate::state::{Account, DiscoveryData, NetworkSnapshot};
use crate::DiscoveryError;
use bitcoin::secp256k1::{Secp256k1, VerifyOnly};
use bitcoin::{Address, Amount, Network};
use farvault_core::{DerivationPath, ExtPub, ExtPubResolver, Purpose, Utxo};
use futures::future::{join_all, try_join_all, BoxFuture, FutureExt};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Callback invoked with the network snapshot after every real change
pub type WalletChanged = Arc<dyn Fn(&NetworkSnapshot) + Send + Sync>;

type AddressKey = (ExtPub, bool, u32, Network);

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Set once any scan of an operation fails; every other scan then winds down.
type StopFlag = Arc<AtomicBool>;

/// Spawned scan of the next account, aborted if its parent is dropped
struct NextAccount(JoinHandle<Result<(), DiscoveryError>>);

impl NextAccount {
    async fn settle(&mut self) -> Result<(), DiscoveryError> {
        (&mut self.0)
            .await
            .map_err(|e| DiscoveryError::Task(e.to_string()))?
    }
}

impl Drop for NextAccount {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// First real failure, falling back to a cancellation.
fn first_failure<I>(results: I) -> Result<(), DiscoveryError>
where
    I: IntoIterator<Item = Result<(), DiscoveryError>>,
{
    let mut cancelled = None;
    for result in results {
        match result {
            Ok(()) => {}
            Err(DiscoveryError::Cancelled) => cancelled = Some(DiscoveryError::Cancelled),
            Err(e) => return Err(e),
        }
    }
    cancelled.map_or(Ok(()), Err)
}

struct Inner {
    source: Arc<dyn AddressSource>,
    keys: Arc<dyn ExtPubResolver>,
    config: DiscoveryConfig,
    secp: Secp256k1<VerifyOnly>,
    state: watch::Sender<Arc<DiscoveryData>>,
    on_change: Option<WalletChanged>,
    addresses: Mutex<HashMap<AddressKey, Address>>,
}

/// Builder for [`Discovery`]
pub struct DiscoveryBuilder {
    source: Arc<dyn AddressSource>,
    keys: Arc<dyn ExtPubResolver>,
    config: DiscoveryConfig,
    initial: DiscoveryData,
    on_change: Option<WalletChanged>,
}

impl DiscoveryBuilder {
    pub fn config(mut self, config: DiscoveryConfig) -> Self {
        self.config = config;
        self
    }

    /// Start from a previously exported snapshot
    pub fn initial_data(mut self, data: DiscoveryData) -> Self {
        self.initial = data;
        self
    }

    pub fn on_wallet_changed<F>(mut self, callback: F) -> Self
    where
        F: Fn(&NetworkSnapshot) + Send + Sync + 'static,
    {
        self.on_change = Some(Arc::new(callback));
        self
    }

    pub fn build(self) -> Result<Discovery, DiscoveryError> {
        self.config.validate()?;
        let (state, _) = watch::channel(Arc::new(self.initial));
        Ok(Discovery {
            inner: Arc::new(Inner {
                source: self.source,
                keys: self.keys,
                config: self.config,
                secp: Secp256k1::verification_only(),
                state,
                on_change: self.on_change,
                addresses: Mutex::new(HashMap::new()),
            }),
        })
    }
}

/// Cheaply clonable handle to one discovery engine
#[derive(Clone)]
pub struct Discovery {
    inner: Arc<Inner>,
}

impl Discovery {
    pub fn builder(source: Arc<dyn AddressSource>, keys: Arc<dyn ExtPubResolver>) -> DiscoveryBuilder {
        DiscoveryBuilder {
            source,
            keys,
            config: DiscoveryConfig::default(),
            initial: DiscoveryData::default(),
            on_change: None,
        }
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.inner.config
    }

    /// Current snapshot of all networks
    pub fn snapshot(&self) -> Arc<DiscoveryData> {
        self.inner.state.borrow().clone()
    }

    /// Receiver woken on every snapshot change
    pub fn subscribe(&self) -> watch::Receiver<Arc<DiscoveryData>> {
        self.inner.state.subscribe()
    }

    /// Drop all memoized addresses
    pub fn clear_cache(&self) {
        self.inner
            .addresses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Address at `change/index` below `ext_pub`, memoized.
    pub fn address(
        &self,
        ext_pub: &ExtPub,
        index: u32,
        is_change: bool,
        network: Network,
    ) -> Result<Address, DiscoveryError> {
        let key = (ext_pub.clone(), is_change, index, network);
        if let Some(address) = self
            .inner
            .addresses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
        {
            return Ok(address.clone());
        }
        let address = ext_pub.address(index, is_change, network, &self.inner.secp)?;
        self.inner
            .addresses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, address.clone());
        Ok(address)
    }

    /// Swap in `update(current)` if it differs from the current value.
    fn apply<F>(&self, network: Network, update: F)
    where
        F: FnOnce(&DiscoveryData) -> DiscoveryData,
    {
        let mut changed = None;
        self.inner.state.send_if_modified(|current| {
            let next = update(current);
            if next == **current {
                return false;
            }
            let next = Arc::new(next);
            *current = next.clone();
            changed = Some(next);
            true
        });
        if let (Some(data), Some(callback)) = (changed, &self.inner.on_change) {
            if let Some(snapshot) = data.network(network) {
                callback(snapshot);
            }
        }
    }

    /// Scan all three purposes of `network`, starting at account 0.
    ///
    /// The first failure stops every other scan, and all of them have
    /// finished by the time this returns.
    pub async fn fetch(&self, network: Network) -> Result<(), DiscoveryError> {
        log::info!("Discovering accounts on {}", network);
        let stop = StopFlag::default();
        let scans = Purpose::ALL
            .iter()
            .map(|purpose| self.account_scan(network, *purpose, 0, -1, true, stop.clone()));
        first_failure(join_all(scans).await)?;
        log::info!(
            "Discovery on {} finished: {} used paths, balance {}",
            network,
            self.used_derivation_paths(network).len(),
            self.balance(network, None)
        );
        Ok(())
    }

    /// Scan one account.
    ///
    /// When `recursive`, the next account is spawned as soon as this one is
    /// seen used. Otherwise, or if this account stays unused, the next
    /// account is probed afterwards while still within `gap_account_limit`
    /// of `last_used_account` (-1 when none).
    pub fn fetch_account(
        &self,
        network: Network,
        purpose: Purpose,
        account_number: u32,
        last_used_account: i64,
        recursive: bool,
    ) -> BoxFuture<'static, Result<(), DiscoveryError>> {
        self.account_scan(
            network,
            purpose,
            account_number,
            last_used_account,
            recursive,
            StopFlag::default(),
        )
    }

    fn account_scan(
        &self,
        network: Network,
        purpose: Purpose,
        account_number: u32,
        last_used_account: i64,
        recursive: bool,
        stop: StopFlag,
    ) -> BoxFuture<'static, Result<(), DiscoveryError>> {
        let this = self.clone();
        async move {
            this.scan_account(network, purpose, account_number, last_used_account, recursive, stop)
                .await
        }
        .boxed()
    }

    async fn scan_account(
        &self,
        network: Network,
        purpose: Purpose,
        account_number: u32,
        last_used_account: i64,
        recursive: bool,
        stop: StopFlag,
    ) -> Result<(), DiscoveryError> {
        let mut next_account = None;
        let scanned = self
            .scan_branches(network, purpose, account_number, recursive, &stop, &mut next_account)
            .await;
        if matches!(scanned, Err(ref e) if !matches!(e, DiscoveryError::Cancelled)) {
            stop.store(true, Ordering::SeqCst);
        }

        // The spawned scan always runs to completion before this one returns
        let settled = match next_account.as_mut() {
            Some(next) => Some(next.settle().await),
            None => None,
        };
        let account_used = match (scanned, settled) {
            (Err(DiscoveryError::Cancelled), Some(Err(e))) => return Err(e),
            (Err(e), _) => return Err(e),
            (Ok(_), Some(result)) => return result,
            (Ok(used), None) => used,
        };

        let last_used = if account_used {
            i64::from(account_number)
        } else {
            last_used_account
        };
        if i64::from(account_number) - last_used < i64::from(self.inner.config.gap_account_limit) {
            log::debug!(
                "Probing account {}'/{}' within the account gap",
                purpose,
                account_number + 1
            );
            self.account_scan(network, purpose, account_number + 1, last_used, false, stop)
                .await?;
        }
        Ok(())
    }

    /// Walk the receive and change branches of one account.
    ///
    /// Returns whether the account is used. Fails with `Cancelled` as soon
    /// as another scan of the same operation has failed.
    async fn scan_branches(
        &self,
        network: Network,
        purpose: Purpose,
        account_number: u32,
        recursive: bool,
        stop: &StopFlag,
        next_account: &mut Option<NextAccount>,
    ) -> Result<bool, DiscoveryError> {
        let config = self.inner.config;
        let stopped = || stop.load(Ordering::SeqCst);
        let ext_pub = self
            .inner
            .keys
            .ext_pub(purpose, account_number, network)
            .await
            .map_err(DiscoveryError::Collaborator)?;

        let mut account_used = false;
        for is_change in [false, true] {
            if is_change && !account_used && !config.force_fetch_change {
                continue;
            }
            let mut unused_in_a_row = 0;
            let mut index = 0u32;
            while unused_in_a_row < config.gap_limit {
                if stopped() {
                    return Err(DiscoveryError::Cancelled);
                }
                let address = self.address(&ext_pub, index, is_change, network)?;
                let info = self
                    .inner
                    .source
                    .fetch_address(&address)
                    .await
                    .map_err(DiscoveryError::Collaborator)?;
                if stopped() {
                    return Err(DiscoveryError::Cancelled);
                }

                if !info.used {
                    if info.balance != Amount::ZERO {
                        return Err(DiscoveryError::FundedButUnused {
                            address: address.to_string(),
                            balance: info.balance,
                        });
                    }
                    unused_in_a_row += 1;
                } else {
                    unused_in_a_row = 0;
                    account_used = true;
                    let path = DerivationPath::for_network(
                        purpose,
                        network,
                        account_number,
                        is_change,
                        index,
                    )?;
                    log::debug!("{} used at {} ({})", address, path, info.balance);
                    self.apply(network, |data| {
                        data.path_found(network, &ext_pub, path, info.balance)
                    });

                    if recursive && next_account.is_none() {
                        log::info!("Account {}'/{}' is used", purpose, account_number);
                        let next = self.account_scan(
                            network,
                            purpose,
                            account_number + 1,
                            i64::from(account_number),
                            true,
                            stop.clone(),
                        );
                        *next_account = Some(NextAccount(tokio::spawn(next)));
                    }
                }
                index += 1;
            }
        }

        if account_used {
            let time = now();
            self.apply(network, |data| {
                data.account_paths_fetched(network, &ext_pub, time)
            });
        }
        Ok(account_used)
    }

    /// Fetch UTXOs of every funded path, optionally for one account only.
    pub async fn fetch_utxos(&self, network: Network, ext_pub: Option<&ExtPub>) -> Result<(), DiscoveryError> {
        let accounts: Vec<Account> = self
            .snapshot()
            .accounts(network)
            .into_iter()
            .filter(|account| ext_pub.map_or(true, |e| &account.ext_pub == e))
            .collect();
        let fetches = accounts
            .iter()
            .map(|account| self.fetch_account_utxos(network, account));
        try_join_all(fetches).await?;
        Ok(())
    }

    async fn fetch_account_utxos(&self, network: Network, account: &Account) -> Result<(), DiscoveryError> {
        let ext_pub = &account.ext_pub;
        for entry in account.funded_paths() {
            let path = entry.path;
            let address = self.address(ext_pub, path.index(), path.is_change(), network)?;
            let outputs = self
                .inner
                .source
                .fetch_utxos(&address)
                .await
                .map_err(DiscoveryError::Collaborator)?;
            log::debug!("{} has {} unspent outputs", address, outputs.len());
            for (tx, vout) in outputs {
                let utxo = Utxo::new(tx, vout, path);
                self.apply(network, |data| data.utxo_found(network, ext_pub, utxo));
            }
        }
        let time = now();
        self.apply(network, |data| {
            data.account_utxos_fetched(network, ext_pub, time)
        });
        Ok(())
    }

    // Queries over the current snapshot

    pub fn accounts(&self, network: Network) -> Vec<Account> {
        self.snapshot().accounts(network)
    }

    pub fn used_derivation_paths(&self, network: Network) -> Vec<DerivationPath> {
        self.snapshot().used_derivation_paths(network)
    }

    pub fn funded_derivation_paths(&self, network: Network) -> Vec<DerivationPath> {
        self.snapshot().funded_derivation_paths(network)
    }

    pub fn utxos(&self, network: Network, ext_pub: Option<&ExtPub>) -> Result<Vec<Utxo>, DiscoveryError> {
        self.snapshot().utxos(network, ext_pub)
    }

    pub fn network_ids(&self) -> Vec<Network> {
        self.snapshot().network_ids()
    }

    pub fn balance(&self, network: Network, ext_pub: Option<&ExtPub>) -> Amount {
        self.snapshot().balance(network, ext_pub)
    }

    /// Next free path on the default account, skipping `prereserved`.
    pub fn next_derivation_path(
        &self,
        network: Network,
        is_change: bool,
        prereserved: &[DerivationPath],
        skip: u32,
    ) -> Result<DerivationPath, DiscoveryError> {
        let used = self.used_derivation_paths(network);
        Ok(self
            .inner
            .config
            .limits()
            .next_path(&used, prereserved, is_change, skip, network)?)
    }

    /// Fee estimates from the address source
    pub async fn fee_estimates(&self) -> Result<BTreeMap<u16, f64>, DiscoveryError> {
        self.inner
            .source
            .fetch_fee_estimates()
            .await
            .map_err(DiscoveryError::Collaborator)
    }
}
