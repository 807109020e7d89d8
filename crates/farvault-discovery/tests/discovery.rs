//! Discovery against an in-memory address source

use async_trait::async_trait;
use bitcoin::absolute::LockTime;
use bitcoin::bip32::{DerivationPath as Bip32Path, Xpriv, Xpub};
use bitcoin::secp256k1::Secp256k1;
use bitcoin::transaction::Version;
use bitcoin::{Address, Amount, Network, Transaction, TxOut};
use farvault_core::{DerivationPath, ExtPub, ExtPubResolver, Purpose};
use farvault_discovery::{AddressInfo, AddressSource, Discovery, DiscoveryConfig, DiscoveryError};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const NETWORK: Network = Network::Testnet;

/// Calls made to the collaborators, in order
#[derive(Debug, Clone, PartialEq)]
enum Event {
    Resolved(Purpose, u32),
    Lookup(String),
}

type EventLog = Arc<Mutex<Vec<Event>>>;

/// Resolves account keys from a fixed seed and records every request
struct TestKeys {
    master: Xpriv,
    requests: Mutex<Vec<(Purpose, u32)>>,
    events: EventLog,
}

impl TestKeys {
    fn new() -> Self {
        Self {
            master: Xpriv::new_master(NETWORK, &[42u8; 32]).unwrap(),
            requests: Mutex::new(Vec::new()),
            events: EventLog::default(),
        }
    }

    fn account_key(&self, purpose: Purpose, account: u32) -> ExtPub {
        let secp = Secp256k1::new();
        let path: Bip32Path = format!("m/{}'/1'/{}'", purpose.number(), account)
            .parse()
            .unwrap();
        let xpriv = self.master.derive_priv(&secp, &path).unwrap();
        ExtPub::from_bip32(&Xpub::from_priv(&secp, &xpriv), purpose)
    }

    fn address(&self, path: &str) -> Address {
        let path: DerivationPath = path.parse().unwrap();
        let secp = Secp256k1::verification_only();
        self.account_key(path.purpose(), path.account_number())
            .address(path.index(), path.is_change(), NETWORK, &secp)
            .unwrap()
    }
}

#[async_trait]
impl ExtPubResolver for TestKeys {
    async fn ext_pub(&self, purpose: Purpose, account_number: u32, _network: Network) -> anyhow::Result<ExtPub> {
        self.requests.lock().unwrap().push((purpose, account_number));
        self.events
            .lock()
            .unwrap()
            .push(Event::Resolved(purpose, account_number));
        Ok(self.account_key(purpose, account_number))
    }
}

#[derive(Default)]
struct MemorySource {
    addresses: HashMap<String, AddressInfo>,
    utxos: HashMap<String, Vec<(Transaction, u32)>>,
    lookups: AtomicUsize,
    fail: bool,
    /// Addresses whose lookup fails
    fail_on: Option<String>,
    /// Addresses that answer only after a delay
    delays: HashMap<String, Duration>,
    /// Yield to the scheduler on every lookup
    yield_each: bool,
    events: EventLog,
}

impl MemorySource {
    /// Fund `address` with one transaction per value
    fn fund(&mut self, address: &Address, values: &[u64]) {
        let key = address.to_string();
        let mut total = Amount::ZERO;
        for (i, sats) in values.iter().enumerate() {
            let tx = Transaction {
                version: Version::TWO,
                lock_time: LockTime::from_consensus(i as u32 + 1),
                input: vec![],
                output: vec![TxOut {
                    value: Amount::from_sat(*sats),
                    script_pubkey: address.script_pubkey(),
                }],
            };
            self.utxos.entry(key.clone()).or_default().push((tx, 0));
            total += Amount::from_sat(*sats);
        }
        let info = self.addresses.entry(key).or_default();
        info.used = true;
        info.balance += total;
    }

    fn mark_used(&mut self, address: &Address) {
        self.addresses.entry(address.to_string()).or_default().used = true;
    }
}

#[async_trait]
impl AddressSource for MemorySource {
    async fn fetch_address(&self, address: &Address) -> anyhow::Result<AddressInfo> {
        let key = address.to_string();
        self.events.lock().unwrap().push(Event::Lookup(key.clone()));
        if self.yield_each {
            tokio::task::yield_now().await;
        }
        if let Some(delay) = self.delays.get(&key) {
            tokio::time::sleep(*delay).await;
        }
        if self.fail || self.fail_on.as_deref() == Some(key.as_str()) {
            anyhow::bail!("connection refused");
        }
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.addresses.get(&key).copied().unwrap_or_default())
    }

    async fn fetch_utxos(&self, address: &Address) -> anyhow::Result<Vec<(Transaction, u32)>> {
        Ok(self
            .utxos
            .get(&address.to_string())
            .cloned()
            .unwrap_or_default())
    }

    async fn fetch_fee_estimates(&self) -> anyhow::Result<BTreeMap<u16, f64>> {
        Ok(BTreeMap::from([(1, 25.0), (6, 10.0), (144, 2.0)]))
    }
}

fn path(s: &str) -> DerivationPath {
    s.parse().unwrap()
}

#[tokio::test]
async fn test_single_account_wallet() {
    let keys = Arc::new(TestKeys::new());
    let mut source = MemorySource::default();
    source.fund(&keys.address("84'/1'/0'/0/0"), &[10_000, 20_000, 30_000]);
    source.fund(&keys.address("84'/1'/0'/1/0"), &[40_000]);
    let source = Arc::new(source);

    let discovery = Discovery::builder(source.clone(), keys.clone()).build().unwrap();
    discovery.fetch(NETWORK).await.unwrap();

    let accounts = discovery.accounts(NETWORK);
    assert_eq!(accounts.len(), 1);
    assert_eq!(accounts[0].ext_pub, keys.account_key(Purpose::NativeSegwit, 0));
    assert!(!accounts[0].paths_being_fetched);
    assert!(accounts[0].paths_fetch_time.is_some());
    assert_eq!(discovery.balance(NETWORK, None), Amount::from_sat(100_000));
    assert_eq!(
        discovery.used_derivation_paths(NETWORK),
        vec![path("84'/1'/0'/0/0"), path("84'/1'/0'/1/0")]
    );
    assert_eq!(discovery.network_ids(), vec![NETWORK]);

    // receive + change of account 0, receive of account 1, receive of the
    // unused account 0 of the other two purposes
    assert_eq!(source.lookups.load(Ordering::SeqCst), 21 + 21 + 20 + 20 + 20);

    let mut requests = keys.requests.lock().unwrap().clone();
    requests.sort();
    assert_eq!(
        requests,
        vec![
            (Purpose::Legacy, 0),
            (Purpose::NestedSegwit, 0),
            (Purpose::NativeSegwit, 0),
            (Purpose::NativeSegwit, 1),
        ]
    );
}

#[tokio::test]
async fn test_utxos_after_fetch() {
    let keys = Arc::new(TestKeys::new());
    let mut source = MemorySource::default();
    source.fund(&keys.address("84'/1'/0'/0/0"), &[10_000, 20_000, 30_000]);
    source.fund(&keys.address("84'/1'/0'/1/0"), &[40_000]);
    let discovery = Discovery::builder(Arc::new(source), keys.clone()).build().unwrap();
    discovery.fetch(NETWORK).await.unwrap();

    assert!(matches!(
        discovery.utxos(NETWORK, None),
        Err(DiscoveryError::NotYetRetrieved(_))
    ));

    discovery.fetch_utxos(NETWORK, None).await.unwrap();
    let utxos = discovery.utxos(NETWORK, None).unwrap();
    assert_eq!(utxos.len(), 4);
    let total: Amount = utxos.iter().filter_map(|u| u.value()).sum();
    assert_eq!(total, discovery.balance(NETWORK, None));

    let funded = discovery.funded_derivation_paths(NETWORK);
    let used = discovery.used_derivation_paths(NETWORK);
    assert!(funded.iter().all(|p| used.contains(p)));
}

#[tokio::test]
async fn test_walks_used_accounts() {
    let keys = Arc::new(TestKeys::new());
    let mut source = MemorySource::default();
    source.fund(&keys.address("49'/1'/0'/0/3"), &[5_000]);
    source.mark_used(&keys.address("49'/1'/1'/0/0"));
    source.fund(&keys.address("49'/1'/2'/0/19"), &[7_000]);
    source.fund(&keys.address("44'/1'/0'/0/0"), &[1_000]);

    let discovery = Discovery::builder(Arc::new(source), keys.clone()).build().unwrap();
    discovery.fetch(NETWORK).await.unwrap();

    assert_eq!(discovery.accounts(NETWORK).len(), 4);
    assert_eq!(
        discovery.used_derivation_paths(NETWORK),
        vec![
            path("44'/1'/0'/0/0"),
            path("49'/1'/0'/0/3"),
            path("49'/1'/1'/0/0"),
            path("49'/1'/2'/0/19"),
        ]
    );
    assert_eq!(
        discovery.funded_derivation_paths(NETWORK),
        vec![path("44'/1'/0'/0/0"), path("49'/1'/0'/0/3"), path("49'/1'/2'/0/19")]
    );
    assert_eq!(discovery.balance(NETWORK, None), Amount::from_sat(13_000));
}

#[tokio::test]
async fn test_gap_limits_hide_far_addresses() {
    let keys = Arc::new(TestKeys::new());
    let mut source = MemorySource::default();
    source.fund(&keys.address("84'/1'/0'/0/0"), &[1_000]);
    source.fund(&keys.address("84'/1'/0'/0/25"), &[2_000]);
    source.fund(&keys.address("84'/1'/2'/0/0"), &[3_000]);

    let discovery = Discovery::builder(Arc::new(source), keys).build().unwrap();
    discovery.fetch(NETWORK).await.unwrap();
    assert_eq!(
        discovery.used_derivation_paths(NETWORK),
        vec![path("84'/1'/0'/0/0")]
    );
}

#[tokio::test]
async fn test_wider_account_gap_probes_further() {
    let keys = Arc::new(TestKeys::new());
    let mut source = MemorySource::default();
    source.fund(&keys.address("84'/1'/1'/0/0"), &[3_000]);
    source.fund(&keys.address("84'/1'/3'/0/0"), &[4_000]);
    let config = DiscoveryConfig {
        gap_limit: 5,
        gap_account_limit: 2,
        force_fetch_change: false,
    };

    let discovery = Discovery::builder(Arc::new(source), keys.clone())
        .config(config)
        .build()
        .unwrap();
    discovery.fetch(NETWORK).await.unwrap();
    assert_eq!(
        discovery.used_derivation_paths(NETWORK),
        vec![path("84'/1'/1'/0/0"), path("84'/1'/3'/0/0")]
    );
    // The stored set satisfies the same limits
    assert!(config
        .limits()
        .normalize(&discovery.used_derivation_paths(NETWORK))
        .is_ok());
}

#[tokio::test]
async fn test_force_fetch_change() {
    let keys = Arc::new(TestKeys::new());
    let mut source = MemorySource::default();
    source.fund(&keys.address("84'/1'/0'/1/2"), &[9_000]);
    let source = Arc::new(source);

    let discovery = Discovery::builder(source.clone(), keys.clone()).build().unwrap();
    discovery.fetch(NETWORK).await.unwrap();
    assert!(discovery.used_derivation_paths(NETWORK).is_empty());

    let forced = Discovery::builder(source, keys)
        .config(DiscoveryConfig {
            force_fetch_change: true,
            ..Default::default()
        })
        .build()
        .unwrap();
    forced.fetch(NETWORK).await.unwrap();
    assert_eq!(forced.used_derivation_paths(NETWORK), vec![path("84'/1'/0'/1/2")]);
}

#[tokio::test]
async fn test_funded_but_unused_is_rejected() {
    let keys = Arc::new(TestKeys::new());
    let mut source = MemorySource::default();
    source.addresses.insert(
        keys.address("84'/1'/0'/0/1").to_string(),
        AddressInfo {
            used: false,
            balance: Amount::from_sat(1),
        },
    );
    let discovery = Discovery::builder(Arc::new(source), keys).build().unwrap();
    let result = discovery.fetch(NETWORK).await;
    assert!(matches!(result, Err(DiscoveryError::FundedButUnused { .. })));
}

#[tokio::test]
async fn test_source_errors_propagate() {
    let keys = Arc::new(TestKeys::new());
    let source = MemorySource {
        fail: true,
        ..Default::default()
    };
    let discovery = Discovery::builder(Arc::new(source), keys).build().unwrap();
    let err = discovery.fetch(NETWORK).await.unwrap_err();
    assert!(matches!(err, DiscoveryError::Collaborator(_)));
    assert!(err.to_string().contains("connection refused"));
    assert!(discovery.network_ids().is_empty());
}

#[tokio::test]
async fn test_next_account_scanned_while_current_one_continues() {
    let keys = Arc::new(TestKeys::new());
    let mut source = MemorySource {
        yield_each: true,
        events: keys.events.clone(),
        ..Default::default()
    };
    source.fund(&keys.address("84'/1'/0'/0/0"), &[10_000]);
    source.mark_used(&keys.address("84'/1'/1'/0/0"));

    let discovery = Discovery::builder(Arc::new(source), keys.clone()).build().unwrap();
    discovery.fetch(NETWORK).await.unwrap();
    assert_eq!(
        discovery.used_derivation_paths(NETWORK),
        vec![path("84'/1'/0'/0/0"), path("84'/1'/1'/0/0")]
    );

    let events = keys.events.lock().unwrap().clone();
    let position = |event: Event| events.iter().position(|e| *e == event).unwrap();
    let account_one = position(Event::Resolved(Purpose::NativeSegwit, 1));
    let last_receive = position(Event::Lookup(keys.address("84'/1'/0'/0/20").to_string()));
    let first_change = position(Event::Lookup(keys.address("84'/1'/0'/1/0").to_string()));
    assert!(account_one < last_receive);
    assert!(account_one < first_change);
    // Account 1 is found used before account 0 finishes, so account 2 starts early too
    let account_two = position(Event::Resolved(Purpose::NativeSegwit, 2));
    assert!(account_two < last_receive);
}

#[tokio::test]
async fn test_failure_stops_spawned_account_scans() {
    let keys = Arc::new(TestKeys::new());
    let used_next = keys.address("84'/1'/1'/0/0");
    let mut source = MemorySource {
        fail_on: Some(keys.address("84'/1'/0'/0/1").to_string()),
        delays: HashMap::from([(used_next.to_string(), Duration::from_millis(100))]),
        ..Default::default()
    };
    source.fund(&keys.address("84'/1'/0'/0/0"), &[10_000]);
    source.mark_used(&used_next);

    let notified = Arc::new(AtomicUsize::new(0));
    let counter = notified.clone();
    let discovery = Discovery::builder(Arc::new(source), keys)
        .on_wallet_changed(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .build()
        .unwrap();

    let err = discovery.fetch(NETWORK).await.unwrap_err();
    assert!(matches!(err, DiscoveryError::Collaborator(_)));
    assert!(err.to_string().contains("connection refused"));
    let used_at_return = discovery.used_derivation_paths(NETWORK);
    let notified_at_return = notified.load(Ordering::SeqCst);
    assert_eq!(used_at_return, vec![path("84'/1'/0'/0/0")]);
    assert_eq!(notified_at_return, 1);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(discovery.used_derivation_paths(NETWORK), used_at_return);
    assert_eq!(notified.load(Ordering::SeqCst), notified_at_return);
}

#[tokio::test]
async fn test_change_notifications() {
    let keys = Arc::new(TestKeys::new());
    let mut source = MemorySource::default();
    source.fund(&keys.address("84'/1'/0'/0/0"), &[10_000]);
    let source = Arc::new(source);

    let notified = Arc::new(AtomicUsize::new(0));
    let counter = notified.clone();
    let discovery = Discovery::builder(source, keys)
        .on_wallet_changed(move |snapshot| {
            assert_eq!(snapshot.network, NETWORK);
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .build()
        .unwrap();
    let mut rx = discovery.subscribe();
    assert!(!rx.has_changed().unwrap());

    discovery.fetch(NETWORK).await.unwrap();
    assert!(rx.has_changed().unwrap());
    rx.mark_unchanged();
    // path found + paths fetched
    assert_eq!(notified.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_next_derivation_path() {
    let keys = Arc::new(TestKeys::new());
    let mut source = MemorySource::default();
    source.fund(&keys.address("84'/1'/0'/0/0"), &[10_000]);
    source.mark_used(&keys.address("84'/1'/0'/0/1"));
    let discovery = Discovery::builder(Arc::new(source), keys).build().unwrap();
    discovery.fetch(NETWORK).await.unwrap();

    let next = discovery.next_derivation_path(NETWORK, false, &[], 0).unwrap();
    assert_eq!(next, path("84'/1'/0'/0/2"));
    let next = discovery
        .next_derivation_path(NETWORK, false, &[path("84'/1'/0'/0/2")], 0)
        .unwrap();
    assert_eq!(next, path("84'/1'/0'/0/3"));
    let change = discovery.next_derivation_path(NETWORK, true, &[], 0).unwrap();
    assert_eq!(change, path("84'/1'/0'/1/0"));

    let fees = discovery.fee_estimates().await.unwrap();
    assert_eq!(fees.get(&6), Some(&10.0));
}

#[tokio::test]
async fn test_address_cache() {
    let keys = Arc::new(TestKeys::new());
    let discovery = Discovery::builder(Arc::new(MemorySource::default()), keys.clone())
        .build()
        .unwrap();
    let ext_pub = keys.account_key(Purpose::NativeSegwit, 0);
    let first = discovery.address(&ext_pub, 4, false, NETWORK).unwrap();
    let cached = discovery.address(&ext_pub, 4, false, NETWORK).unwrap();
    discovery.clear_cache();
    let fresh = discovery.address(&ext_pub, 4, false, NETWORK).unwrap();
    assert_eq!(first, cached);
    assert_eq!(first, fresh);
    assert_eq!(first, keys.address("84'/1'/0'/0/4"));
}
