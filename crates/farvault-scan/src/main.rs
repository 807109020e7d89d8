//! FarVault Scan: discover a wallet's accounts, balances and UTXOs
//!
//! # Usage
//!
//! ```bash
//! farvault-scan --config /path/to/farvault.toml
//! farvault-scan --json                 # Print the discovery snapshot as JSON
//! farvault-scan --sweep <ADDRESS>      # Also build signed sweeps at sampled fee rates
//! farvault-scan --validate             # Validate config and exit
//! ```

mod config;

use anyhow::{Context, Result};
use bitcoin::address::NetworkUnchecked;
use bitcoin::{Address, Network};
use farvault_core::FeeSampler;
use farvault_discovery::Discovery;
use farvault_electrum::ElectrumSource;
use farvault_tx::{build_fee_series, SeedSigner, WalletSigner};
use std::path::PathBuf;
use std::sync::Arc;

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();

    let mut config_path = PathBuf::from("farvault.toml");
    let mut validate_only = false;
    let mut json = false;
    let mut sweep_to: Option<String> = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                i += 1;
                if i < args.len() {
                    config_path = PathBuf::from(&args[i]);
                } else {
                    anyhow::bail!("--config requires a path argument");
                }
            }
            "--sweep" => {
                i += 1;
                if i < args.len() {
                    sweep_to = Some(args[i].clone());
                } else {
                    anyhow::bail!("--sweep requires an address argument");
                }
            }
            "--json" => {
                json = true;
            }
            "--validate" => {
                validate_only = true;
            }
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            "--version" | "-V" => {
                println!("farvault-scan {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            other => {
                anyhow::bail!("Unknown argument: {}", other);
            }
        }
        i += 1;
    }

    let mut scan_config = if config_path.exists() {
        config::ScanConfig::from_file(&config_path)
            .with_context(|| format!("Failed to load config from {}", config_path.display()))?
    } else {
        config::ScanConfig::default()
    };
    scan_config.apply_env_overrides();
    scan_config
        .validate()
        .context("Configuration validation failed")?;

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(scan_config.scan.log_level.as_str()),
    )
    .init();

    let network = scan_config.network()?;
    let electrum_url = scan_config.electrum_url()?;

    if validate_only {
        println!("Configuration is valid.");
        println!("  Network:       {}", network);
        println!("  Electrum:      {}", electrum_url);
        println!("  Gap limit:     {}", scan_config.discovery.gap_limit);
        println!(
            "  Account gap:   {}",
            scan_config.discovery.gap_account_limit
        );
        return Ok(());
    }

    let sweep_to = sweep_to
        .map(|s| {
            s.parse::<Address<NetworkUnchecked>>()
                .with_context(|| format!("Invalid sweep address: {}", s))?
                .require_network(network)
                .with_context(|| format!("Sweep address is not valid on {}", network))
        })
        .transpose()?;

    let rt = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
    rt.block_on(run(&scan_config, network, &electrum_url, sweep_to, json))
}

async fn run(
    scan_config: &config::ScanConfig,
    network: Network,
    electrum_url: &str,
    sweep_to: Option<Address>,
    json: bool,
) -> Result<()> {
    let signer = Arc::new(
        SeedSigner::from_mnemonic(&scan_config.mnemonic()?, &scan_config.wallet.passphrase)
            .context("Failed to load wallet seed")?,
    );
    signer.init().await?;

    let source = Arc::new(
        ElectrumSource::new(electrum_url, network)
            .with_context(|| format!("Failed to connect to {}", electrum_url))?,
    );
    let discovery = Discovery::builder(source.clone(), signer.clone())
        .config(scan_config.discovery)
        .on_wallet_changed(|snapshot| {
            log::debug!("Wallet changed: {} accounts", snapshot.accounts.len());
        })
        .build()?;

    log::info!("Scanning {} via {}", network, electrum_url);
    discovery.fetch(network).await?;
    discovery.fetch_utxos(network, None).await?;

    if json {
        let snapshot = discovery.snapshot();
        println!("{}", serde_json::to_string_pretty(&*snapshot)?);
    } else {
        print_summary(&discovery, network)?;
    }

    if let Some(address) = sweep_to {
        let utxos = discovery.utxos(network, None)?;
        if utxos.is_empty() {
            println!("Nothing to sweep.");
        } else {
            let rates = FeeSampler::default().sample()?;
            let series =
                build_fee_series(&utxos, &address, &*signer, &*signer, &rates, network).await?;
            println!("Sweeps to {} ({} fee levels):", address, series.len());
            for entry in &series {
                println!(
                    "  {:>10.2} sat/vB  fee {:>12}  {}",
                    entry.fee_rate,
                    entry.fee,
                    bitcoin::consensus::encode::serialize_hex(&entry.tx)
                );
            }
        }
    }

    signer.close().await?;
    Ok(())
}

fn print_summary(discovery: &Discovery, network: Network) -> Result<()> {
    let accounts = discovery.accounts(network);
    println!("Network:  {}", network);
    println!("Accounts: {}", accounts.len());
    for account in &accounts {
        println!("  {}  balance {}", account.ext_pub, account.balance());
        for entry in account.paths.values() {
            println!("    {:<20} {}", entry.path.to_string(), entry.balance);
        }
    }
    println!("UTXOs:    {}", discovery.utxos(network, None)?.len());
    println!("Balance:  {}", discovery.balance(network, None));
    Ok(())
}

fn print_help() {
    println!(
        r#"FarVault Scan: wallet discovery over Electrum

USAGE:
    farvault-scan [OPTIONS]

OPTIONS:
    -c, --config <PATH>   Config file path (default: farvault.toml)
    --json                Print the discovery snapshot as JSON
    --sweep <ADDRESS>     Build signed sweeps of all UTXOs at sampled fee rates
    --validate            Validate config file and exit
    -h, --help            Show this help message
    -V, --version         Show version

ENVIRONMENT VARIABLES (override config file):
    FARVAULT_LOG_LEVEL           Log level (error/warn/info/debug/trace)
    FARVAULT_NETWORK             Bitcoin network (bitcoin/testnet/signet/regtest)
    FARVAULT_ELECTRUM_URL        Electrum server URL
    FARVAULT_GAP_LIMIT           Unused addresses ending a branch scan
    FARVAULT_GAP_ACCOUNT_LIMIT   Unused accounts ending an account walk
    FARVAULT_FORCE_FETCH_CHANGE  Scan change addresses of unused accounts
    FARVAULT_PASSPHRASE          BIP-39 passphrase
    FARVAULT_MNEMONIC            Wallet mnemonic (name configurable via wallet.mnemonic_env)
"#
    );
}
