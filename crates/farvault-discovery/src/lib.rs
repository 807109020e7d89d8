//! FarVault Discovery
//!
//! Finds every address a wallet could plausibly have used by walking the
//! BIP-44 tree against an address data source.
//!
//! # Scanning
//!
//! - The three purposes are scanned concurrently, each starting at account 0.
//! - Within an account, receive addresses are checked one by one until
//!   `gap_limit` consecutive unused addresses are seen. The change branch is
//!   only scanned once the receive branch was used.
//! - As soon as an account turns out to be used, the next account is
//!   spawned and scanned alongside the rest of the current one.
//!
//! # State
//!
//! Results accumulate in a [`DiscoveryData`] value. Every update builds a new
//! value and swaps it in only if it differs, so readers never observe a
//! partial update and subscribers are woken only on real changes.
//!
//! # Example
//!
//! ```ignore
//! use farvault_discovery::{Discovery, DiscoveryConfig};
//!
//! let discovery = Discovery::builder(source, signer)
//!     .config(DiscoveryConfig::default())
//!     .build()?;
//! discovery.fetch(Network::Testnet).await?;
//! discovery.fetch_utxos(Network::Testnet, None).await?;
//! println!("{}", discovery.balance(Network::Testnet, None));
//! ```

pub mod config;
pub mod engine;
pub mod source;
pub mod state;

pub use config::DiscoveryConfig;
pub use engine::{Discovery, DiscoveryBuilder, WalletChanged};
pub use source::{AddressInfo, AddressSource};
pub use state::{Account, DiscoveryData, NetworkSnapshot, PathEntry};

use farvault_core::{ChainError, ExtPub, PathError, XpubError};
use thiserror::Error;

/// Errors from the discovery engine
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("Address data source error: {0}")]
    Collaborator(anyhow::Error),

    #[error("Address {address} holds {balance} but was reported as never used")]
    FundedButUnused {
        address: String,
        balance: bitcoin::Amount,
    },

    #[error("UTXOs for account {0} have not been retrieved yet")]
    NotYetRetrieved(ExtPub),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Path error: {0}")]
    Path(#[from] PathError),

    #[error("Extended key error: {0}")]
    Xpub(#[from] XpubError),

    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("Account scan task failed: {0}")]
    Task(String),

    #[error("Discovery stopped after another scan failed")]
    Cancelled,
}
