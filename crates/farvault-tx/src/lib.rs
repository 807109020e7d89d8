//! FarVault Transactions
//!
//! Builds fully signed transactions spending wallet UTXOs:
//! - Legacy, nested SegWit and native SegWit single-key inputs
//! - Vault inputs through either the matured or the rushed branch
//! - Fee series: one sweep per candidate fee rate
//!
//! Signing goes through [`SignerFactory`], so the same builder drives the
//! in-memory [`SeedSigner`] and external devices.
//!
//! # Example
//!
//! ```ignore
//! use farvault_tx::{build_fee_series, SeedSigner};
//! use farvault_core::FeeSampler;
//!
//! let signer = SeedSigner::from_mnemonic(words, "")?;
//! let rates = FeeSampler::default().sample()?;
//! let series = build_fee_series(&utxos, &address, &signer, &signer, &rates, network).await?;
//! for entry in &series {
//!     println!("{:.1} sat/vB -> {}", entry.fee_rate, entry.fee);
//! }
//! ```

pub mod builder;
pub mod fee_series;
pub mod signer;

pub use builder::{Target, TxBuilder};
pub use fee_series::{build_fee_series, FeeSeriesEntry};
pub use signer::{InputSigner, SeedSigner, SignFn, SignerError, SignerFactory, WalletSigner};

use bitcoin::{Amount, Network, OutPoint};
use farvault_core::DerivationPath;
use farvault_vault::VaultError;
use thiserror::Error;

/// Errors from transaction building
#[derive(Error, Debug)]
pub enum BuildError {
    #[error("No UTXOs to spend")]
    NoInputs,

    #[error("No outputs requested")]
    NoTargets,

    #[error("Only one target may take the remaining funds")]
    MultipleSweepTargets,

    #[error("Funding transaction has no output for {0}")]
    MissingOutput(OutPoint),

    #[error("Path {path} does not belong to {network}")]
    WrongNetwork { path: DerivationPath, network: Network },

    #[error("Address {address} is not valid on {network}")]
    WrongAddressNetwork { address: String, network: Network },

    #[error("Wallet key does not control {0}")]
    KeyMismatch(OutPoint),

    #[error(transparent)]
    Vault(#[from] VaultError),

    #[error("Insufficient funds: have {available}, need {required}")]
    InsufficientFunds { available: Amount, required: Amount },

    #[error("Output to {address} of {value} is dust")]
    DustOutput { address: String, value: Amount },

    #[error("Amount overflow")]
    AmountOverflow,

    #[error("Invalid fee rate: {0}")]
    InvalidFeeRate(f64),

    #[error("PSBT error: {0}")]
    Psbt(String),

    #[error("Sighash error: {0}")]
    Sighash(String),

    #[error("Signer failed: {0}")]
    Signer(anyhow::Error),

    #[error("Expected {expected} signers, got {got}")]
    SignerCount { expected: usize, got: usize },

    #[error("Signature for input {0} does not verify")]
    InvalidSignature(usize),
}
