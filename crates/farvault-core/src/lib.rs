//! FarVault Core
//!
//! Shared types and key-derivation rules for FarVault.
//!
//! # Derivation
//!
//! Every wallet address lives at a BIP-44 style path:
//! - Legacy (P2PKH): m/44'/coin'/account'/change/index
//! - Nested segwit (P2SH-P2WPKH): m/49'/coin'/account'/change/index
//! - Native segwit (P2WPKH): m/84'/coin'/account'/change/index
//!
//! Coin type 0 is mainnet, 1 is shared by testnet, signet and regtest.
//!
//! # Gap limits
//!
//! Discovery stops scanning a branch after `gap_limit` consecutive unused
//! addresses and stops walking accounts after `gap_account_limit` unused
//! accounts. [`chain`] validates used-path sets against the same rules.

pub mod chain;
pub mod fees;
pub mod keys;
pub mod paths;
pub mod utxo;
pub mod xpub;

pub use chain::{ChainError, GapLimits};
pub use fees::{FeeError, FeeSampler};
pub use keys::{ExtPubResolver, PublicKeyResolver};
pub use paths::{coin_type_for, DerivationPath, PathError, Purpose};
pub use utxo::Utxo;
pub use xpub::{ExtPub, XpubError};
