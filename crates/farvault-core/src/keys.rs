//! Key resolution capabilities consumed by discovery and the builder
//!
//! Implementations may talk to a hardware device, so both traits are async
//! and report failures as opaque collaborator errors.

use crate::paths::{DerivationPath, Purpose};
use crate::xpub::ExtPub;
use async_trait::async_trait;
use bitcoin::secp256k1::PublicKey;
use bitcoin::Network;

/// Resolves the account-level extended public key for a purpose.
#[async_trait]
pub trait ExtPubResolver: Send + Sync {
    async fn ext_pub(
        &self,
        purpose: Purpose,
        account_number: u32,
        network: Network,
    ) -> anyhow::Result<ExtPub>;
}

/// Resolves the public key controlling a single path.
#[async_trait]
pub trait PublicKeyResolver: Send + Sync {
    async fn public_key(&self, path: &DerivationPath, network: Network) -> anyhow::Result<PublicKey>;
}
