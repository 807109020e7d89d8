//! Signing capabilities
//!
//! A wallet signer resolves public keys and hands out one signing function
//! per input. [`SeedSigner`] keeps a BIP-39 seed in memory; hardware
//! devices implement the same traits over their own transport.

use async_trait::async_trait;
use bip39::{Language, Mnemonic};
use bitcoin::bip32::{ChildNumber, DerivationPath as Bip32Path, Xpriv, Xpub};
use bitcoin::psbt::Psbt;
use bitcoin::Network;
use farvault_core::{coin_type_for, DerivationPath, ExtPub, ExtPubResolver, PublicKeyResolver, Purpose, Utxo};
use secp256k1::ecdsa::Signature;
use secp256k1::{All, Message, PublicKey, Secp256k1, SecretKey};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use zeroize::Zeroizing;

/// Signs one sighash digest
pub type SignFn = Box<dyn Fn(&Message) -> anyhow::Result<Signature> + Send + Sync>;

/// Signing function for one input, with the key it signs for
pub struct InputSigner {
    pub public_key: PublicKey,
    pub sign: SignFn,
}

impl std::fmt::Debug for InputSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputSigner")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

/// Hands out signing functions for the inputs of a transaction template.
#[async_trait]
pub trait SignerFactory: Send + Sync {
    /// One signer per UTXO, in input order.
    async fn create_signers(
        &self,
        psbt: &Psbt,
        utxos: &[Utxo],
        network: Network,
    ) -> anyhow::Result<Vec<InputSigner>>;
}

/// Every capability a wallet backend provides.
#[async_trait]
pub trait WalletSigner: ExtPubResolver + PublicKeyResolver + SignerFactory {
    async fn init(&self) -> anyhow::Result<()>;

    async fn close(&self) -> anyhow::Result<()>;
}

#[derive(Error, Debug)]
pub enum SignerError {
    #[error("Invalid mnemonic: {0}")]
    InvalidMnemonic(String),

    #[error("Derivation failed: {0}")]
    DerivationFailed(String),

    #[error("Path {path} does not belong to {network}")]
    WrongNetwork { path: DerivationPath, network: Network },

    #[error("Template has {inputs} inputs but {utxos} UTXOs were given")]
    InputCount { inputs: usize, utxos: usize },
}

/// Software signer backed by a BIP-39 seed
pub struct SeedSigner {
    seed: Zeroizing<[u8; 64]>,
    secp: Arc<Secp256k1<All>>,
    ext_pubs: Mutex<HashMap<(Purpose, u32, Network), ExtPub>>,
}

impl SeedSigner {
    pub fn from_mnemonic(words: &str, passphrase: &str) -> Result<Self, SignerError> {
        let mnemonic = Mnemonic::parse_in(Language::English, words)
            .map_err(|e| SignerError::InvalidMnemonic(e.to_string()))?;
        Ok(Self::from_seed(mnemonic.to_seed(passphrase)))
    }

    pub fn from_seed(seed: [u8; 64]) -> Self {
        Self {
            seed: Zeroizing::new(seed),
            secp: Arc::new(Secp256k1::new()),
            ext_pubs: Mutex::new(HashMap::new()),
        }
    }

    fn master(&self, network: Network) -> Result<Xpriv, SignerError> {
        Xpriv::new_master(network, &self.seed[..])
            .map_err(|e| SignerError::DerivationFailed(e.to_string()))
    }

    fn derive(&self, path: &Bip32Path, network: Network) -> Result<Xpriv, SignerError> {
        self.master(network)?
            .derive_priv(&self.secp, path)
            .map_err(|e| SignerError::DerivationFailed(e.to_string()))
    }

    /// Secret key controlling `path`
    pub fn secret_key(&self, path: &DerivationPath, network: Network) -> Result<SecretKey, SignerError> {
        if !path.matches_network(network) {
            return Err(SignerError::WrongNetwork {
                path: *path,
                network,
            });
        }
        Ok(self.derive(&path.to_bip32(), network)?.private_key)
    }

    /// Account-level extended public key with the prefix for `purpose`
    pub fn account_ext_pub(&self, purpose: Purpose, account_number: u32, network: Network) -> Result<ExtPub, SignerError> {
        let key = (purpose, account_number, network);
        if let Some(cached) = self
            .ext_pubs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
        {
            return Ok(cached.clone());
        }

        let child = |index: u32| {
            ChildNumber::from_hardened_idx(index).map_err(|e| SignerError::DerivationFailed(e.to_string()))
        };
        let path = Bip32Path::from(vec![
            child(purpose.number())?,
            child(coin_type_for(network))?,
            child(account_number)?,
        ]);
        let xpriv = self.derive(&path, network)?;
        let ext_pub = ExtPub::from_bip32(&Xpub::from_priv(&self.secp, &xpriv), purpose);

        self.ext_pubs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, ext_pub.clone());
        Ok(ext_pub)
    }

    pub fn clear_cache(&self) {
        self.ext_pubs.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

#[async_trait]
impl ExtPubResolver for SeedSigner {
    async fn ext_pub(&self, purpose: Purpose, account_number: u32, network: Network) -> anyhow::Result<ExtPub> {
        Ok(self.account_ext_pub(purpose, account_number, network)?)
    }
}

#[async_trait]
impl PublicKeyResolver for SeedSigner {
    async fn public_key(&self, path: &DerivationPath, network: Network) -> anyhow::Result<PublicKey> {
        Ok(self.secret_key(path, network)?.public_key(&self.secp))
    }
}

#[async_trait]
impl SignerFactory for SeedSigner {
    async fn create_signers(
        &self,
        psbt: &Psbt,
        utxos: &[Utxo],
        network: Network,
    ) -> anyhow::Result<Vec<InputSigner>> {
        if psbt.inputs.len() != utxos.len() {
            return Err(SignerError::InputCount {
                inputs: psbt.inputs.len(),
                utxos: utxos.len(),
            }
            .into());
        }
        let mut signers = Vec::with_capacity(utxos.len());
        for utxo in utxos {
            let secret_key = self.secret_key(&utxo.path, network)?;
            let secp = self.secp.clone();
            signers.push(InputSigner {
                public_key: secret_key.public_key(&self.secp),
                sign: Box::new(move |msg: &Message| {
                    Ok::<_, anyhow::Error>(secp.sign_ecdsa_low_r(msg, &secret_key))
                }),
            });
        }
        Ok(signers)
    }
}

#[async_trait]
impl WalletSigner for SeedSigner {
    async fn init(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.clear_cache();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ABANDON: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    #[test]
    fn test_bip84_account_key() {
        let signer = SeedSigner::from_mnemonic(ABANDON, "").unwrap();
        let zpub = signer
            .account_ext_pub(Purpose::NativeSegwit, 0, Network::Bitcoin)
            .unwrap();
        assert_eq!(
            zpub.as_str(),
            "zpub6rFR7y4Q2AijBEqTUquhVz398htDFrtymD9xYYfG1m4wAcvPhXNfE3EfH1r1ADqtfSdVCToUG868RvUUkgDKf31mGDtKsAYz2oz2AGutZYs"
        );
    }

    #[test]
    fn test_ext_pub_and_path_keys_agree() {
        let secp = Secp256k1::verification_only();
        let signer = SeedSigner::from_mnemonic(ABANDON, "").unwrap();
        let path: DerivationPath = "49'/1'/2'/1/7".parse().unwrap();
        let from_path = signer.secret_key(&path, Network::Testnet).unwrap().public_key(&signer.secp);
        let from_xpub = signer
            .account_ext_pub(Purpose::NestedSegwit, 2, Network::Testnet)
            .unwrap()
            .derive_child_public_key(7, true, Network::Testnet, &secp)
            .unwrap();
        assert_eq!(from_path, from_xpub);
    }

    #[test]
    fn test_network_checked() {
        let signer = SeedSigner::from_mnemonic(ABANDON, "").unwrap();
        let path: DerivationPath = "84'/0'/0'/0/0".parse().unwrap();
        assert!(matches!(
            signer.secret_key(&path, Network::Testnet),
            Err(SignerError::WrongNetwork { .. })
        ));
    }

    #[test]
    fn test_invalid_mnemonic() {
        assert!(matches!(
            SeedSigner::from_mnemonic("abandon abandon", ""),
            Err(SignerError::InvalidMnemonic(_))
        ));
    }

    #[test]
    fn test_passphrase_changes_keys() {
        let plain = SeedSigner::from_mnemonic(ABANDON, "").unwrap();
        let with_pass = SeedSigner::from_mnemonic(ABANDON, "secret passphrase").unwrap();
        let a = plain.account_ext_pub(Purpose::Legacy, 0, Network::Regtest).unwrap();
        let b = with_pass.account_ext_pub(Purpose::Legacy, 0, Network::Regtest).unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_signers_produce_low_r() {
        let signer = SeedSigner::from_mnemonic(ABANDON, "").unwrap();
        let path: DerivationPath = "84'/1'/0'/0/0".parse().unwrap();
        let tx = bitcoin::Transaction {
            version: bitcoin::transaction::Version::TWO,
            lock_time: bitcoin::absolute::LockTime::ZERO,
            input: vec![bitcoin::TxIn::default()],
            output: vec![],
        };
        let psbt = Psbt::from_unsigned_tx(tx.clone()).unwrap();
        let utxo = Utxo::new(tx, 0, path);
        let signers = signer
            .create_signers(&psbt, &[utxo], Network::Testnet)
            .await
            .unwrap();
        assert_eq!(signers.len(), 1);

        let secp = Secp256k1::verification_only();
        for i in 0..16u8 {
            let msg = Message::from_digest([i; 32]);
            let sig = (signers[0].sign)(&msg).unwrap();
            assert!(secp.verify_ecdsa(&msg, &sig, &signers[0].public_key).is_ok());
            assert!(sig.serialize_der().len() <= 70);
        }
    }
}
