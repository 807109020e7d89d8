//! Extended public keys with purpose-specific version bytes
//!
//! SLIP-132 style prefixes (`xpub`/`ypub`/`zpub` and their testnet
//! counterparts) encode both the network family and the address purpose.
//! rust-bitcoin only understands the legacy `xpub`/`tpub` versions, so every
//! derivation normalizes the version before decoding.

use crate::paths::Purpose;
use bitcoin::base58;
use bitcoin::bip32::{ChildNumber, Xpub};
use bitcoin::secp256k1::{self, Secp256k1, Verification};
use bitcoin::{Address, CompressedPublicKey, Network, NetworkKind};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Length of a decoded BIP-32 extended key
const EXTENDED_KEY_LEN: usize = 78;

/// (network family, purpose, version bytes)
const VERSIONS: [(NetworkKind, Purpose, [u8; 4]); 6] = [
    (NetworkKind::Main, Purpose::Legacy, [0x04, 0x88, 0xB2, 0x1E]),
    (NetworkKind::Main, Purpose::NestedSegwit, [0x04, 0x9D, 0x7C, 0xB2]),
    (NetworkKind::Main, Purpose::NativeSegwit, [0x04, 0xB2, 0x47, 0x46]),
    (NetworkKind::Test, Purpose::Legacy, [0x04, 0x35, 0x87, 0xCF]),
    (NetworkKind::Test, Purpose::NestedSegwit, [0x04, 0x4A, 0x52, 0x62]),
    (NetworkKind::Test, Purpose::NativeSegwit, [0x04, 0x5F, 0x1C, 0xF6]),
];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum XpubError {
    #[error("Invalid base58check encoding: {0}")]
    Base58(String),

    #[error("Extended key must be {EXTENDED_KEY_LEN} bytes, got {0}")]
    InvalidLength(usize),

    #[error("Unknown extended key version {0:02x?}")]
    UnknownVersion([u8; 4]),

    #[error("Extended key belongs to {key:?} but {network} was requested")]
    NetworkMismatch { key: NetworkKind, network: Network },

    #[error("Account number requires depth 3, key has depth {0}")]
    NotAccountLevel(u8),

    #[error("Account level child number is not hardened")]
    UnhardenedAccount,

    #[error("Derivation failed: {0}")]
    Derivation(String),
}

fn version_for(kind: NetworkKind, purpose: Purpose) -> [u8; 4] {
    VERSIONS
        .iter()
        .find(|(k, p, _)| *k == kind && *p == purpose)
        .map(|(_, _, v)| *v)
        .unwrap_or(VERSIONS[0].2)
}

fn lookup_version(version: [u8; 4]) -> Result<(NetworkKind, Purpose), XpubError> {
    VERSIONS
        .iter()
        .find(|(_, _, v)| *v == version)
        .map(|(k, p, _)| (*k, *p))
        .ok_or(XpubError::UnknownVersion(version))
}

/// Decode and validate the raw 78-byte payload.
fn decode(s: &str) -> Result<[u8; EXTENDED_KEY_LEN], XpubError> {
    let data = base58::decode_check(s).map_err(|e| XpubError::Base58(e.to_string()))?;
    let bytes: [u8; EXTENDED_KEY_LEN] = data
        .as_slice()
        .try_into()
        .map_err(|_| XpubError::InvalidLength(data.len()))?;
    lookup_version([bytes[0], bytes[1], bytes[2], bytes[3]])?;
    Ok(bytes)
}

/// A base58check extended public key with a known version prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ExtPub(String);

impl ExtPub {
    /// Encode a rust-bitcoin key with the version for `purpose`.
    pub fn from_bip32(xpub: &Xpub, purpose: Purpose) -> Self {
        let mut bytes = xpub.encode();
        bytes[..4].copy_from_slice(&version_for(xpub.network, purpose));
        ExtPub(base58::encode_check(&bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn bytes(&self) -> Result<[u8; EXTENDED_KEY_LEN], XpubError> {
        decode(&self.0)
    }

    fn version_info(&self) -> Result<(NetworkKind, Purpose), XpubError> {
        let bytes = self.bytes()?;
        lookup_version([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    /// Purpose recovered from the version prefix
    pub fn purpose(&self) -> Result<Purpose, XpubError> {
        Ok(self.version_info()?.1)
    }

    /// Network family recovered from the version prefix
    pub fn network_kind(&self) -> Result<NetworkKind, XpubError> {
        Ok(self.version_info()?.0)
    }

    /// Account number of a depth-3 (account level) key.
    pub fn account_number(&self) -> Result<u32, XpubError> {
        let bytes = self.bytes()?;
        let depth = bytes[4];
        if depth != 3 {
            return Err(XpubError::NotAccountLevel(depth));
        }
        let child = u32::from_be_bytes([bytes[9], bytes[10], bytes[11], bytes[12]]);
        match ChildNumber::from(child) {
            ChildNumber::Hardened { index } => Ok(index),
            ChildNumber::Normal { .. } => Err(XpubError::UnhardenedAccount),
        }
    }

    /// Re-encode the same key with the version for `(network, purpose)`.
    pub fn set_prefix(&self, purpose: Purpose, network: Network) -> Result<ExtPub, XpubError> {
        let mut bytes = self.bytes()?;
        bytes[..4].copy_from_slice(&version_for(NetworkKind::from(network), purpose));
        base58::encode_check(&bytes).parse()
    }

    fn check_network(&self, network: Network) -> Result<(), XpubError> {
        let key = self.network_kind()?;
        if key != NetworkKind::from(network) {
            return Err(XpubError::NetworkMismatch { key, network });
        }
        Ok(())
    }

    /// Normalize to the legacy version and decode as a rust-bitcoin key.
    pub fn to_bip32(&self, network: Network) -> Result<Xpub, XpubError> {
        self.check_network(network)?;
        let legacy = self.set_prefix(Purpose::Legacy, network)?;
        Xpub::decode(&legacy.bytes()?).map_err(|e| XpubError::Derivation(e.to_string()))
    }

    /// Derive the public key at `change/index` below this account key.
    pub fn derive_child_public_key<C: Verification>(
        &self,
        index: u32,
        is_change: bool,
        network: Network,
        secp: &Secp256k1<C>,
    ) -> Result<secp256k1::PublicKey, XpubError> {
        let xpub = self.to_bip32(network)?;
        let path = [
            ChildNumber::Normal {
                index: u32::from(is_change),
            },
            ChildNumber::from_normal_idx(index).map_err(|e| XpubError::Derivation(e.to_string()))?,
        ];
        let child = xpub
            .derive_pub(secp, &path)
            .map_err(|e| XpubError::Derivation(e.to_string()))?;
        Ok(child.public_key)
    }

    /// Address at `change/index`, with the script type implied by the prefix.
    pub fn address<C: Verification>(
        &self,
        index: u32,
        is_change: bool,
        network: Network,
        secp: &Secp256k1<C>,
    ) -> Result<Address, XpubError> {
        let purpose = self.purpose()?;
        let public_key =
            CompressedPublicKey(self.derive_child_public_key(index, is_change, network, secp)?);
        Ok(match purpose {
            Purpose::Legacy => Address::p2pkh(public_key.pubkey_hash(), network),
            Purpose::NestedSegwit => Address::p2shwpkh(&public_key, network),
            Purpose::NativeSegwit => Address::p2wpkh(&public_key, network),
        })
    }
}

impl FromStr for ExtPub {
    type Err = XpubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode(s)?;
        Ok(ExtPub(s.to_string()))
    }
}

impl TryFrom<String> for ExtPub {
    type Error = XpubError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        decode(&value)?;
        Ok(ExtPub(value))
    }
}

impl From<ExtPub> for String {
    fn from(ext_pub: ExtPub) -> String {
        ext_pub.0
    }
}

impl fmt::Display for ExtPub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
