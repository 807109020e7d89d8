//! BIP-44 style derivation path codec
//!
//! A wallet path always has five levels: `purpose'/coin'/account'/change/index`.
//! The first three are hardened, the last two are not.

use bitcoin::bip32::{self, ChildNumber};
use bitcoin::{Network, NetworkKind};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// First index reserved for hardened derivation
const HARDENED_OFFSET: u32 = 1 << 31;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PathError {
    #[error("Expected 5 path elements, got {0}")]
    WrongDepth(usize),

    #[error("Invalid path element: {0:?}")]
    InvalidElement(String),

    #[error("Unknown purpose: {0}")]
    UnknownPurpose(u32),

    #[error("Coin type {0} does not match a known network")]
    UnknownCoinType(u32),

    #[error("The {0} level must be hardened")]
    NotHardened(&'static str),

    #[error("The {0} level must not be hardened")]
    UnexpectedHardened(&'static str),

    #[error("Change level must be 0 or 1, got {0}")]
    InvalidChange(u32),

    #[error("Index {0} is out of the non-hardened range")]
    IndexOutOfRange(u32),

    #[error("Path does not round-trip: {0}")]
    Inconsistent(String),
}

/// Address family encoded in the first path level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum Purpose {
    /// BIP-44, P2PKH
    Legacy,
    /// BIP-49, P2SH-P2WPKH
    NestedSegwit,
    /// BIP-84, P2WPKH
    NativeSegwit,
}

impl Purpose {
    /// All purposes, oldest first
    pub const ALL: [Purpose; 3] = [Purpose::Legacy, Purpose::NestedSegwit, Purpose::NativeSegwit];

    /// Numeric BIP-43 purpose
    pub fn number(self) -> u32 {
        match self {
            Purpose::Legacy => 44,
            Purpose::NestedSegwit => 49,
            Purpose::NativeSegwit => 84,
        }
    }
}

impl TryFrom<u32> for Purpose {
    type Error = PathError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            44 => Ok(Purpose::Legacy),
            49 => Ok(Purpose::NestedSegwit),
            84 => Ok(Purpose::NativeSegwit),
            other => Err(PathError::UnknownPurpose(other)),
        }
    }
}

impl From<Purpose> for u32 {
    fn from(purpose: Purpose) -> u32 {
        purpose.number()
    }
}

impl fmt::Display for Purpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.number())
    }
}

/// BIP-44 coin type for a network
///
/// Mainnet uses 0; every test network shares 1.
pub fn coin_type_for(network: Network) -> u32 {
    match network {
        Network::Bitcoin => 0,
        _ => 1,
    }
}

/// A fully specified wallet derivation path.
///
/// Fields are declared in sort order so the derived `Ord` sorts by
/// (coin type, purpose, account, change, index).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DerivationPath {
    coin_type: u32,
    purpose: Purpose,
    account_number: u32,
    is_change: bool,
    index: u32,
}

impl DerivationPath {
    /// Build a path from its components, validating every level.
    pub fn new(
        purpose: Purpose,
        coin_type: u32,
        account_number: u32,
        is_change: bool,
        index: u32,
    ) -> Result<Self, PathError> {
        if coin_type > 1 {
            return Err(PathError::UnknownCoinType(coin_type));
        }
        if account_number >= HARDENED_OFFSET {
            return Err(PathError::IndexOutOfRange(account_number));
        }
        if index >= HARDENED_OFFSET {
            return Err(PathError::IndexOutOfRange(index));
        }
        Ok(Self {
            coin_type,
            purpose,
            account_number,
            is_change,
            index,
        })
    }

    /// Build a path for a network instead of a raw coin type.
    pub fn for_network(
        purpose: Purpose,
        network: Network,
        account_number: u32,
        is_change: bool,
        index: u32,
    ) -> Result<Self, PathError> {
        Self::new(purpose, coin_type_for(network), account_number, is_change, index)
    }

    pub fn purpose(&self) -> Purpose {
        self.purpose
    }

    pub fn coin_type(&self) -> u32 {
        self.coin_type
    }

    pub fn account_number(&self) -> u32 {
        self.account_number
    }

    pub fn is_change(&self) -> bool {
        self.is_change
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    /// Mainnet or testnet family implied by the coin type
    pub fn network_family(&self) -> NetworkKind {
        if self.coin_type == 0 {
            NetworkKind::Main
        } else {
            NetworkKind::Test
        }
    }

    /// Whether this path belongs to `network`
    pub fn matches_network(&self, network: Network) -> bool {
        self.coin_type == coin_type_for(network)
    }

    /// Same account and branch, different index
    pub fn with_index(&self, index: u32) -> Result<Self, PathError> {
        Self::new(
            self.purpose,
            self.coin_type,
            self.account_number,
            self.is_change,
            index,
        )
    }

    /// Serialize to the canonical string, rejecting values that do not
    /// parse back to themselves.
    pub fn serialize(&self) -> Result<String, PathError> {
        let s = self.to_string();
        let parsed: DerivationPath = s.parse()?;
        if parsed != *self {
            return Err(PathError::Inconsistent(s));
        }
        Ok(s)
    }

    /// Convert to a rust-bitcoin path rooted at the master key
    pub fn to_bip32(&self) -> bip32::DerivationPath {
        bip32::DerivationPath::from(vec![
            ChildNumber::Hardened {
                index: self.purpose.number(),
            },
            ChildNumber::Hardened {
                index: self.coin_type,
            },
            ChildNumber::Hardened {
                index: self.account_number,
            },
            ChildNumber::Normal {
                index: u32::from(self.is_change),
            },
            ChildNumber::Normal { index: self.index },
        ])
    }
}

impl fmt::Display for DerivationPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}'/{}'/{}'/{}/{}",
            self.purpose.number(),
            self.coin_type,
            self.account_number,
            u32::from(self.is_change),
            self.index
        )
    }
}

/// Split one path element into its value and hardened flag.
fn parse_element(element: &str) -> Result<(u32, bool), PathError> {
    let (digits, hardened) = match element.strip_suffix(['\'', 'h', 'H']) {
        Some(stripped) => (stripped, true),
        None => (element, false),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(PathError::InvalidElement(element.to_string()));
    }
    let value: u32 = digits
        .parse()
        .map_err(|_| PathError::InvalidElement(element.to_string()))?;
    if value >= HARDENED_OFFSET {
        return Err(PathError::IndexOutOfRange(value));
    }
    Ok((value, hardened))
}

impl FromStr for DerivationPath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let body = s.strip_prefix("m/").unwrap_or(s);
        let elements: Vec<&str> = body.split('/').collect();
        if elements.len() != 5 {
            return Err(PathError::WrongDepth(elements.len()));
        }

        let (purpose, hardened) = parse_element(elements[0])?;
        if !hardened {
            return Err(PathError::NotHardened("purpose"));
        }
        let purpose = Purpose::try_from(purpose)?;

        let (coin_type, hardened) = parse_element(elements[1])?;
        if !hardened {
            return Err(PathError::NotHardened("coin type"));
        }
        if coin_type > 1 {
            return Err(PathError::UnknownCoinType(coin_type));
        }

        let (account_number, hardened) = parse_element(elements[2])?;
        if !hardened {
            return Err(PathError::NotHardened("account"));
        }

        let (change, hardened) = parse_element(elements[3])?;
        if hardened {
            return Err(PathError::UnexpectedHardened("change"));
        }
        let is_change = match change {
            0 => false,
            1 => true,
            other => return Err(PathError::InvalidChange(other)),
        };

        let (index, hardened) = parse_element(elements[4])?;
        if hardened {
            return Err(PathError::UnexpectedHardened("index"));
        }

        Self::new(purpose, coin_type, account_number, is_change, index)
    }
}

impl Serialize for DerivationPath {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for DerivationPath {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
