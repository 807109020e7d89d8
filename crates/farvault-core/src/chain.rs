//! Gap-limit rules over sets of used derivation paths
//!
//! Discovery stops at the first `gap_limit` unused addresses of a branch and
//! the first `gap_account_limit` unused accounts of a purpose. These helpers
//! apply the same rules to a stored set of used paths: reject sets discovery
//! could never have produced, pick the account new addresses belong to, and
//! compute the next free path.

use crate::paths::{coin_type_for, DerivationPath, PathError, Purpose};
use bitcoin::Network;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("Invalid path: {0}")]
    Path(#[from] PathError),

    #[error("Path {0} is unreachable under the configured gap limits")]
    UnreachablePath(DerivationPath),

    #[error("Used paths span several accounts; purpose and account number are required")]
    AmbiguousBranch,

    #[error("Skip must be below the gap limit {gap_limit}, got {skip}")]
    InvalidSkip { skip: u32, gap_limit: u32 },

    #[error("Gap limits must be at least 1")]
    InvalidLimits,
}

/// How far discovery looks past the last used address and account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GapLimits {
    pub gap_limit: u32,
    pub gap_account_limit: u32,
}

impl Default for GapLimits {
    fn default() -> Self {
        Self {
            gap_limit: 20,
            gap_account_limit: 1,
        }
    }
}

/// Parse a list of path strings.
pub fn parse_all<S: AsRef<str>>(paths: &[S]) -> Result<Vec<DerivationPath>, ChainError> {
    paths
        .iter()
        .map(|p| p.as_ref().parse().map_err(ChainError::from))
        .collect()
}

impl GapLimits {
    pub fn validate(&self) -> Result<(), ChainError> {
        if self.gap_limit == 0 || self.gap_account_limit == 0 {
            return Err(ChainError::InvalidLimits);
        }
        Ok(())
    }

    /// Deduplicate, sort and check reachability of a set of used paths.
    ///
    /// Within each (coin type, purpose) run, account numbers may not jump by
    /// more than `gap_account_limit` and indices within one account branch
    /// may not jump by more than `gap_limit`, both counted from -1.
    pub fn normalize(&self, used: &[DerivationPath]) -> Result<Vec<DerivationPath>, ChainError> {
        self.validate()?;
        let sorted: Vec<DerivationPath> = used.iter().copied().collect::<BTreeSet<_>>().into_iter().collect();

        let mut run: Option<(u32, Purpose)> = None;
        let mut last_account: i64 = -1;
        let mut branch: Option<(u32, bool)> = None;
        let mut last_index: i64 = -1;

        for path in &sorted {
            let run_key = (path.coin_type(), path.purpose());
            if run != Some(run_key) {
                run = Some(run_key);
                last_account = -1;
                branch = None;
            }

            let account = i64::from(path.account_number());
            if account != last_account {
                if account - last_account > i64::from(self.gap_account_limit) {
                    return Err(ChainError::UnreachablePath(*path));
                }
                last_account = account;
            }

            let branch_key = (path.account_number(), path.is_change());
            if branch != Some(branch_key) {
                branch = Some(branch_key);
                last_index = -1;
            }
            let index = i64::from(path.index());
            if index - last_index > i64::from(self.gap_limit) {
                return Err(ChainError::UnreachablePath(*path));
            }
            last_index = index;
        }

        Ok(sorted)
    }

    /// Next unused path on the default account for `network`.
    ///
    /// The index is `last + skip + 1`, or `skip` on a branch never used.
    /// Prereserved paths are stepped over while the result stays within
    /// `gap_limit` of the last used index.
    pub fn next_path(
        &self,
        used: &[DerivationPath],
        prereserved: &[DerivationPath],
        is_change: bool,
        skip: u32,
        network: Network,
    ) -> Result<DerivationPath, ChainError> {
        if skip >= self.gap_limit {
            return Err(ChainError::InvalidSkip {
                skip,
                gap_limit: self.gap_limit,
            });
        }
        let coin_type = coin_type_for(network);
        let on_network: Vec<DerivationPath> = used
            .iter()
            .filter(|p| p.coin_type() == coin_type)
            .copied()
            .collect();
        let normalized = self.normalize(&on_network)?;

        let (purpose, account) = default_account(&normalized);
        let last = last_used_path(&normalized, Some(purpose), Some(account), is_change)?
            .map(|p| i64::from(p.index()))
            .unwrap_or(-1);

        let reserved: BTreeSet<i64> = prereserved
            .iter()
            .filter(|p| {
                p.coin_type() == coin_type
                    && p.purpose() == purpose
                    && p.account_number() == account
                    && p.is_change() == is_change
            })
            .map(|p| i64::from(p.index()))
            .collect();

        let gap_limit = i64::from(self.gap_limit);
        let mut candidate = last + i64::from(skip) + 1;
        while reserved.contains(&candidate) && candidate + 1 - last <= gap_limit {
            candidate += 1;
        }

        let index = u32::try_from(candidate).map_err(|_| PathError::IndexOutOfRange(u32::MAX))?;
        Ok(DerivationPath::new(purpose, coin_type, account, is_change, index)?)
    }
}

/// Purpose and account new receive addresses should come from.
///
/// Prefers native segwit, then nested segwit, then legacy; within the
/// chosen purpose, the highest used account. An empty set yields
/// native segwit account 0.
pub fn default_account(used: &[DerivationPath]) -> (Purpose, u32) {
    let Some(purpose) = used.iter().map(|p| p.purpose()).max() else {
        return (Purpose::NativeSegwit, 0);
    };
    let account = used
        .iter()
        .filter(|p| p.purpose() == purpose)
        .map(|p| p.account_number())
        .max()
        .unwrap_or(0);
    (purpose, account)
}

/// Highest-index used path on one branch, or `None` if the branch is unused.
///
/// When `used` spans more than one (purpose, account) both `purpose` and
/// `account_number` are required.
pub fn last_used_path(
    used: &[DerivationPath],
    purpose: Option<Purpose>,
    account_number: Option<u32>,
    is_change: bool,
) -> Result<Option<DerivationPath>, ChainError> {
    let accounts: BTreeSet<(Purpose, u32)> = used
        .iter()
        .map(|p| (p.purpose(), p.account_number()))
        .collect();
    if accounts.len() > 1 && (purpose.is_none() || account_number.is_none()) {
        return Err(ChainError::AmbiguousBranch);
    }

    Ok(used
        .iter()
        .filter(|p| purpose.map_or(true, |purpose| p.purpose() == purpose))
        .filter(|p| account_number.map_or(true, |account| p.account_number() == account))
        .filter(|p| p.is_change() == is_change)
        .max_by_key(|p| p.index())
        .copied())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths(list: &[&str]) -> Vec<DerivationPath> {
        parse_all(list).unwrap()
    }

    #[test]
    fn test_normalize_sorts_and_dedups() {
        let limits = GapLimits::default();
        let used = paths(&[
            "84'/1'/0'/1/0",
            "m/84'/1'/0'/0/1",
            "84h/1h/0h/0/1",
            "44'/1'/0'/0/0",
            "84'/1'/0'/0/0",
        ]);
        let normalized = limits.normalize(&used).unwrap();
        let strings: Vec<String> = normalized.iter().map(|p| p.to_string()).collect();
        assert_eq!(
            strings,
            vec!["44'/1'/0'/0/0", "84'/1'/0'/0/0", "84'/1'/0'/0/1", "84'/1'/0'/1/0"]
        );
    }

    #[test]
    fn test_normalize_index_gap() {
        let limits = GapLimits::default();
        assert!(limits.normalize(&paths(&["84'/1'/0'/0/19"])).is_ok());
        assert!(limits.normalize(&paths(&["84'/1'/0'/0/0", "84'/1'/0'/0/20"])).is_ok());

        let far = paths(&["84'/1'/0'/0/20"]);
        assert_eq!(limits.normalize(&far), Err(ChainError::UnreachablePath(far[0])));

        let gap = paths(&["84'/1'/0'/0/0", "84'/1'/0'/0/21"]);
        assert_eq!(limits.normalize(&gap), Err(ChainError::UnreachablePath(gap[1])));
    }

    #[test]
    fn test_normalize_branches_counted_separately() {
        let limits = GapLimits {
            gap_limit: 5,
            gap_account_limit: 1,
        };
        // Change branch restarts from -1 even when receive went further
        let used = paths(&["84'/1'/0'/0/0", "84'/1'/0'/0/5", "84'/1'/0'/1/4"]);
        assert!(limits.normalize(&used).is_ok());
        let used = paths(&["84'/1'/0'/0/0", "84'/1'/0'/0/5", "84'/1'/0'/1/5"]);
        assert!(limits.normalize(&used).is_err());
    }

    #[test]
    fn test_normalize_account_gap() {
        let limits = GapLimits::default();
        assert!(limits
            .normalize(&paths(&["84'/1'/0'/0/0", "84'/1'/1'/0/0"]))
            .is_ok());
        assert!(limits.normalize(&paths(&["84'/1'/1'/0/0"])).is_err());
        assert!(limits
            .normalize(&paths(&["84'/1'/0'/0/0", "84'/1'/2'/0/0"]))
            .is_err());

        // Each purpose is its own run
        assert!(limits
            .normalize(&paths(&["44'/1'/0'/0/0", "84'/1'/0'/0/0", "84'/1'/1'/0/3"]))
            .is_ok());

        let wide = GapLimits {
            gap_limit: 20,
            gap_account_limit: 2,
        };
        assert!(wide.normalize(&paths(&["84'/1'/1'/0/0"])).is_ok());
    }

    #[test]
    fn test_default_account() {
        assert_eq!(default_account(&[]), (Purpose::NativeSegwit, 0));
        assert_eq!(
            default_account(&paths(&["44'/1'/3'/0/0", "49'/1'/0'/0/0", "49'/1'/1'/1/0"])),
            (Purpose::NestedSegwit, 1)
        );
        assert_eq!(
            default_account(&paths(&["44'/1'/0'/0/0", "44'/1'/1'/0/0"])),
            (Purpose::Legacy, 1)
        );
    }

    #[test]
    fn test_last_used_path() {
        let used = paths(&["84'/1'/0'/0/0", "84'/1'/0'/0/4", "84'/1'/0'/1/2"]);
        assert_eq!(
            last_used_path(&used, None, None, false).unwrap(),
            Some(used[1])
        );
        assert_eq!(last_used_path(&used, None, None, true).unwrap(), Some(used[2]));

        let fresh = paths(&["84'/1'/0'/0/0"]);
        assert_eq!(last_used_path(&fresh, None, None, true).unwrap(), None);

        let mixed = paths(&["84'/1'/0'/0/0", "84'/1'/1'/0/7", "44'/1'/0'/0/2"]);
        assert_eq!(
            last_used_path(&mixed, None, None, false),
            Err(ChainError::AmbiguousBranch)
        );
        assert_eq!(
            last_used_path(&mixed, Some(Purpose::NativeSegwit), None, false),
            Err(ChainError::AmbiguousBranch)
        );
        assert_eq!(
            last_used_path(&mixed, Some(Purpose::NativeSegwit), Some(1), false).unwrap(),
            Some(mixed[1])
        );

        // A purpose alone is not enough, even when it names a single account
        let two_purposes = paths(&["84'/1'/0'/0/3", "44'/1'/0'/0/2"]);
        assert_eq!(
            last_used_path(&two_purposes, Some(Purpose::NativeSegwit), None, false),
            Err(ChainError::AmbiguousBranch)
        );
        assert_eq!(
            last_used_path(&two_purposes, None, Some(0), false),
            Err(ChainError::AmbiguousBranch)
        );
        assert_eq!(
            last_used_path(&two_purposes, Some(Purpose::Legacy), Some(0), false).unwrap(),
            Some(two_purposes[1])
        );
        assert_eq!(
            last_used_path(&two_purposes, Some(Purpose::Legacy), Some(0), true).unwrap(),
            None
        );
    }

    #[test]
    fn test_next_path_basic() {
        let limits = GapLimits::default();
        let next = limits.next_path(&[], &[], false, 0, Network::Testnet).unwrap();
        assert_eq!(next.to_string(), "84'/1'/0'/0/0");

        let used = paths(&["84'/1'/0'/0/0", "84'/1'/0'/0/1"]);
        let next = limits.next_path(&used, &[], false, 0, Network::Testnet).unwrap();
        assert_eq!(next.to_string(), "84'/1'/0'/0/2");
        let next = limits.next_path(&used, &[], true, 0, Network::Testnet).unwrap();
        assert_eq!(next.to_string(), "84'/1'/0'/1/0");
        let next = limits.next_path(&used, &[], false, 3, Network::Testnet).unwrap();
        assert_eq!(next.to_string(), "84'/1'/0'/0/5");

        // Mainnet ignores testnet history
        let next = limits.next_path(&used, &[], false, 0, Network::Bitcoin).unwrap();
        assert_eq!(next.to_string(), "84'/0'/0'/0/0");
    }

    #[test]
    fn test_next_path_skips_prereserved() {
        let limits = GapLimits::default();
        let used = paths(&["49'/1'/0'/0/0"]);
        let reserved = paths(&["49'/1'/0'/0/1", "49'/1'/0'/0/2", "84'/1'/0'/0/3"]);
        let next = limits.next_path(&used, &reserved, false, 0, Network::Testnet).unwrap();
        assert_eq!(next.to_string(), "49'/1'/0'/0/3");
    }

    #[test]
    fn test_next_path_bounded_by_gap_limit() {
        let limits = GapLimits {
            gap_limit: 3,
            gap_account_limit: 1,
        };
        let reserved = paths(&["84'/1'/0'/0/0", "84'/1'/0'/0/1", "84'/1'/0'/0/2", "84'/1'/0'/0/3"]);
        let next = limits.next_path(&[], &reserved, false, 0, Network::Regtest).unwrap();
        assert_eq!(next.index(), 2);

        for skip in 0..3 {
            let next = limits.next_path(&[], &reserved, false, skip, Network::Regtest).unwrap();
            assert!(i64::from(next.index()) + 1 <= 3);
        }
    }

    #[test]
    fn test_next_path_validates_input() {
        let limits = GapLimits::default();
        assert_eq!(
            limits.next_path(&[], &[], false, 20, Network::Testnet),
            Err(ChainError::InvalidSkip {
                skip: 20,
                gap_limit: 20
            })
        );
        let unreachable = paths(&["84'/1'/0'/0/40"]);
        assert!(matches!(
            limits.next_path(&unreachable, &[], false, 0, Network::Testnet),
            Err(ChainError::UnreachablePath(_))
        ));
        let zero = GapLimits {
            gap_limit: 0,
            gap_account_limit: 1,
        };
        assert_eq!(zero.normalize(&[]), Err(ChainError::InvalidLimits));
    }
}
