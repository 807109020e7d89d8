//! Discovery configuration

use crate::DiscoveryError;
use farvault_core::GapLimits;
use serde::{Deserialize, Serialize};

/// Scan limits for [`crate::Discovery`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Consecutive unused addresses that end a branch scan
    pub gap_limit: u32,
    /// Consecutive unused accounts that end an account walk
    pub gap_account_limit: u32,
    /// Scan the change branch even when no receive address was used
    pub force_fetch_change: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        let limits = GapLimits::default();
        Self {
            gap_limit: limits.gap_limit,
            gap_account_limit: limits.gap_account_limit,
            force_fetch_change: false,
        }
    }
}

impl DiscoveryConfig {
    pub fn limits(&self) -> GapLimits {
        GapLimits {
            gap_limit: self.gap_limit,
            gap_account_limit: self.gap_account_limit,
        }
    }

    pub fn validate(&self) -> Result<(), DiscoveryError> {
        if self.gap_limit == 0 {
            return Err(DiscoveryError::Config("gap_limit must be at least 1".into()));
        }
        if self.gap_account_limit == 0 {
            return Err(DiscoveryError::Config(
                "gap_account_limit must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
