//! Candidate fee rates for building the same transaction at several fee levels

use serde::{Deserialize, Serialize};
use thiserror::Error;

const MAX_FEE_RATE: f64 = 1e6;
const MAX_COUNT: usize = 100_000;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FeeError {
    #[error("Fee range must satisfy 0 <= min < max <= {MAX_FEE_RATE}, got [{min}, {max}]")]
    InvalidRange { min: f64, max: f64 },

    #[error("Sample count must be between 2 and {MAX_COUNT}, got {0}")]
    InvalidCount(usize),

    #[error("Log scale sampling requires a positive minimum")]
    ZeroLogMinimum,
}

/// Fee-rate sampler in sat/vB.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeeSampler {
    pub min: f64,
    pub max: f64,
    pub count: usize,
    pub log_scale: bool,
}

impl Default for FeeSampler {
    fn default() -> Self {
        Self {
            min: 1.0,
            max: 10_000.0,
            count: 100,
            log_scale: true,
        }
    }
}

impl FeeSampler {
    pub fn validate(&self) -> Result<(), FeeError> {
        if !(self.min.is_finite() && self.max.is_finite())
            || self.min < 0.0
            || self.min >= self.max
            || self.max > MAX_FEE_RATE
        {
            return Err(FeeError::InvalidRange {
                min: self.min,
                max: self.max,
            });
        }
        if !(2..=MAX_COUNT).contains(&self.count) {
            return Err(FeeError::InvalidCount(self.count));
        }
        if self.log_scale && self.min == 0.0 {
            return Err(FeeError::ZeroLogMinimum);
        }
        Ok(())
    }

    /// Materialize `count` rates from `min` to `max` inclusive.
    ///
    /// Log scale yields a geometric sequence, otherwise an arithmetic one.
    /// The last element is exactly `max`.
    pub fn sample(&self) -> Result<Vec<f64>, FeeError> {
        self.validate()?;
        let steps = (self.count - 1) as f64;
        let mut rates: Vec<f64> = if self.log_scale {
            let factor = (self.max / self.min).powf(1.0 / steps);
            (0..self.count)
                .map(|i| self.min * factor.powi(i as i32))
                .collect()
        } else {
            let step = (self.max - self.min) / steps;
            (0..self.count).map(|i| self.min + step * i as f64).collect()
        };
        if let Some(last) = rates.last_mut() {
            *last = self.max;
        }
        Ok(rates)
    }
}
