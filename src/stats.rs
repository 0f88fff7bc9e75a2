//! Robust statistics used by the session scorer.
//!
//! # Percentile
//! For `n` sorted values and percentile `p`, the index is `idx = p/100 · n`.
//! An integral index averages the elements at `idx-1` and `idx` (0-based);
//! a fractional index takes the element at `floor(idx)`. An index below 1
//! would read before the first element and is reported as
//! [`StatsError::IndexUnderflow`].
//!
//! # Bowley Skewness
//! With Q1 = P20, Q2 = P50 and Q3 = P80:
//! skew = (Q1 + Q3 - 2·Q2) / (Q3 - Q1)
//!
//! Beacon intervals sit in a tight symmetric band (skew ≈ 0); human-driven
//! traffic is bursty with a long tail (|skew| → 1). Flat or one-sided
//! quartiles are reported as 0 instead of dividing by a zero spread.
//!
//! # MADM
//! Median absolute deviation from the median, a dispersion measure that a
//! handful of outliers cannot drag around.

use statrs::statistics::{Data, Median};

use crate::error::StatsError;

/// Lower quartile percentile used for Bowley skew.
pub const LOW_PERCENTILE: f64 = 20.0;
/// Middle percentile used for Bowley skew.
pub const MID_PERCENTILE: f64 = 50.0;
/// Upper quartile percentile used for Bowley skew.
pub const HIGH_PERCENTILE: f64 = 80.0;

fn sorted(values: &[f64]) -> Result<Vec<f64>, StatsError> {
    if values.is_empty() {
        return Err(StatsError::EmptySample);
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    Ok(sorted)
}

/// Returns the `p`-th percentile of `values`.
pub fn percentile(values: &[f64], p: f64) -> Result<f64, StatsError> {
    if !(0.0..=100.0).contains(&p) {
        return Err(StatsError::InvalidPercentile(p));
    }
    let sorted = sorted(values)?;
    let len = sorted.len();
    let index = p / 100.0 * len as f64;

    if index < 1.0 {
        return Err(StatsError::IndexUnderflow {
            percentile: p,
            len,
            index,
        });
    }

    let whole = index.floor() as usize;
    if index == index.floor() {
        if whole >= len {
            return Err(StatsError::IndexOverflow { percentile: p, len });
        }
        Ok((sorted[whole - 1] + sorted[whole]) / 2.0)
    } else {
        Ok(sorted[whole])
    }
}

/// Returns the median, averaging the two middle values for even lengths.
pub fn median(values: &[f64]) -> Result<f64, StatsError> {
    if values.is_empty() {
        return Err(StatsError::EmptySample);
    }
    Ok(Data::new(values.to_vec()).median())
}

/// Median absolute deviation from the median.
pub fn madm(values: &[f64]) -> Result<f64, StatsError> {
    let center = median(values)?;
    let deviations: Vec<f64> = values.iter().map(|v| (v - center).abs()).collect();
    median(&deviations)
}

/// The three quantiles Bowley skew is built from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quartiles {
    pub low: f64,
    pub mid: f64,
    pub high: f64,
}

impl Quartiles {
    pub fn of(values: &[f64]) -> Result<Self, StatsError> {
        Ok(Self {
            low: percentile(values, LOW_PERCENTILE)?,
            mid: percentile(values, MID_PERCENTILE)?,
            high: percentile(values, HIGH_PERCENTILE)?,
        })
    }

    pub fn bowley_skew(&self) -> f64 {
        let numerator = self.low + self.high - 2.0 * self.mid;
        let denominator = self.high - self.low;

        if numerator == 0.0 || self.mid == self.low || self.mid == self.high {
            0.0
        } else {
            numerator / denominator
        }
    }
}

/// Quartile-based skewness in `[-1, 1]` for well-formed input.
pub fn bowley_skew(values: &[f64]) -> Result<f64, StatsError> {
    Ok(Quartiles::of(values)?.bowley_skew())
}

/// Widens integer byte counts for the float routines.
pub fn to_f64(values: &[u64]) -> Vec<f64> {
    values.iter().map(|&v| v as f64).collect()
}
