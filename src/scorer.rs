//! Session scoring.
//!
//! Every eligible session gets two families of sub-scores, each in `[0, 1]`
//! where 1 means "looks like a beacon":
//!
//! ## Timing
//! - **skew**: `1 - |bowley(deltas)|`. Implants sleep for a fixed period, so
//!   their inter-arrival distribution is symmetric.
//! - **dispersion**: `max(0, 1 - madm(deltas) / J)`. Jitter above `J`
//!   seconds (default 30) scores 0.
//! - **connection rate**: `min(1, 10·n / (duration / 90s))`.
//!
//! ## Size
//! - **skew**: `1 - |bowley(sent)|`; received sizes are not scored.
//! - **dispersion**: `max(0, 1 - m/128)` where `m = max(0, 1 - madm(sent)/1024)`.
//! - **smallness**: `max(0, 1 - median(sent)/K)`, check-ins are tiny
//!   (`K` defaults to 8192).
//!
//! Each family is a weighted average of its three terms and the overall
//! score is the weighted average of the two families. With size analysis
//! disabled the overall score is the timing score.

use chrono::{DateTime, Utc};
use statrs::statistics::{Data, Distribution};

use crate::config::EngineConfig;
use crate::error::{ScoringError, StatsError};
use crate::record::SessionKey;
use crate::session::Session;
use crate::stats::{bowley_skew, madm, median, to_f64};

/// Connection-rate multiplier applied to the observation count.
const RATE_MULTIPLIER: f64 = 10.0;

/// Trait for session scoring strategies.
pub trait Scorer: Send + Sync {
    /// Scores one session that already passed [`Scorer::eligibility`].
    fn score(&self, session: &Session) -> Result<ScoredSession, ScoringError>;

    /// Decides whether a session is worth scoring at all.
    fn eligibility(&self, session: &Session) -> Eligibility;

    /// Decides whether a scored session is reported.
    fn retains(&self, scored: &ScoredSession) -> bool;
}

/// Outcome of the pre-scoring gate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Eligibility {
    Eligible,
    TooFewConnections { count: usize, required: usize },
    TooShort { hours: f64, required: f64 },
}

impl Eligibility {
    pub fn is_eligible(&self) -> bool {
        matches!(self, Self::Eligible)
    }
}

/// Timing sub-scores.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimingScores {
    pub skew: f64,
    pub dispersion: f64,
    pub connection_rate: f64,
    pub combined: f64,
}

/// Payload-size sub-scores.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SizeScores {
    pub skew: f64,
    pub dispersion: f64,
    pub smallness: f64,
    pub combined: f64,
}

/// Descriptive interval statistics, for analyst context only.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntervalSummary {
    pub mean_secs: f64,
    pub std_dev_secs: f64,
    /// Coefficient of variation; `None` when the mean is zero.
    pub cv: Option<f64>,
}

impl IntervalSummary {
    pub fn of(deltas: &[f64]) -> Self {
        let data = Data::new(deltas.to_vec());
        let mean = data.mean().unwrap_or(0.0);
        let std_dev = data.std_dev().unwrap_or(0.0);

        Self {
            mean_secs: mean,
            std_dev_secs: std_dev,
            cv: (mean > 0.0).then(|| std_dev / mean),
        }
    }
}

/// A session together with its scores.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredSession {
    pub key: SessionKey,
    pub connection_count: usize,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub duration_hours: f64,
    pub score: f64,
    pub timing: TimingScores,
    /// `None` when size analysis is disabled.
    pub size: Option<SizeScores>,
    pub intervals: IntervalSummary,
}

/// `Σ(wᵢ·vᵢ) / Σwᵢ` over `(weight, value)` pairs. Zero-weight terms are
/// skipped so a disabled term cannot leak a NaN; returns 0 when no weight
/// is positive.
pub fn weighted_average(terms: &[(f64, f64)]) -> f64 {
    let (sum, total) = terms
        .iter()
        .filter(|(weight, _)| *weight != 0.0)
        .fold((0.0, 0.0), |(sum, total), (weight, value)| {
            (sum + weight * value, total + weight)
        });

    if total == 0.0 {
        0.0
    } else {
        sum / total
    }
}

/// Closed-form statistical scorer.
#[derive(Debug, Clone)]
pub struct SessionScorer {
    config: EngineConfig,
}

impl SessionScorer {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    fn timing_scores(&self, session: &Session) -> Result<TimingScores, ScoringError> {
        let tuning = &self.config.tuning;
        let weights = &self.config.weights;
        let deltas = session.deltas_secs();

        let skew_value = bowley_skew(&deltas).map_err(ScoringError::timing("bowley skew"))?;
        let skew = 1.0 - skew_value.abs();

        let madm_value = madm(&deltas).map_err(ScoringError::timing("madm"))?;
        let dispersion = (1.0 - madm_value / tuning.jitter_secs).max(0.0);

        let rate_divisor = session.duration_secs() / tuning.rate_window_secs;
        let connection_rate = if rate_divisor > 0.0 {
            (RATE_MULTIPLIER * session.len() as f64 / rate_divisor).min(1.0)
        } else {
            1.0
        };

        let combined = weighted_average(&[
            (weights.ts_skew, skew),
            (weights.ts_madm, dispersion),
            (weights.ts_conn, connection_rate),
        ]);

        Ok(TimingScores {
            skew,
            dispersion,
            connection_rate,
            combined,
        })
    }

    fn size_scores(&self, session: &Session) -> Result<SizeScores, ScoringError> {
        let tuning = &self.config.tuning;
        let weights = &self.config.weights;
        let sent = to_f64(&session.sent_sizes());

        let skew_value = bowley_skew(&sent).map_err(ScoringError::size("bowley skew"))?;
        let skew = 1.0 - skew_value.abs();

        let sent_madm = madm(&sent).map_err(ScoringError::size("madm"))?;
        let magnitude = (1.0 - sent_madm / tuning.size_madm_bytes).max(0.0);
        let dispersion = (1.0 - magnitude / tuning.size_dispersion_divisor).max(0.0);

        let sent_median = median(&sent).map_err(ScoringError::size("median"))?;
        let smallness = (1.0 - sent_median / tuning.smallness_bytes).max(0.0);

        let combined = weighted_average(&[
            (weights.ds_skew, skew),
            (weights.ds_madm, dispersion),
            (weights.ds_small, smallness),
        ]);

        Ok(SizeScores {
            skew,
            dispersion,
            smallness,
            combined,
        })
    }
}

impl Scorer for SessionScorer {
    fn score(&self, session: &Session) -> Result<ScoredSession, ScoringError> {
        let (first_seen, last_seen) = match (session.first_seen(), session.last_seen()) {
            (Some(first), Some(last)) => (first, last),
            _ => return Err(ScoringError::timing("session bounds")(StatsError::EmptySample)),
        };

        let timing = self.timing_scores(session)?;
        let size = if self.config.no_bytes {
            None
        } else {
            Some(self.size_scores(session)?)
        };

        let data_weight = self.config.data_weight();
        let score = match size {
            Some(size) if data_weight != 0.0 => weighted_average(&[
                (self.config.weights.time, timing.combined),
                (data_weight, size.combined),
            ]),
            _ => timing.combined,
        };

        let deltas = session.deltas_secs();

        Ok(ScoredSession {
            key: session.key.clone(),
            connection_count: session.len(),
            first_seen,
            last_seen,
            duration_hours: session.duration_hours(),
            score,
            timing,
            size,
            intervals: IntervalSummary::of(&deltas),
        })
    }

    fn eligibility(&self, session: &Session) -> Eligibility {
        if session.len() <= self.config.min_connections {
            return Eligibility::TooFewConnections {
                count: session.len(),
                required: self.config.min_connections + 1,
            };
        }
        let hours = session.duration_hours();
        if hours < self.config.min_duration_hours {
            return Eligibility::TooShort {
                hours,
                required: self.config.min_duration_hours,
            };
        }
        Eligibility::Eligible
    }

    fn retains(&self, scored: &ScoredSession) -> bool {
        self.config.debug || scored.score > self.config.min_score
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Axis;
    use crate::record::{ConnectionRecord, KeyOptions};
    use crate::session::group_records;
    use chrono::TimeZone;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn base() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    /// Builds one session from explicit offsets (seconds) and sent sizes.
    fn session_from(offsets: &[i64], sent: &[u64]) -> Session {
        let records = offsets.iter().zip(sent).map(|(offset, bytes)| {
            ConnectionRecord::new(
                base() + chrono::Duration::seconds(*offset),
                "alice",
                "evil.example",
                *bytes,
                0,
            )
        });
        group_records(records, KeyOptions::default())
            .into_values()
            .next()
            .unwrap()
    }

    fn regular_session(count: usize, interval: i64, sent: u64) -> Session {
        let offsets: Vec<i64> = (0..count as i64).map(|i| i * interval).collect();
        session_from(&offsets, &vec![sent; count])
    }

    fn test_config() -> EngineConfig {
        EngineConfig {
            min_duration_hours: 0.0,
            ..EngineConfig::default()
        }
    }

    #[test]
    fn test_weighted_average() {
        assert_eq!(weighted_average(&[(1.0, 1.0), (1.0, 0.0)]), 0.5);
        assert_eq!(weighted_average(&[(3.0, 1.0), (1.0, 0.0)]), 0.75);
        assert_eq!(weighted_average(&[(1.0, 0.4), (0.0, f64::NAN)]), 0.4);
        assert_eq!(weighted_average(&[(0.0, 1.0)]), 0.0);
    }

    #[test]
    fn test_regular_beacon_scores_high() {
        let scorer = SessionScorer::new(test_config());
        let session = regular_session(40, 60, 100);
        assert!(scorer.eligibility(&session).is_eligible());

        let scored = scorer.score(&session).unwrap();

        assert_eq!(scored.timing.skew, 1.0);
        assert_eq!(scored.timing.dispersion, 1.0);
        assert_eq!(scored.timing.connection_rate, 1.0);
        assert_eq!(scored.timing.combined, 1.0);

        let size = scored.size.unwrap();
        assert_eq!(size.skew, 1.0);
        assert!((size.dispersion - (1.0 - 1.0 / 128.0)).abs() < 1e-12);
        assert!((size.smallness - (1.0 - 100.0 / 8192.0)).abs() < 1e-12);

        assert!(scored.score > 0.9, "score was {}", scored.score);
        assert_eq!(scored.connection_count, 40);
        assert!((scored.duration_hours - 39.0 / 60.0).abs() < 1e-12);
        assert_eq!(scored.intervals.mean_secs, 60.0);
        assert_eq!(scored.intervals.cv, Some(0.0));
        assert!(scorer.retains(&scored));
    }

    #[test]
    fn test_random_intervals_score_lower() {
        let scorer = SessionScorer::new(test_config());
        let regular = scorer.score(&regular_session(40, 60, 100)).unwrap();

        let mut rng = StdRng::seed_from_u64(0xBEAC0);
        let mut offsets = vec![0i64];
        for _ in 1..40 {
            let next = offsets.last().unwrap() + rng.random_range(1..=600);
            offsets.push(next);
        }
        let random = scorer
            .score(&session_from(&offsets, &[100; 40]))
            .unwrap();

        assert_eq!(random.timing.dispersion, 0.0);
        assert!(random.timing.combined <= 2.0 / 3.0 + 1e-12);
        assert!(random.score < regular.score);
    }

    #[test]
    fn test_jitter_above_tolerance_zeroes_dispersion() {
        let scorer = SessionScorer::new(test_config());
        // Repeating 10s / 60s / 110s gaps: median 60, MADM 50
        let offsets: Vec<i64> = (0..40)
            .map(|i| (i / 3) * 180 + [0, 10, 70][(i % 3) as usize])
            .collect();
        let scored = scorer.score(&session_from(&offsets, &[100; 40])).unwrap();
        assert_eq!(scored.timing.dispersion, 0.0);
    }

    #[test]
    fn test_connection_rate_saturates_at_one() {
        let config = EngineConfig {
            min_connections: 0,
            ..test_config()
        };
        let scorer = SessionScorer::new(config);

        // 10 points over 9000s: 10 * 10 / (9000 / 90) = 1
        let exact = scorer.score(&regular_session(10, 1000, 100)).unwrap();
        assert_eq!(exact.timing.connection_rate, 1.0);

        // 10 points over 4500s: ratio 2, clamped
        let dense = scorer.score(&regular_session(10, 500, 100)).unwrap();
        assert_eq!(dense.timing.connection_rate, 1.0);

        // 10 points over 18000s: ratio 0.5
        let sparse = scorer.score(&regular_session(10, 2000, 100)).unwrap();
        assert_eq!(sparse.timing.connection_rate, 0.5);
    }

    #[test]
    fn test_zero_data_weight_uses_timing_only() {
        let mut config = test_config();
        config.weights.data = 0.0;
        config.weights.ts_conn = 0.7;
        let scorer = SessionScorer::new(config);

        let offsets: Vec<i64> = (0..40).map(|i| i * 60 + (i * 7 % 5)).collect();
        let sent: Vec<u64> = (0..40).map(|i| 9000 + (i * 131 % 4000)).collect();
        let scored = scorer.score(&session_from(&offsets, &sent)).unwrap();

        assert!(scored.size.is_some());
        assert_eq!(scored.score, scored.timing.combined);
    }

    #[test]
    fn test_no_bytes_skips_size_scores() {
        let config = EngineConfig {
            no_bytes: true,
            ..test_config()
        };
        let scorer = SessionScorer::new(config);
        let scored = scorer.score(&regular_session(40, 60, 0)).unwrap();

        assert!(scored.size.is_none());
        assert_eq!(scored.score, scored.timing.combined);
    }

    #[test]
    fn test_large_payloads_lower_size_score() {
        let scorer = SessionScorer::new(test_config());
        let small = scorer.score(&regular_session(40, 60, 100)).unwrap();
        let large = scorer.score(&regular_session(40, 60, 20_000)).unwrap();

        assert_eq!(large.size.unwrap().smallness, 0.0);
        assert!(large.score < small.score);
    }

    #[test]
    fn test_eligibility_gates() {
        let scorer = SessionScorer::new(EngineConfig {
            min_connections: 36,
            min_duration_hours: 1.0,
            ..EngineConfig::default()
        });

        // exactly min_connections is not enough
        assert_eq!(
            scorer.eligibility(&regular_session(36, 600, 1)),
            Eligibility::TooFewConnections {
                count: 36,
                required: 37
            }
        );
        // 37 points over 36 minutes
        assert!(matches!(
            scorer.eligibility(&regular_session(37, 60, 1)),
            Eligibility::TooShort { .. }
        ));
        // 37 points over exactly one hour
        assert!(scorer
            .eligibility(&regular_session(37, 100, 1))
            .is_eligible());
    }

    #[test]
    fn test_retention_threshold_is_strict() {
        let config = EngineConfig {
            min_score: 1.0,
            no_bytes: true,
            ..test_config()
        };
        let scorer = SessionScorer::new(config.clone());
        let scored = scorer.score(&regular_session(40, 60, 0)).unwrap();
        assert_eq!(scored.score, 1.0);
        assert!(!scorer.retains(&scored));

        let debug = SessionScorer::new(EngineConfig {
            debug: true,
            ..config
        });
        assert!(debug.retains(&scored));
    }

    #[test]
    fn test_degenerate_session_reports_failure() {
        let scorer = SessionScorer::new(EngineConfig {
            min_connections: 0,
            ..test_config()
        });
        // 3 points -> 2 deltas -> P20 index 0.4
        let err = scorer.score(&regular_session(3, 60, 1)).unwrap_err();
        assert_eq!(err.axis, Axis::Timing);
        assert_eq!(err.statistic, "bowley skew");
    }
}
