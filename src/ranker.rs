//! Ranking of scored sessions.
//!
//! Arrival order from the worker tasks is arbitrary, so the ranker is the
//! single place where output order is made deterministic: descending score,
//! ties broken by ascending grouping key.

use std::cmp::Ordering;

use crate::scorer::ScoredSession;

/// Sorts, optionally re-filters and truncates scored sessions.
#[derive(Debug, Clone, Default)]
pub struct ResultRanker {
    /// Drop sessions scoring at or below this value.
    pub threshold: Option<f64>,
    /// Keep only the best N sessions.
    pub limit: Option<usize>,
}

impl ResultRanker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = Some(threshold);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn rank(&self, mut sessions: Vec<ScoredSession>) -> Vec<ScoredSession> {
        if let Some(threshold) = self.threshold {
            sessions.retain(|s| s.score > threshold);
        }

        sessions.sort_by(compare_ranked);

        if let Some(limit) = self.limit {
            sessions.truncate(limit);
        }
        sessions
    }
}

/// Descending by score, then ascending by key.
pub fn compare_ranked(a: &ScoredSession, b: &ScoredSession) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.key.cmp(&b.key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::SessionKey;
    use crate::scorer::{IntervalSummary, TimingScores};
    use chrono::Utc;

    fn scored(src: &str, score: f64) -> ScoredSession {
        ScoredSession {
            key: SessionKey::new(src, "dst.example"),
            connection_count: 40,
            first_seen: Utc::now(),
            last_seen: Utc::now(),
            duration_hours: 1.0,
            score,
            timing: TimingScores {
                skew: score,
                dispersion: score,
                connection_rate: score,
                combined: score,
            },
            size: None,
            intervals: IntervalSummary {
                mean_secs: 60.0,
                std_dev_secs: 0.0,
                cv: Some(0.0),
            },
        }
    }

    fn rank(sessions: Vec<ScoredSession>) -> Vec<ScoredSession> {
        ResultRanker::new().rank(sessions)
    }

    fn sources(sessions: &[ScoredSession]) -> Vec<&str> {
        sessions.iter().map(|s| s.key.source.as_str()).collect()
    }

    #[test]
    fn test_rank_descending() {
        let ranked = rank(vec![scored("a", 0.6), scored("b", 0.95), scored("c", 0.7)]);
        assert_eq!(sources(&ranked), vec!["b", "c", "a"]);
    }

    #[test]
    fn test_rank_ties_by_key() {
        let ranked = rank(vec![scored("zed", 0.8), scored("amy", 0.8), scored("max", 0.9)]);
        assert_eq!(sources(&ranked), vec!["max", "amy", "zed"]);
    }

    #[test]
    fn test_threshold_and_limit() {
        let ranker = ResultRanker::new().with_threshold(0.7).with_limit(2);
        let ranked = ranker.rank(vec![
            scored("a", 0.7),
            scored("b", 0.99),
            scored("c", 0.71),
            scored("d", 0.8),
        ]);
        assert_eq!(sources(&ranked), vec!["b", "d"]);
    }

    #[test]
    fn test_rank_empty() {
        assert!(rank(Vec::new()).is_empty());
    }
}
