//! Beacon scoring engine.
//!
//! Drives one batch of connection records through the pipeline:
//!
//! ```text
//! records ─> group ─> popularity filter ─> eligibility ─┬─> score ─┐
//!                                                       ├─> score ─┼─> sink ─> rank
//!                                                       └─> score ─┘
//! ```
//!
//! Every eligible session is scored in its own tokio task. Tasks share only
//! the immutable scorer and write exactly one outcome into an mpsc sink whose
//! capacity equals the number of tasks, so no producer ever waits. All task
//! handles are awaited before the sink is drained; a panicked task fails the
//! whole run, a statistics failure only drops its own session.

use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::config::EngineConfig;
use crate::error::{Result, ScoringError};
use crate::popularity::filter_popular_destinations;
use crate::ranker::ResultRanker;
use crate::record::{ConnectionRecord, SessionKey};
use crate::scorer::{ScoredSession, Scorer, SessionScorer};
use crate::session::{group_records, Session};

/// A session whose statistics could not be computed.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoringFailure {
    pub key: SessionKey,
    pub error: ScoringError,
}

/// Result of one engine run.
#[derive(Debug, Clone)]
pub struct EngineReport {
    pub timestamp: DateTime<Utc>,
    pub records_processed: usize,
    pub sessions_total: usize,
    pub popular_destinations: usize,
    pub sessions_popular: usize,
    pub sessions_ineligible: usize,
    pub sessions_scored: usize,
    pub failures: Vec<ScoringFailure>,
    /// Retained sessions, best first.
    pub ranked: Vec<ScoredSession>,
}

enum TaskOutcome {
    Retained(ScoredSession),
    Discarded,
    Failed(ScoringFailure),
}

/// Batch beacon detector.
pub struct BeaconEngine {
    config: EngineConfig,
    scorer: Arc<dyn Scorer>,
    ranker: ResultRanker,
}

impl BeaconEngine {
    pub fn new(config: EngineConfig) -> Self {
        let scorer = Arc::new(SessionScorer::new(config.clone()));
        Self::with_scorer(config, scorer)
    }

    pub fn with_scorer(config: EngineConfig, scorer: Arc<dyn Scorer>) -> Self {
        Self {
            config,
            scorer,
            ranker: ResultRanker::new(),
        }
    }

    pub fn with_ranker(mut self, ranker: ResultRanker) -> Self {
        self.ranker = ranker;
        self
    }

    /// Groups, filters, scores and ranks one batch of records.
    pub async fn run(&self, records: Vec<ConnectionRecord>) -> Result<EngineReport> {
        let records_processed = records.len();

        let sessions = group_records(records, self.config.key_options());
        let sessions_total = sessions.len();
        info!(
            "Grouped {} records into {} sessions",
            records_processed, sessions_total
        );

        let popularity = filter_popular_destinations(sessions, self.config.max_sources);
        if !popularity.dropped_destinations.is_empty() {
            info!(
                "Ignoring {} popular destinations ({} sessions)",
                popularity.dropped_destinations.len(),
                popularity.dropped_sessions
            );
        }

        let mut sessions_ineligible = 0;
        let eligible: Vec<Session> = popularity
            .retained
            .into_iter()
            .filter(|session| {
                let eligibility = self.scorer.eligibility(session);
                if !eligibility.is_eligible() {
                    trace!("Skipping {}: {:?}", session.key, eligibility);
                    sessions_ineligible += 1;
                }
                eligibility.is_eligible()
            })
            .collect();

        debug!(
            "{} sessions eligible for scoring, {} below gates",
            eligible.len(),
            sessions_ineligible
        );

        let outcomes = self.score_all(eligible).await?;

        let mut retained = Vec::new();
        let mut failures = Vec::new();
        let mut sessions_scored = 0;
        for outcome in outcomes {
            match outcome {
                TaskOutcome::Retained(scored) => {
                    sessions_scored += 1;
                    retained.push(scored);
                }
                TaskOutcome::Discarded => sessions_scored += 1,
                TaskOutcome::Failed(failure) => {
                    warn!("Could not score {}: {}", failure.key, failure.error);
                    failures.push(failure);
                }
            }
        }

        let ranked = self.ranker.rank(retained);

        info!(
            "Scored {} sessions, {} reported, {} failed",
            sessions_scored,
            ranked.len(),
            failures.len()
        );

        Ok(EngineReport {
            timestamp: Utc::now(),
            records_processed,
            sessions_total,
            popular_destinations: popularity.dropped_destinations.len(),
            sessions_popular: popularity.dropped_sessions,
            sessions_ineligible,
            sessions_scored,
            failures,
            ranked,
        })
    }

    /// Fans out one task per session and joins them all.
    async fn score_all(&self, sessions: Vec<Session>) -> Result<Vec<TaskOutcome>> {
        let (tx, mut rx) = mpsc::channel(sessions.len().max(1));
        let mut handles = Vec::with_capacity(sessions.len());

        for session in sessions {
            let tx = tx.clone();
            let scorer = Arc::clone(&self.scorer);

            handles.push(tokio::spawn(async move {
                let outcome = match scorer.score(&session) {
                    Ok(scored) if scorer.retains(&scored) => TaskOutcome::Retained(scored),
                    Ok(_) => TaskOutcome::Discarded,
                    Err(error) => TaskOutcome::Failed(ScoringFailure {
                        key: session.key.clone(),
                        error,
                    }),
                };

                if tx.send(outcome).await.is_err() {
                    debug!("Result sink closed before {} was delivered", session.key);
                }
            }));
        }
        drop(tx);

        for handle in handles {
            handle.await.context("Scoring task did not complete")?;
        }

        let mut outcomes = Vec::new();
        while let Some(outcome) = rx.recv().await {
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }
}
