//! Domain-specific error types for beacon-finder.
//!
//! Uses `thiserror` for ergonomic error definitions that integrate
//! with the broader `anyhow` error handling strategy.

use thiserror::Error;

/// Errors raised by the statistics library on degenerate input.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StatsError {
    #[error("cannot compute statistics on an empty sample")]
    EmptySample,

    #[error("percentile {percentile} of {len} values resolves to index {index:.2}, below the first element")]
    IndexUnderflow {
        percentile: f64,
        len: usize,
        index: f64,
    },

    #[error("percentile {percentile} of {len} values resolves past the last element")]
    IndexOverflow { percentile: f64, len: usize },

    #[error("percentile {0} is outside 0..=100")]
    InvalidPercentile(f64),
}

/// Which half of the score a failing statistic belonged to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    Timing,
    Size,
}

impl std::fmt::Display for Axis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timing => write!(f, "timing"),
            Self::Size => write!(f, "size"),
        }
    }
}

/// A session could not be scored. Only the owning session is dropped.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{axis} {statistic} failed: {source}")]
pub struct ScoringError {
    pub axis: Axis,
    pub statistic: &'static str,
    #[source]
    pub source: StatsError,
}

impl ScoringError {
    pub fn timing(statistic: &'static str) -> impl FnOnce(StatsError) -> Self {
        move |source| Self {
            axis: Axis::Timing,
            statistic,
            source,
        }
    }

    pub fn size(statistic: &'static str) -> impl FnOnce(StatsError) -> Self {
        move |source| Self {
            axis: Axis::Size,
            statistic,
            source,
        }
    }
}

/// Errors that can occur while reading connection logs.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Failed to read log row: {0}")]
    Csv(#[from] csv::Error),

    #[error("Line {line}: missing column {column}")]
    MissingColumn { line: u64, column: usize },

    #[error("Line {line}: cannot parse timestamp '{value}' with format '{format}'")]
    Timestamp {
        line: u64,
        value: String,
        format: String,
    },

    #[error("Line {line}: column {column} value '{value}' is not a valid {expected}")]
    Number {
        line: u64,
        column: usize,
        value: String,
        expected: &'static str,
    },
}

impl IngestError {
    /// 1-based line the error was raised on, if known.
    pub fn line(&self) -> Option<u64> {
        match self {
            Self::Csv(e) => e.position().map(|p| p.line()),
            Self::MissingColumn { line, .. }
            | Self::Timestamp { line, .. }
            | Self::Number { line, .. } => Some(*line),
        }
    }
}

/// Result type alias using anyhow for application-level error handling.
pub type Result<T> = anyhow::Result<T>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scoring_error_display() {
        let err = ScoringError::timing("bowley skew")(StatsError::EmptySample);
        assert_eq!(
            err.to_string(),
            "timing bowley skew failed: cannot compute statistics on an empty sample"
        );
        assert_eq!(err.axis, Axis::Timing);
    }

    #[test]
    fn test_ingest_error_line() {
        let err = IngestError::MissingColumn { line: 7, column: 12 };
        assert_eq!(err.line(), Some(7));
        assert!(err.to_string().contains("column 12"));
    }
}
