//! Export Module
//!
//! Renders the ranked sessions of an engine run as text, JSON or JSON Lines
//! and writes them to stdout or a file.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::engine::EngineReport;
use crate::scorer::{ScoredSession, SizeScores, TimingScores};

/// Output format for exports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
    JsonLines, // One JSON object per line (JSONL)
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            "jsonl" | "jsonlines" => Ok(Self::JsonLines),
            _ => Err(format!("Unknown output format: {}", s)),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
            Self::JsonLines => write!(f, "jsonl"),
        }
    }
}

/// JSON-serializable run report
#[derive(Serialize)]
pub struct JsonReport {
    pub version: &'static str,
    pub timestamp: String,
    pub records_processed: usize,
    pub sessions_total: usize,
    pub popular_destinations: usize,
    pub sessions_popular: usize,
    pub sessions_ineligible: usize,
    pub sessions_scored: usize,
    pub failures: Vec<JsonFailure>,
    pub beacon_count: usize,
    pub beacons: Vec<JsonSession>,
}

impl From<&EngineReport> for JsonReport {
    fn from(report: &EngineReport) -> Self {
        Self {
            version: "1.0",
            timestamp: report.timestamp.to_rfc3339(),
            records_processed: report.records_processed,
            sessions_total: report.sessions_total,
            popular_destinations: report.popular_destinations,
            sessions_popular: report.sessions_popular,
            sessions_ineligible: report.sessions_ineligible,
            sessions_scored: report.sessions_scored,
            failures: report
                .failures
                .iter()
                .map(|f| JsonFailure {
                    session: f.key.to_string(),
                    error: f.error.to_string(),
                })
                .collect(),
            beacon_count: report.ranked.len(),
            beacons: report.ranked.iter().map(JsonSession::from).collect(),
        }
    }
}

/// JSON-serializable scoring failure
#[derive(Serialize)]
pub struct JsonFailure {
    pub session: String,
    pub error: String,
}

/// JSON-serializable scored session
#[derive(Serialize)]
pub struct JsonSession {
    pub source: String,
    pub destination: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    pub score: f64,
    pub timing: JsonTiming,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<JsonSize>,
    pub connection_count: usize,
    pub duration_hours: f64,
    pub first_seen: String,
    pub last_seen: String,
    pub mean_interval_secs: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval_cv: Option<f64>,
}

impl From<&ScoredSession> for JsonSession {
    fn from(session: &ScoredSession) -> Self {
        Self {
            source: session.key.source.clone(),
            destination: session.key.destination.clone(),
            port: session.key.port,
            method: session.key.method.clone(),
            score: session.score,
            timing: JsonTiming::from(&session.timing),
            size: session.size.as_ref().map(JsonSize::from),
            connection_count: session.connection_count,
            duration_hours: session.duration_hours,
            first_seen: session.first_seen.to_rfc3339(),
            last_seen: session.last_seen.to_rfc3339(),
            mean_interval_secs: session.intervals.mean_secs,
            interval_cv: session.intervals.cv,
        }
    }
}

/// JSON-serializable timing sub-scores
#[derive(Serialize)]
pub struct JsonTiming {
    pub score: f64,
    pub skew: f64,
    pub madm: f64,
    pub connections: f64,
}

impl From<&TimingScores> for JsonTiming {
    fn from(timing: &TimingScores) -> Self {
        Self {
            score: timing.combined,
            skew: timing.skew,
            madm: timing.dispersion,
            connections: timing.connection_rate,
        }
    }
}

/// JSON-serializable size sub-scores
#[derive(Serialize)]
pub struct JsonSize {
    pub score: f64,
    pub skew: f64,
    pub madm: f64,
    pub smallness: f64,
}

impl From<&SizeScores> for JsonSize {
    fn from(size: &SizeScores) -> Self {
        Self {
            score: size.combined,
            skew: size.skew,
            madm: size.dispersion,
            smallness: size.smallness,
        }
    }
}

/// Exports a report in the specified format
pub fn export_report(report: &EngineReport, format: OutputFormat) -> String {
    match format {
        OutputFormat::Text => export_text(report),
        OutputFormat::Json => export_json(report),
        OutputFormat::JsonLines => export_jsonl(report),
    }
}

/// Exports report as pretty-printed JSON
pub fn export_json(report: &EngineReport) -> String {
    let json_report = JsonReport::from(report);
    serde_json::to_string_pretty(&json_report)
        .unwrap_or_else(|e| format!("{{\"error\": \"{}\"}}", e))
}

/// Exports report as JSON Lines (one session per line)
pub fn export_jsonl(report: &EngineReport) -> String {
    let mut lines = Vec::new();

    // First line is the summary
    let summary = serde_json::json!({
        "type": "summary",
        "timestamp": report.timestamp.to_rfc3339(),
        "records_processed": report.records_processed,
        "sessions_total": report.sessions_total,
        "sessions_scored": report.sessions_scored,
        "failures": report.failures.len(),
        "beacon_count": report.ranked.len(),
    });
    lines.push(serde_json::to_string(&summary).unwrap_or_default());

    for session in &report.ranked {
        if let Ok(line) = serde_json::to_string(&JsonSession::from(session)) {
            lines.push(line);
        }
    }

    lines.join("\n")
}

/// Exports report as one text line per ranked session
pub fn export_text(report: &EngineReport) -> String {
    report
        .ranked
        .iter()
        .map(|session| format!("{}\n", format_session_line(session)))
        .collect()
}

/// Formats a session as a single analyst-readable line.
pub fn format_session_line(session: &ScoredSession) -> String {
    let mut head = format!("{} -> {}", session.key.source, session.key.destination);
    let qualifier = session.key.qualifier();
    if !qualifier.is_empty() {
        head.push(' ');
        head.push_str(&qualifier);
    }

    let timing = &session.timing;
    let (ds, ds_skew, ds_madm, ds_small) = match &session.size {
        Some(size) => (
            format!("{:.3}", size.combined),
            format!("{:.3}", size.skew),
            format!("{:.3}", size.dispersion),
            format!("{:.3}", size.smallness),
        ),
        None => ("-".into(), "-".into(), "-".into(), "-".into()),
    };

    format!(
        "{} {:.1} | SCORE: {:.3} | (ts: {:.3} ds: {}) | (tsSkew: {:.3} tsMadm: {:.3} tsConn: {:.3}) (dsSkew: {} dsMadm: {} dsSmallness: {})",
        head,
        session.duration_hours,
        session.score,
        timing.combined,
        ds,
        timing.skew,
        timing.dispersion,
        timing.connection_rate,
        ds_skew,
        ds_madm,
        ds_small,
    )
}

/// Writes the rendered report to `path`, or stdout when `None`.
pub fn write_report(report: &EngineReport, format: OutputFormat, path: Option<&Path>) -> Result<()> {
    let rendered = export_report(report, format);

    match path {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("Failed to create output file: {}", path.display()))?;
            let mut writer = BufWriter::new(file);
            write_rendered(&mut writer, &rendered)
                .with_context(|| format!("Failed to write output file: {}", path.display()))?;
            tracing::info!("Output written to {}", path.display());
        }
        None => {
            let stdout = io::stdout();
            let mut writer = stdout.lock();
            write_rendered(&mut writer, &rendered).context("Failed to write to stdout")?;
        }
    }
    Ok(())
}

fn write_rendered<W: Write>(writer: &mut W, rendered: &str) -> io::Result<()> {
    writer.write_all(rendered.as_bytes())?;
    if !rendered.is_empty() && !rendered.ends_with('\n') {
        writer.write_all(b"\n")?;
    }
    writer.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::SessionKey;
    use crate::scorer::IntervalSummary;
    use chrono::{TimeZone, Utc};

    fn session(size: Option<SizeScores>) -> ScoredSession {
        let first = Utc.with_ymd_and_hms(2023, 3, 2, 20, 0, 0).unwrap();
        ScoredSession {
            key: SessionKey {
                source: "alice".to_string(),
                destination: "evil.example".to_string(),
                port: Some(443),
                method: Some("POST".to_string()),
            },
            connection_count: 240,
            first_seen: first,
            last_seen: first + chrono::Duration::hours(4),
            duration_hours: 4.0,
            score: 0.98765,
            timing: TimingScores {
                skew: 1.0,
                dispersion: 0.9,
                connection_rate: 1.0,
                combined: 0.96667,
            },
            size,
            intervals: IntervalSummary {
                mean_secs: 60.0,
                std_dev_secs: 1.5,
                cv: Some(0.025),
            },
        }
    }

    fn report(sessions: Vec<ScoredSession>) -> EngineReport {
        EngineReport {
            timestamp: Utc::now(),
            records_processed: 1000,
            sessions_total: 10,
            popular_destinations: 1,
            sessions_popular: 6,
            sessions_ineligible: 2,
            sessions_scored: 2,
            failures: Vec::new(),
            ranked: sessions,
        }
    }

    #[test]
    fn test_output_format_parse() {
        assert_eq!("text".parse::<OutputFormat>().unwrap(), OutputFormat::Text);
        assert_eq!("JSON".parse::<OutputFormat>().unwrap(), OutputFormat::Json);
        assert_eq!(
            "jsonl".parse::<OutputFormat>().unwrap(),
            OutputFormat::JsonLines
        );
        assert!("invalid".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn test_output_format_display() {
        assert_eq!(OutputFormat::Text.to_string(), "text");
        assert_eq!(OutputFormat::Json.to_string(), "json");
        assert_eq!(OutputFormat::JsonLines.to_string(), "jsonl");
    }

    #[test]
    fn test_text_line_with_sizes() {
        let line = format_session_line(&session(Some(SizeScores {
            skew: 1.0,
            dispersion: 0.9921875,
            smallness: 0.95,
            combined: 0.98,
        })));
        assert_eq!(
            line,
            "alice -> evil.example 443 POST 4.0 | SCORE: 0.988 | (ts: 0.967 ds: 0.980) | \
             (tsSkew: 1.000 tsMadm: 0.900 tsConn: 1.000) (dsSkew: 1.000 dsMadm: 0.992 dsSmallness: 0.950)"
        );
    }

    #[test]
    fn test_text_line_without_sizes() {
        let line = format_session_line(&session(None));
        assert!(line.contains("(ts: 0.967 ds: -)"));
        assert!(line.ends_with("(dsSkew: - dsMadm: - dsSmallness: -)"));
    }

    #[test]
    fn test_export_json() {
        let json = export_json(&report(vec![session(None)]));
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["beacon_count"], 1);
        assert_eq!(value["records_processed"], 1000);
        assert_eq!(value["beacons"][0]["destination"], "evil.example");
        assert_eq!(value["beacons"][0]["port"], 443);
        assert!(value["beacons"][0].get("size").is_none());
        assert_eq!(value["beacons"][0]["timing"]["madm"], 0.9);
    }

    #[test]
    fn test_export_jsonl() {
        let jsonl = export_jsonl(&report(vec![session(None), session(None)]));
        let lines: Vec<&str> = jsonl.lines().collect();
        assert_eq!(lines.len(), 3);

        let summary: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(summary["type"], "summary");
        assert_eq!(summary["beacon_count"], 2);
    }

    #[test]
    fn test_write_report_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("beacons.out");

        write_report(&report(vec![session(None)]), OutputFormat::Text, Some(&path)).unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.starts_with("alice -> evil.example 443 POST"));
        assert!(written.ends_with('\n'));
    }
}
