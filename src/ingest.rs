//! Log ingestion - turns delimited log lines into connection records.
//!
//! Column positions, the delimiter and the timestamp layout all come from
//! [`InputConfig`]. Rows attributed to the placeholder source/destination
//! (`-` by default) are skipped. The returned records are sorted by time.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use csv::{ReaderBuilder, StringRecord};
use tracing::{debug, info, warn};

use crate::config::{InputConfig, EPOCH_TIME_FORMAT};
use crate::error::IngestError;
use crate::record::ConnectionRecord;

/// Records read from one log, plus bookkeeping.
#[derive(Debug, Default)]
pub struct IngestOutcome {
    pub records: Vec<ConnectionRecord>,
    pub rows_read: u64,
    pub placeholder_rows: u64,
    pub malformed_rows: u64,
}

/// Reads connection records from delimited text.
pub struct LogReader<'a> {
    config: &'a InputConfig,
    read_bytes: bool,
    read_port: bool,
    read_method: bool,
}

impl<'a> LogReader<'a> {
    /// `read_bytes` is false when size analysis is disabled; byte columns
    /// are then never touched and both counts are 0.
    pub fn new(config: &'a InputConfig, read_bytes: bool) -> Self {
        Self {
            config,
            read_bytes,
            read_port: config.columns.port.is_some(),
            read_method: config.columns.method.is_some(),
        }
    }

    pub fn read_path(&self, path: &Path) -> Result<IngestOutcome> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open input file: {}", path.display()))?;
        info!("Reading connection log: {}", path.display());
        self.read(file)
    }

    pub fn read<R: Read>(&self, input: R) -> Result<IngestOutcome> {
        let mut reader = ReaderBuilder::new()
            .delimiter(self.config.delimiter_byte()?)
            .has_headers(false)
            .flexible(true)
            .from_reader(input);

        let mut outcome = IngestOutcome::default();
        let mut row = StringRecord::new();

        loop {
            let has_row = match reader.read_record(&mut row) {
                Ok(has_row) => has_row,
                Err(e) if self.config.skip_malformed && !e.is_io_error() => {
                    let e = IngestError::from(e);
                    warn!(
                        "Skipping unreadable row at line {}: {}",
                        e.line().unwrap_or(outcome.rows_read + 1),
                        e
                    );
                    outcome.malformed_rows += 1;
                    continue;
                }
                Err(e) => return Err(IngestError::from(e).into()),
            };
            if !has_row {
                break;
            }
            outcome.rows_read += 1;
            let line = row.position().map(|p| p.line()).unwrap_or(outcome.rows_read);

            match self.parse_row(&row, line) {
                Ok(Some(record)) => outcome.records.push(record),
                Ok(None) => outcome.placeholder_rows += 1,
                Err(e) if self.config.skip_malformed => {
                    warn!("{}", e);
                    outcome.malformed_rows += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }

        outcome.records.sort_by_key(|r| r.timestamp);

        debug!(
            "Read {} rows: {} records, {} placeholder, {} malformed",
            outcome.rows_read,
            outcome.records.len(),
            outcome.placeholder_rows,
            outcome.malformed_rows
        );

        Ok(outcome)
    }

    /// Parses one row; `Ok(None)` for placeholder rows.
    fn parse_row(
        &self,
        row: &StringRecord,
        line: u64,
    ) -> std::result::Result<Option<ConnectionRecord>, IngestError> {
        let columns = &self.config.columns;
        let field = |column: usize| {
            row.get(column)
                .ok_or_else(|| IngestError::MissingColumn { line, column })
        };

        let source = field(columns.source)?;
        let destination = field(columns.destination)?;
        if source == self.config.placeholder || destination == self.config.placeholder {
            return Ok(None);
        }

        let timestamp = parse_timestamp(field(columns.time)?, &self.config.time_format)
            .ok_or_else(|| IngestError::Timestamp {
                line,
                value: row.get(columns.time).unwrap_or_default().to_string(),
                format: self.config.time_format.clone(),
            })?;

        let parse_bytes = |column: Option<usize>| -> std::result::Result<u64, IngestError> {
            match column {
                Some(column) if self.read_bytes => {
                    parse_number(field(column)?, line, column, "byte count")
                }
                _ => Ok(0),
            }
        };
        let bytes_sent = parse_bytes(columns.bytes_sent)?;
        let bytes_received = parse_bytes(columns.bytes_received)?;

        let mut record =
            ConnectionRecord::new(timestamp, source, destination, bytes_sent, bytes_received);

        if let (true, Some(column)) = (self.read_port, columns.port) {
            record = record.with_port(parse_number(field(column)?, line, column, "port")?);
        }
        if let (true, Some(column)) = (self.read_method, columns.method) {
            record = record.with_method(field(column)?);
        }
        if self.config.lowercase {
            record.normalize_case();
        }

        Ok(Some(record))
    }
}

fn parse_number<T: std::str::FromStr>(
    value: &str,
    line: u64,
    column: usize,
    expected: &'static str,
) -> std::result::Result<T, IngestError> {
    value.trim().parse().map_err(|_| IngestError::Number {
        line,
        column,
        value: value.to_string(),
        expected,
    })
}

/// Parses a timestamp with a chrono strftime layout, or fractional Unix
/// seconds when the layout is `epoch`. Naive times are taken as UTC.
pub fn parse_timestamp(value: &str, format: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if format == EPOCH_TIME_FORMAT {
        let secs: f64 = value.parse().ok()?;
        if !secs.is_finite() {
            return None;
        }
        let whole = secs.floor();
        let nanos = ((secs - whole) * 1e9).round().min(999_999_999.0) as u32;
        return DateTime::from_timestamp(whole as i64, nanos);
    }

    if let Ok(parsed) = DateTime::parse_from_str(value, format) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, format)
        .ok()
        .map(|naive| naive.and_utc())
}
