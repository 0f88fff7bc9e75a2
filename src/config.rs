//! Configuration Module
//!
//! Provides TOML-based configuration for beacon-finder.
//! Configuration is optional - CLI arguments can override file settings.
//!
//! Precedence, lowest first: built-in defaults, config file, input preset
//! (`--proxy` / `--dns`), explicit command-line flags.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::export::OutputFormat;
use crate::record::KeyOptions;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub input: InputConfig,
    pub engine: EngineConfig,
    pub output: OutputConfig,
}

impl Config {
    /// Loads configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Generates a default configuration file content
    pub fn generate_default() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config)
            .unwrap_or_else(|_| "# Failed to generate config".to_string())
    }

    /// Switches column layout and scoring mode to a known log flavour.
    pub fn apply_preset(&mut self, preset: InputPreset) {
        match preset {
            InputPreset::Proxy => {
                self.input.delimiter = ' ';
                self.input.time_format = PROXY_TIME_FORMAT.to_string();
                self.input.columns = ColumnConfig {
                    time: 0,
                    source: 2,
                    destination: 7,
                    bytes_received: Some(11),
                    bytes_sent: Some(12),
                    method: Some(5),
                    port: Some(6),
                };
                self.engine.group_by_port = true;
                self.engine.group_by_method = true;
            }
            InputPreset::Dns => {
                self.input.time_format = DNS_TIME_FORMAT.to_string();
                self.input.columns = ColumnConfig {
                    time: 0,
                    source: 1,
                    destination: 2,
                    bytes_received: None,
                    bytes_sent: None,
                    method: None,
                    port: None,
                };
                self.engine.no_bytes = true;
                self.engine.weights.data = 0.0;
                self.engine.group_by_port = false;
                self.engine.group_by_method = false;
            }
        }
    }

    /// Validates the configuration
    pub fn validate(&self) -> Result<()> {
        self.input.validate()?;
        self.engine.validate()?;

        if self.engine.group_by_port && self.input.columns.port.is_none() {
            anyhow::bail!("group_by_port requires a port column");
        }
        if self.engine.group_by_method && self.input.columns.method.is_none() {
            anyhow::bail!("group_by_method requires a method column");
        }
        if !self.engine.no_bytes
            && (self.input.columns.bytes_sent.is_none()
                || self.input.columns.bytes_received.is_none())
        {
            anyhow::bail!("size analysis needs bytes_sent and bytes_received columns (or no_bytes)");
        }
        if self.output.top == Some(0) {
            anyhow::bail!("top must be greater than 0");
        }
        Ok(())
    }
}

/// Default timestamp layout of proxy exports, e.g. `2023-03-02-20:58:27`.
pub const PROXY_TIME_FORMAT: &str = "%Y-%m-%d-%H:%M:%S";
/// Default timestamp layout of DNS server logs, e.g. `02-Mar-2023-20:58:27`.
pub const DNS_TIME_FORMAT: &str = "%d-%b-%Y-%H:%M:%S";
/// Special time format: fractional seconds since the Unix epoch.
pub const EPOCH_TIME_FORMAT: &str = "epoch";

/// Known log layouts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InputPreset {
    /// Space-delimited proxy log with method and port columns
    Proxy,
    /// DNS query log, no payload sizes
    Dns,
}

impl std::fmt::Display for InputPreset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Proxy => write!(f, "proxy"),
            Self::Dns => write!(f, "dns"),
        }
    }
}

/// Log ingestion configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct InputConfig {
    /// Single-character field delimiter
    pub delimiter: char,
    /// chrono strftime format, or "epoch"
    pub time_format: String,
    /// Lower-case source and destination
    pub lowercase: bool,
    /// Warn and skip unparsable rows instead of aborting
    pub skip_malformed: bool,
    /// Source/destination value that marks a row as unattributed
    pub placeholder: String,
    pub columns: ColumnConfig,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            delimiter: ',',
            time_format: PROXY_TIME_FORMAT.to_string(),
            lowercase: true,
            skip_malformed: false,
            placeholder: "-".to_string(),
            columns: ColumnConfig::default(),
        }
    }
}

impl InputConfig {
    /// Delimiter as the single byte the CSV reader expects.
    pub fn delimiter_byte(&self) -> Result<u8> {
        delimiter_byte(self.delimiter)
    }

    fn validate(&self) -> Result<()> {
        self.delimiter_byte()?;
        if self.time_format.is_empty() {
            anyhow::bail!("time_format must not be empty");
        }
        Ok(())
    }
}

/// Converts a delimiter to the single byte the CSV reader expects. Only
/// ASCII is accepted.
pub fn delimiter_byte(delimiter: char) -> Result<u8> {
    if delimiter.is_ascii() {
        Ok(delimiter as u8)
    } else {
        anyhow::bail!("delimiter must be a single ASCII character, got {:?}", delimiter)
    }
}

/// Zero-based column indices
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ColumnConfig {
    pub time: usize,
    pub source: usize,
    pub destination: usize,
    pub bytes_received: Option<usize>,
    pub bytes_sent: Option<usize>,
    pub method: Option<usize>,
    pub port: Option<usize>,
}

impl Default for ColumnConfig {
    fn default() -> Self {
        Self {
            time: 0,
            source: 2,
            destination: 7,
            bytes_received: Some(11),
            bytes_sent: Some(12),
            method: None,
            port: None,
        }
    }
}

/// Scoring engine configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    /// A session needs strictly more connections than this
    pub min_connections: usize,
    /// Minimum session duration in hours
    pub min_duration_hours: f64,
    /// Destinations with more distinct sources are dropped
    pub max_sources: usize,
    /// Sessions must score strictly above this
    pub min_score: f64,
    /// Disable payload-size scoring entirely
    pub no_bytes: bool,
    /// Emit every scored session regardless of min_score
    pub debug: bool,
    /// Add the port to the grouping key
    pub group_by_port: bool,
    /// Add the request method to the grouping key
    pub group_by_method: bool,
    pub weights: Weights,
    pub tuning: Tuning,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            min_connections: 36,
            min_duration_hours: 4.0,
            max_sources: 5,
            min_score: 0.5,
            no_bytes: false,
            debug: false,
            group_by_port: false,
            group_by_method: false,
            weights: Weights::default(),
            tuning: Tuning::default(),
        }
    }
}

impl EngineConfig {
    pub fn key_options(&self) -> KeyOptions {
        KeyOptions {
            port: self.group_by_port,
            method: self.group_by_method,
        }
    }

    /// The size weight actually applied; forced to 0 without byte counts.
    pub fn data_weight(&self) -> f64 {
        if self.no_bytes {
            0.0
        } else {
            self.weights.data
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.weights.validate(self.no_bytes)?;
        self.tuning.validate()?;
        if !self.min_duration_hours.is_finite() || self.min_duration_hours < 0.0 {
            anyhow::bail!("min_duration_hours must be a non-negative number");
        }
        if !self.min_score.is_finite() {
            anyhow::bail!("min_score must be a finite number");
        }
        Ok(())
    }
}

/// Relative weight of every sub-score
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Weights {
    /// Overall timing score (wT)
    pub time: f64,
    /// Overall size score (wD)
    pub data: f64,
    /// Timing skew (wTS)
    pub ts_skew: f64,
    /// Timing MADM (wTM)
    pub ts_madm: f64,
    /// Connection rate (wTC)
    pub ts_conn: f64,
    /// Size skew (wDS)
    pub ds_skew: f64,
    /// Size MADM (wDM)
    pub ds_madm: f64,
    /// Size smallness (wDZ)
    pub ds_small: f64,
}

impl Default for Weights {
    fn default() -> Self {
        Self {
            time: 1.0,
            data: 1.0,
            ts_skew: 1.0,
            ts_madm: 1.0,
            ts_conn: 1.0,
            ds_skew: 1.0,
            ds_madm: 1.0,
            ds_small: 1.0,
        }
    }
}

impl Weights {
    fn all(&self) -> [(&'static str, f64); 8] {
        [
            ("time", self.time),
            ("data", self.data),
            ("ts_skew", self.ts_skew),
            ("ts_madm", self.ts_madm),
            ("ts_conn", self.ts_conn),
            ("ds_skew", self.ds_skew),
            ("ds_madm", self.ds_madm),
            ("ds_small", self.ds_small),
        ]
    }

    fn validate(&self, no_bytes: bool) -> Result<()> {
        for (name, weight) in self.all() {
            if !weight.is_finite() || weight < 0.0 {
                anyhow::bail!("weight {} must be a non-negative number, got {}", name, weight);
            }
        }
        if self.ts_skew + self.ts_madm + self.ts_conn <= 0.0 {
            anyhow::bail!("at least one timing sub-score weight must be positive");
        }
        let data = if no_bytes { 0.0 } else { self.data };
        if self.time + data <= 0.0 {
            anyhow::bail!("time and data weights cannot both be zero");
        }
        if data > 0.0 && self.ds_skew + self.ds_madm + self.ds_small <= 0.0 {
            anyhow::bail!("at least one size sub-score weight must be positive");
        }
        Ok(())
    }
}

/// Reference constants of the scoring formulas
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Tuning {
    /// Timing MADM at which the dispersion score reaches 0
    pub jitter_secs: f64,
    /// Reference window for the connection-rate score
    pub rate_window_secs: f64,
    /// Sent-size MADM scale of the intermediate size magnitude
    pub size_madm_bytes: f64,
    /// Divisor applied to the size magnitude
    pub size_dispersion_divisor: f64,
    /// Median payload at which the smallness score reaches 0
    pub smallness_bytes: f64,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            jitter_secs: 30.0,
            rate_window_secs: 90.0,
            size_madm_bytes: 1024.0,
            size_dispersion_divisor: 128.0,
            smallness_bytes: 8192.0,
        }
    }
}

impl Tuning {
    fn validate(&self) -> Result<()> {
        let constants = [
            ("jitter_secs", self.jitter_secs),
            ("rate_window_secs", self.rate_window_secs),
            ("size_madm_bytes", self.size_madm_bytes),
            ("size_dispersion_divisor", self.size_dispersion_divisor),
            ("smallness_bytes", self.smallness_bytes),
        ];
        for (name, value) in constants {
            if !value.is_finite() || value <= 0.0 {
                anyhow::bail!("tuning value {} must be greater than 0, got {}", name, value);
            }
        }
        Ok(())
    }
}

/// Output-related configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Output format (text, json, jsonl)
    #[serde(with = "output_format_serde")]
    pub format: OutputFormat,
    /// Output file path (None = stdout)
    pub file: Option<String>,
    /// Only emit the N best sessions
    pub top: Option<usize>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            format: OutputFormat::Text,
            file: None,
            top: None,
        }
    }
}

/// Custom serde implementation for OutputFormat
mod output_format_serde {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S>(format: &OutputFormat, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<OutputFormat, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
