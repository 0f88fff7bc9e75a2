//! Connection records and the grouping key derived from them.
//!
//! A [`ConnectionRecord`] is one observed connection as produced by the
//! ingestion layer. Records are folded into sessions keyed by
//! [`SessionKey`], which is always source + destination and optionally
//! extended with the destination port and/or request method.

use chrono::{DateTime, Utc};

/// One observed connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRecord {
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub destination: String,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Only meaningful when port tracking is enabled.
    pub port: Option<u16>,
    /// Only meaningful when method tracking is enabled.
    pub method: Option<String>,
}

impl ConnectionRecord {
    pub fn new(
        timestamp: DateTime<Utc>,
        source: impl Into<String>,
        destination: impl Into<String>,
        bytes_sent: u64,
        bytes_received: u64,
    ) -> Self {
        Self {
            timestamp,
            source: source.into(),
            destination: destination.into(),
            bytes_sent,
            bytes_received,
            port: None,
            method: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    /// Lower-cases source and destination (usernames, hostnames).
    pub fn normalize_case(&mut self) {
        self.source = self.source.to_lowercase();
        self.destination = self.destination.to_lowercase();
    }
}

/// Which optional fields extend the grouping key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyOptions {
    pub port: bool,
    pub method: bool,
}

/// Grouping key for a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey {
    pub source: String,
    pub destination: String,
    pub port: Option<u16>,
    pub method: Option<String>,
}

impl SessionKey {
    #[cfg(test)]
    pub fn new(source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            port: None,
            method: None,
        }
    }

    /// Builds the key for a record. Port and method only take part when
    /// the options ask for them; a missing value groups as 0 / "".
    pub fn for_record(record: &ConnectionRecord, options: KeyOptions) -> Self {
        Self {
            source: record.source.clone(),
            destination: record.destination.clone(),
            port: options.port.then(|| record.port.unwrap_or(0)),
            method: options
                .method
                .then(|| record.method.clone().unwrap_or_default()),
        }
    }

    /// Port and method joined by a space, empty when neither is tracked.
    pub fn qualifier(&self) -> String {
        let port = self.port.map(|p| p.to_string()).unwrap_or_default();
        let method = self.method.as_deref().unwrap_or("");
        format!("{} {}", port, method).trim().to_string()
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let qualifier = self.qualifier();
        if qualifier.is_empty() {
            write!(f, "{} -> {}", self.source, self.destination)
        } else {
            write!(f, "{} -> {} {}", self.source, self.destination, qualifier)
        }
    }
}
