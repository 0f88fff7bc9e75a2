//! Session grouping.
//!
//! Collapses the record stream into one [`Session`] per [`SessionKey`].
//! Within a session, observation points are kept in strictly increasing
//! timestamp order; a second record at an already-seen timestamp is merged
//! into the existing point by keeping the larger byte counts (never summed).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::record::{ConnectionRecord, KeyOptions, SessionKey};

/// One coalesced timestamp within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObservationPoint {
    pub timestamp: DateTime<Utc>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl ObservationPoint {
    fn merge_max(&mut self, record: &ConnectionRecord) {
        self.bytes_sent = self.bytes_sent.max(record.bytes_sent);
        self.bytes_received = self.bytes_received.max(record.bytes_received);
    }
}

/// All observations for one grouping key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub key: SessionKey,
    points: Vec<ObservationPoint>,
}

impl Session {
    pub fn new(key: SessionKey) -> Self {
        Self {
            key,
            points: Vec::new(),
        }
    }

    /// Folds a record into this session.
    ///
    /// Time-ordered input always appends; out-of-order records are inserted
    /// at their sorted position so the invariant holds for any input order.
    pub fn observe(&mut self, record: &ConnectionRecord) {
        match self
            .points
            .binary_search_by_key(&record.timestamp, |p| p.timestamp)
        {
            Ok(idx) => self.points[idx].merge_max(record),
            Err(idx) => self.points.insert(
                idx,
                ObservationPoint {
                    timestamp: record.timestamp,
                    bytes_sent: record.bytes_sent,
                    bytes_received: record.bytes_received,
                },
            ),
        }
    }

    #[cfg(test)]
    pub fn points(&self) -> &[ObservationPoint] {
        &self.points
    }

    /// Number of distinct timestamps observed.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    #[allow(dead_code)] // Pairs with len()
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn first_seen(&self) -> Option<DateTime<Utc>> {
        self.points.first().map(|p| p.timestamp)
    }

    pub fn last_seen(&self) -> Option<DateTime<Utc>> {
        self.points.last().map(|p| p.timestamp)
    }

    /// Elapsed time between the first and last observation.
    pub fn duration(&self) -> chrono::Duration {
        match (self.first_seen(), self.last_seen()) {
            (Some(first), Some(last)) => last.signed_duration_since(first),
            _ => chrono::Duration::zero(),
        }
    }

    pub fn duration_secs(&self) -> f64 {
        duration_to_secs(self.duration())
    }

    pub fn duration_hours(&self) -> f64 {
        self.duration_secs() / 3600.0
    }

    /// Inter-arrival times in seconds, `len() - 1` of them.
    pub fn deltas_secs(&self) -> Vec<f64> {
        self.points
            .windows(2)
            .map(|w| duration_to_secs(w[1].timestamp.signed_duration_since(w[0].timestamp)))
            .collect()
    }

    pub fn sent_sizes(&self) -> Vec<u64> {
        self.points.iter().map(|p| p.bytes_sent).collect()
    }

    #[cfg(test)]
    pub fn received_sizes(&self) -> Vec<u64> {
        self.points.iter().map(|p| p.bytes_received).collect()
    }

    /// Expands the session back into one record per observation point.
    #[cfg(test)]
    pub fn to_records(&self) -> Vec<ConnectionRecord> {
        self.points
            .iter()
            .map(|p| ConnectionRecord {
                timestamp: p.timestamp,
                source: self.key.source.clone(),
                destination: self.key.destination.clone(),
                bytes_sent: p.bytes_sent,
                bytes_received: p.bytes_received,
                port: self.key.port,
                method: self.key.method.clone(),
            })
            .collect()
    }
}

/// Converts a signed duration to fractional seconds without losing the
/// sub-second part.
pub fn duration_to_secs(duration: chrono::Duration) -> f64 {
    duration.num_seconds() as f64 + f64::from(duration.subsec_nanos()) / 1e9
}

/// Accumulates records into sessions.
#[derive(Debug, Default)]
pub struct SessionGrouper {
    options: KeyOptions,
    sessions: HashMap<SessionKey, Session>,
    records_seen: u64,
}

impl SessionGrouper {
    pub fn new(options: KeyOptions) -> Self {
        Self {
            options,
            sessions: HashMap::new(),
            records_seen: 0,
        }
    }

    pub fn add(&mut self, record: ConnectionRecord) {
        self.records_seen += 1;
        let key = SessionKey::for_record(&record, self.options);
        self.sessions
            .entry(key)
            .or_insert_with_key(|key| Session::new(key.clone()))
            .observe(&record);
    }

    pub fn finish(self) -> HashMap<SessionKey, Session> {
        debug!(
            "Grouped {} records into {} sessions",
            self.records_seen,
            self.sessions.len()
        );
        self.sessions
    }
}

/// Groups records into sessions keyed by source, destination and the
/// optional port/method fields.
pub fn group_records(
    records: impl IntoIterator<Item = ConnectionRecord>,
    options: KeyOptions,
) -> HashMap<SessionKey, Session> {
    let mut grouper = SessionGrouper::new(options);
    for record in records {
        grouper.add(record);
    }
    grouper.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn rec(secs: i64, src: &str, dst: &str, sent: u64, recv: u64) -> ConnectionRecord {
        ConnectionRecord::new(at(secs), src, dst, sent, recv)
    }

    #[test]
    fn test_groups_by_source_and_destination() {
        let records = vec![
            rec(0, "alice", "evil.example", 10, 10),
            rec(1, "bob", "evil.example", 10, 10),
            rec(2, "alice", "evil.example", 10, 10),
            rec(3, "alice", "good.example", 10, 10),
        ];
        let sessions = group_records(records, KeyOptions::default());

        assert_eq!(sessions.len(), 3);
        assert_eq!(sessions[&SessionKey::new("alice", "evil.example")].len(), 2);
        assert_eq!(sessions[&SessionKey::new("bob", "evil.example")].len(), 1);
    }

    #[test]
    fn test_duplicate_timestamp_keeps_max_not_sum() {
        let records = vec![
            rec(0, "alice", "evil.example", 10, 900),
            rec(0, "alice", "evil.example", 50, 100),
            rec(60, "alice", "evil.example", 5, 5),
        ];
        let sessions = group_records(records, KeyOptions::default());
        let session = &sessions[&SessionKey::new("alice", "evil.example")];

        assert_eq!(session.len(), 2);
        assert_eq!(session.points()[0].bytes_sent, 50);
        assert_eq!(session.points()[0].bytes_received, 900);
        assert_eq!(session.sent_sizes(), vec![50, 5]);
        assert_eq!(session.received_sizes(), vec![900, 5]);
    }

    #[test]
    fn test_port_extends_key() {
        let records = vec![
            rec(0, "alice", "evil.example", 1, 1).with_port(443),
            rec(1, "alice", "evil.example", 1, 1).with_port(80),
            rec(2, "alice", "evil.example", 1, 1).with_port(443),
        ];
        let options = KeyOptions {
            port: true,
            method: false,
        };
        let sessions = group_records(records.clone(), options);
        assert_eq!(sessions.len(), 2);

        let merged = group_records(records, KeyOptions::default());
        assert_eq!(merged.len(), 1);
    }

    #[test]
    fn test_method_extends_key() {
        let records = vec![
            rec(0, "alice", "evil.example", 1, 1).with_method("GET"),
            rec(1, "alice", "evil.example", 1, 1).with_method("POST"),
        ];
        let options = KeyOptions {
            port: false,
            method: true,
        };
        assert_eq!(group_records(records, options).len(), 2);
    }

    #[test]
    fn test_out_of_order_input_stays_sorted() {
        let records = vec![
            rec(120, "alice", "evil.example", 3, 3),
            rec(0, "alice", "evil.example", 1, 1),
            rec(60, "alice", "evil.example", 2, 2),
            rec(0, "alice", "evil.example", 7, 0),
        ];
        let sessions = group_records(records, KeyOptions::default());
        let session = &sessions[&SessionKey::new("alice", "evil.example")];

        let stamps: Vec<_> = session.points().iter().map(|p| p.timestamp).collect();
        assert_eq!(stamps, vec![at(0), at(60), at(120)]);
        assert!(stamps.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(session.sent_sizes(), vec![7, 2, 3]);
    }

    #[test]
    fn test_regrouping_is_idempotent() {
        let records = vec![
            rec(0, "alice", "evil.example", 10, 1).with_port(443),
            rec(0, "alice", "evil.example", 30, 2).with_port(443),
            rec(61, "alice", "evil.example", 20, 3).with_port(443),
            rec(119, "alice", "evil.example", 40, 4).with_port(443),
        ];
        let options = KeyOptions {
            port: true,
            method: false,
        };
        let sessions = group_records(records, options);
        let original = sessions.values().next().unwrap().clone();

        let regrouped = group_records(original.to_records(), options);
        assert_eq!(regrouped.len(), 1);
        assert_eq!(regrouped[&original.key], original);
    }

    #[test]
    fn test_deltas_and_duration() {
        let records = vec![
            rec(0, "alice", "evil.example", 1, 1),
            rec(60, "alice", "evil.example", 1, 1),
            rec(180, "alice", "evil.example", 1, 1),
        ];
        let sessions = group_records(records, KeyOptions::default());
        let session = &sessions[&SessionKey::new("alice", "evil.example")];

        assert_eq!(session.deltas_secs(), vec![60.0, 120.0]);
        assert_eq!(session.duration_secs(), 180.0);
        assert!((session.duration_hours() - 0.05).abs() < 1e-12);
    }

    #[test]
    fn test_sub_second_deltas() {
        let mut session = Session::new(SessionKey::new("a", "b"));
        let base = at(0);
        session.observe(&ConnectionRecord::new(base, "a", "b", 0, 0));
        session.observe(&ConnectionRecord::new(
            base + chrono::Duration::milliseconds(1500),
            "a",
            "b",
            0,
            0,
        ));
        assert_eq!(session.deltas_secs(), vec![1.5]);
    }

    #[test]
    fn test_empty_session() {
        let session = Session::new(SessionKey::new("a", "b"));
        assert!(session.is_empty());
        assert!(session.deltas_secs().is_empty());
        assert_eq!(session.duration_secs(), 0.0);
    }
}
