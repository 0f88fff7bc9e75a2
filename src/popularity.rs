//! Popular destination suppression.
//!
//! Destinations reached by many distinct sources are shared infrastructure
//! (CDNs, update servers, SaaS) and almost never a targeted C2 endpoint.
//! Sessions towards a destination with more than `max_sources` distinct
//! sources are dropped before scoring; exactly `max_sources` is kept.

use std::collections::{HashMap, HashSet};

use tracing::{debug, trace};

use crate::record::SessionKey;
use crate::session::Session;

/// Counts distinct sources per destination across all sessions.
pub fn distinct_sources_per_destination<'a, I>(keys: I) -> HashMap<&'a str, usize>
where
    I: IntoIterator<Item = &'a SessionKey>,
{
    let mut sources: HashMap<&str, HashSet<&str>> = HashMap::new();
    for key in keys {
        sources
            .entry(key.destination.as_str())
            .or_default()
            .insert(key.source.as_str());
    }
    sources
        .into_iter()
        .map(|(destination, set)| (destination, set.len()))
        .collect()
}

/// Sessions that survived the filter, plus what was dropped.
#[derive(Debug, Default)]
pub struct PopularityOutcome {
    pub retained: Vec<Session>,
    /// Dropped destinations with their distinct-source count.
    pub dropped_destinations: HashMap<String, usize>,
    pub dropped_sessions: usize,
}

/// Removes sessions whose destination has more than `max_sources`
/// distinct sources.
pub fn filter_popular_destinations(
    sessions: HashMap<SessionKey, Session>,
    max_sources: usize,
) -> PopularityOutcome {
    let popular: HashMap<String, usize> = distinct_sources_per_destination(sessions.keys())
        .into_iter()
        .filter(|(_, count)| *count > max_sources)
        .map(|(destination, count)| (destination.to_string(), count))
        .collect();

    let mut outcome = PopularityOutcome {
        dropped_destinations: popular,
        ..Default::default()
    };

    for (key, session) in sessions {
        if outcome.dropped_destinations.contains_key(&key.destination) {
            trace!("Dropping {} (popular destination)", key);
            outcome.dropped_sessions += 1;
        } else {
            outcome.retained.push(session);
        }
    }

    debug!(
        "Popularity filter: {} sessions kept, {} dropped across {} destinations",
        outcome.retained.len(),
        outcome.dropped_sessions,
        outcome.dropped_destinations.len()
    );

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{ConnectionRecord, KeyOptions};
    use crate::session::group_records;
    use chrono::{TimeZone, Utc};

    fn sessions_for(pairs: &[(&str, &str)]) -> HashMap<SessionKey, Session> {
        let base = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let records = pairs
            .iter()
            .enumerate()
            .map(|(i, (src, dst))| {
                ConnectionRecord::new(base + chrono::Duration::seconds(i as i64), *src, *dst, 1, 1)
            });
        group_records(records, KeyOptions::default())
    }

    #[test]
    fn test_counts_distinct_sources() {
        let sessions = sessions_for(&[
            ("a", "cdn.example"),
            ("b", "cdn.example"),
            ("a", "cdn.example"),
            ("a", "evil.example"),
        ]);
        let counts = distinct_sources_per_destination(sessions.keys());
        assert_eq!(counts["cdn.example"], 2);
        assert_eq!(counts["evil.example"], 1);
    }

    #[test]
    fn test_drops_destination_above_threshold() {
        let mut pairs: Vec<(&str, &str)> = ["s1", "s2", "s3", "s4", "s5", "s6"]
            .iter()
            .map(|s| (*s, "cdn.example"))
            .collect();
        pairs.push(("alice", "evil.example"));

        let outcome = filter_popular_destinations(sessions_for(&pairs), 5);

        assert_eq!(outcome.retained.len(), 1);
        assert_eq!(outcome.retained[0].key.destination, "evil.example");
        assert_eq!(outcome.dropped_sessions, 6);
        assert_eq!(outcome.dropped_destinations["cdn.example"], 6);
    }

    #[test]
    fn test_keeps_destination_at_threshold() {
        let pairs: Vec<(&str, &str)> = ["s1", "s2", "s3", "s4", "s5"]
            .iter()
            .map(|s| (*s, "shared.example"))
            .collect();

        let outcome = filter_popular_destinations(sessions_for(&pairs), 5);

        assert_eq!(outcome.retained.len(), 5);
        assert!(outcome.dropped_destinations.is_empty());
    }

    #[test]
    fn test_port_split_sessions_count_source_once() {
        let base = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let records = vec![
            ConnectionRecord::new(base, "a", "evil.example", 1, 1).with_port(80),
            ConnectionRecord::new(base, "a", "evil.example", 1, 1).with_port(443),
            ConnectionRecord::new(base, "b", "evil.example", 1, 1).with_port(443),
        ];
        let options = KeyOptions {
            port: true,
            method: false,
        };
        let sessions = group_records(records, options);
        assert_eq!(sessions.len(), 3);

        let outcome = filter_popular_destinations(sessions, 2);
        assert_eq!(outcome.retained.len(), 3);
    }
}
