//! Synthetic proxy log generator.
//!
//! Produces one background connection per second drawn from a pool of
//! sources and domains, plus a single planted beacon to `itsabeacon.com`
//! firing every `interval ± jitter` seconds with fixed payload sizes. The
//! output uses the default 13-column comma-delimited layout so it can be fed
//! straight back into `analyze`.

use std::io::Write;

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use tracing::debug;

use crate::config::PROXY_TIME_FORMAT;

pub const BEACON_DOMAIN: &str = "itsabeacon.com";

const AGENT: &str = "\"Mozilla/5.0_(Windows_NT_10.0;_Win64;_x64)_AppleWebKit/537.36_(KHTML,_like_Gecko)_Chrome/109.0.0.0_Safari/537.36\"";

/// Generator settings.
#[derive(Debug, Clone)]
pub struct SynthConfig {
    pub start: DateTime<Utc>,
    pub hours: u32,
    pub sources: usize,
    pub destination_ips: usize,
    pub domains: usize,
    pub beacon_interval_secs: i64,
    pub beacon_jitter_secs: i64,
    pub beacon_bytes_sent: u64,
    pub beacon_bytes_received: u64,
}

impl Default for SynthConfig {
    fn default() -> Self {
        Self {
            // 2023-03-02 20:58:27 UTC
            start: DateTime::from_timestamp(1_677_790_707, 0).unwrap_or_default(),
            hours: 8,
            sources: 200,
            destination_ips: 20,
            domains: 100,
            beacon_interval_secs: 60,
            beacon_jitter_secs: 10,
            beacon_bytes_sent: 300,
            beacon_bytes_received: 400,
        }
    }
}

/// What a generator run wrote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthSummary {
    pub lines: u64,
    pub beacon_lines: u64,
    pub beacon_source: String,
}

struct Line<'a> {
    time: &'a str,
    source_ip: &'a str,
    user: &'a str,
    dest_ip: &'a str,
    domain: &'a str,
    bytes_received: u64,
    bytes_sent: u64,
}

impl Line<'_> {
    fn write_to<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writeln!(
            writer,
            "{},{},{},{},\"category\",POST,443,{},/index.html,0,{},{},{}",
            self.time,
            self.source_ip,
            self.user,
            self.dest_ip,
            self.domain,
            AGENT,
            self.bytes_received,
            self.bytes_sent
        )
    }
}

/// Writes a synthetic log to `writer`.
pub fn generate<R: Rng, W: Write>(
    config: &SynthConfig,
    rng: &mut R,
    writer: &mut W,
) -> std::io::Result<SynthSummary> {
    let sources: Vec<(String, String)> = (1..=config.sources.max(1))
        .map(|i| (format!("172.30.0.{}", i), format!("user{}", i)))
        .collect();
    let dest_ips: Vec<String> = (1..=config.destination_ips.max(1))
        .map(|i| format!("99.11.99.{}", i))
        .collect();
    let domains: Vec<String> = (1..=config.domains.max(1))
        .map(|i| format!("domain{}.com", i))
        .collect();

    let (beacon_ip, beacon_user) = &sources[rng.random_range(0..sources.len())];
    let beacon_dest_ip = &dest_ips[rng.random_range(0..dest_ips.len())];
    debug!("Planting beacon from {} ({})", beacon_user, beacon_ip);

    let end = config.start + Duration::hours(i64::from(config.hours));
    let jitter = config.beacon_jitter_secs.abs();
    let mut now = config.start;
    let mut next_beacon = config.start;
    let mut summary = SynthSummary {
        lines: 0,
        beacon_lines: 0,
        beacon_source: beacon_user.clone(),
    };

    while now < end {
        let time = now.format(PROXY_TIME_FORMAT).to_string();

        if now >= next_beacon {
            let offset = rng.random_range(-jitter..=jitter);
            next_beacon += Duration::seconds(config.beacon_interval_secs + offset);
            Line {
                time: &time,
                source_ip: beacon_ip,
                user: beacon_user,
                dest_ip: beacon_dest_ip,
                domain: BEACON_DOMAIN,
                bytes_received: config.beacon_bytes_received,
                bytes_sent: config.beacon_bytes_sent,
            }
            .write_to(writer)?;
            summary.lines += 1;
            summary.beacon_lines += 1;
        }

        // one extra slot in each pool stands for the placeholder
        let (source_ip, user) = match rng.random_range(0..=sources.len()) {
            i if i == sources.len() => ("-", "-"),
            i => (sources[i].0.as_str(), sources[i].1.as_str()),
        };
        let dest_ip = match rng.random_range(0..=dest_ips.len()) {
            i if i == dest_ips.len() => "-",
            i => dest_ips[i].as_str(),
        };

        Line {
            time: &time,
            source_ip,
            user,
            dest_ip,
            domain: &domains[rng.random_range(0..domains.len())],
            bytes_received: rng.random_range(100..=1000),
            bytes_sent: rng.random_range(1000..=10000),
        }
        .write_to(writer)?;
        summary.lines += 1;

        now += Duration::seconds(1);
    }

    writer.flush()?;
    Ok(summary)
}
