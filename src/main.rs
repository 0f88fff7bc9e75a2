//! beacon-finder: offline C2 beacon detection over connection logs.
//!
//! Reads proxy, DNS or other delimited connection logs, groups them into
//! source/destination sessions and scores each session on how regular its
//! timing and payload sizes are.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐     ┌──────────────────────────────────────────┐     ┌──────────┐
//! │  Ingest  │────>│                 Engine                   │────>│  Export  │
//! │  (csv)   │     │ group > popularity > gates > score > rank│     │ text/json│
//! └──────────┘     └──────────────────────────────────────────┘     └──────────┘
//!                        one tokio task per eligible session
//! ```

mod config;
mod engine;
mod error;
mod export;
mod ingest;
mod popularity;
mod ranker;
mod record;
mod scorer;
mod session;
mod stats;
mod subdomains;
mod synth;

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use crate::config::{delimiter_byte, Config, InputPreset};
use crate::engine::BeaconEngine;
use crate::export::{write_report, OutputFormat};
use crate::ingest::LogReader;
use crate::ranker::ResultRanker;
use crate::subdomains::{count_subdomains, read_column};
use crate::synth::{generate, SynthConfig};

/// beacon-finder: find periodic command-and-control check-ins in connection logs.
#[derive(Parser, Debug)]
#[command(name = "beacon-finder")]
#[command(version)]
#[command(about = "Detect C2 beaconing in proxy and DNS logs via interval and size statistics")]
#[command(long_about = None)]
struct Cli {
    /// Enable verbose logging (writes to stderr).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Score the sessions of a connection log.
    Analyze(AnalyzeArgs),

    /// Print a default configuration file.
    GenerateConfig,

    /// Write a synthetic proxy log with one planted beacon.
    Synth {
        /// Output file (default: stdout).
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Hours of traffic to generate.
        #[arg(long, default_value = "8")]
        hours: u32,

        /// Number of background sources.
        #[arg(long, default_value = "200")]
        sources: usize,

        /// Beacon interval in seconds.
        #[arg(long, default_value = "60")]
        interval: i64,

        /// Maximum beacon jitter in seconds, either direction.
        #[arg(long, default_value = "10")]
        jitter: i64,

        /// Seed for reproducible output.
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Count distinct subdomains per root domain in one column of a log.
    Subdomains {
        /// Path to the log file.
        #[arg(short, long)]
        input: PathBuf,

        /// Field delimiter.
        #[arg(short, long, default_value = ",")]
        delimiter: char,

        /// Zero-based column holding the domain name.
        #[arg(short, long, default_value = "2")]
        column: usize,

        /// Skip names containing this keyword (repeatable).
        #[arg(long = "ignore")]
        ignore: Vec<String>,
    },
}

#[derive(Args, Debug)]
struct AnalyzeArgs {
    /// Path to the connection log.
    #[arg(short, long)]
    input: PathBuf,

    /// Write results to this file instead of stdout.
    #[arg(short, long, conflicts_with = "output_default")]
    output: Option<PathBuf>,

    /// Write results to `<input>.out`.
    #[arg(short = 'O', long)]
    output_default: bool,

    /// TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Output format: text, json, jsonl.
    #[arg(short, long)]
    format: Option<OutputFormat>,

    /// Only report the N best sessions.
    #[arg(long)]
    top: Option<usize>,

    /// Use the space-delimited proxy log layout (groups by port and method).
    #[arg(short = 'P', long, conflicts_with = "dns")]
    proxy: bool,

    /// Use the DNS log layout (no payload sizes).
    #[arg(short = 'D', long)]
    dns: bool,

    /// Field delimiter.
    #[arg(short, long)]
    delimiter: Option<char>,

    /// Timestamp format (strftime), or `epoch` for Unix seconds.
    #[arg(short = 'T', long)]
    time_format: Option<String>,

    /// Keep source and destination case as logged.
    #[arg(long)]
    no_case: bool,

    /// Skip unparsable rows instead of failing.
    #[arg(long)]
    skip_malformed: bool,

    /// Column of the timestamp.
    #[arg(long)]
    time_col: Option<usize>,

    /// Column of the source.
    #[arg(long)]
    source_col: Option<usize>,

    /// Column of the destination.
    #[arg(long)]
    dest_col: Option<usize>,

    /// Column of bytes received.
    #[arg(long)]
    recv_col: Option<usize>,

    /// Column of bytes sent.
    #[arg(long)]
    sent_col: Option<usize>,

    /// Column of the request method (also groups by method).
    #[arg(long)]
    method_col: Option<usize>,

    /// Column of the destination port (also groups by port).
    #[arg(long)]
    port_col: Option<usize>,

    /// Minimum connections a session needs to be scored.
    #[arg(short = 'm', long)]
    min_connections: Option<usize>,

    /// Destinations seen from more sources than this are ignored.
    #[arg(short = 's', long)]
    max_sources: Option<usize>,

    /// Report sessions scoring above this value.
    #[arg(short = 'S', long)]
    min_score: Option<f64>,

    /// Minimum session duration in hours.
    #[arg(short = 'H', long)]
    min_duration: Option<f64>,

    /// Disable payload size analysis.
    #[arg(short = 'B', long)]
    no_bytes: bool,

    /// Report every scored session regardless of score.
    #[arg(short = 'X', long)]
    debug: bool,

    /// Weight of the timing score.
    #[arg(long)]
    w_time: Option<f64>,

    /// Weight of the size score.
    #[arg(long)]
    w_data: Option<f64>,

    /// Weight of the timing skew sub-score.
    #[arg(long)]
    w_ts_skew: Option<f64>,

    /// Weight of the timing dispersion sub-score.
    #[arg(long)]
    w_ts_madm: Option<f64>,

    /// Weight of the connection rate sub-score.
    #[arg(long)]
    w_ts_conn: Option<f64>,

    /// Weight of the size skew sub-score.
    #[arg(long)]
    w_ds_skew: Option<f64>,

    /// Weight of the size dispersion sub-score.
    #[arg(long)]
    w_ds_madm: Option<f64>,

    /// Weight of the size smallness sub-score.
    #[arg(long)]
    w_ds_small: Option<f64>,

    /// Payload size (bytes) at which the smallness score reaches 0.
    #[arg(long)]
    tune_smallness: Option<f64>,

    /// Interval MADM (seconds) at which the timing dispersion score reaches 0.
    #[arg(long)]
    jitter: Option<f64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so stdout stays clean for results
    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    match cli.command {
        Commands::Analyze(args) => run_analyze(args).await,

        Commands::GenerateConfig => {
            println!("{}", Config::generate_default());
            Ok(())
        }

        Commands::Synth {
            output,
            hours,
            sources,
            interval,
            jitter,
            seed,
        } => {
            let config = SynthConfig {
                hours,
                sources,
                beacon_interval_secs: interval,
                beacon_jitter_secs: jitter,
                ..SynthConfig::default()
            };
            run_synth(&config, seed, output.as_deref())
        }

        Commands::Subdomains {
            input,
            delimiter,
            column,
            ignore,
        } => {
            let delimiter = delimiter_byte(delimiter)?;
            let names = read_column(&input, delimiter, column)?;
            for count in count_subdomains(&names, &ignore) {
                println!("{} {}", count.subdomains, count.root);
            }
            Ok(())
        }
    }
}

async fn run_analyze(args: AnalyzeArgs) -> Result<()> {
    let config = build_config(&args)?;
    let output = resolve_output(&args, &config)?;

    let reader = LogReader::new(&config.input, !config.engine.no_bytes);
    let ingest = reader.read_path(&args.input)?;
    info!(
        "Loaded {} records ({} placeholder rows, {} malformed rows skipped)",
        ingest.records.len(),
        ingest.placeholder_rows,
        ingest.malformed_rows
    );

    let report = BeaconEngine::new(config.engine.clone())
        .with_ranker(build_ranker(&config))
        .run(ingest.records)
        .await?;

    if report.ranked.is_empty() {
        info!("No sessions scored above {}", config.engine.min_score);
    }
    if !report.failures.is_empty() {
        warn!("{} sessions could not be scored", report.failures.len());
    }

    write_report(&report, config.output.format, output.as_deref())
}

/// Layers the config file, preset and command-line flags over the defaults.
fn build_config(args: &AnalyzeArgs) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    if args.proxy {
        config.apply_preset(InputPreset::Proxy);
    } else if args.dns {
        config.apply_preset(InputPreset::Dns);
    }

    let input = &mut config.input;
    if let Some(delimiter) = args.delimiter {
        input.delimiter = delimiter;
    }
    if let Some(format) = &args.time_format {
        input.time_format = format.clone();
    }
    if args.no_case {
        input.lowercase = false;
    }
    if args.skip_malformed {
        input.skip_malformed = true;
    }

    let columns = &mut input.columns;
    override_value(&mut columns.time, args.time_col);
    override_value(&mut columns.source, args.source_col);
    override_value(&mut columns.destination, args.dest_col);
    if args.recv_col.is_some() {
        columns.bytes_received = args.recv_col;
    }
    if args.sent_col.is_some() {
        columns.bytes_sent = args.sent_col;
    }
    if args.method_col.is_some() {
        columns.method = args.method_col;
        config.engine.group_by_method = true;
    }
    if args.port_col.is_some() {
        columns.port = args.port_col;
        config.engine.group_by_port = true;
    }

    let engine = &mut config.engine;
    override_value(&mut engine.min_connections, args.min_connections);
    override_value(&mut engine.max_sources, args.max_sources);
    override_value(&mut engine.min_score, args.min_score);
    override_value(&mut engine.min_duration_hours, args.min_duration);
    if args.no_bytes {
        engine.no_bytes = true;
    }
    if args.debug {
        engine.debug = true;
    }

    let weights = &mut engine.weights;
    override_value(&mut weights.time, args.w_time);
    override_value(&mut weights.data, args.w_data);
    override_value(&mut weights.ts_skew, args.w_ts_skew);
    override_value(&mut weights.ts_madm, args.w_ts_madm);
    override_value(&mut weights.ts_conn, args.w_ts_conn);
    override_value(&mut weights.ds_skew, args.w_ds_skew);
    override_value(&mut weights.ds_madm, args.w_ds_madm);
    override_value(&mut weights.ds_small, args.w_ds_small);

    override_value(&mut engine.tuning.smallness_bytes, args.tune_smallness);
    override_value(&mut engine.tuning.jitter_secs, args.jitter);

    if let Some(format) = args.format {
        config.output.format = format;
    }
    if args.top.is_some() {
        config.output.top = args.top;
    }

    config.validate()?;
    Ok(config)
}

/// Re-applies the score threshold at ranking time unless every scored
/// session was asked for, then truncates to `top`.
fn build_ranker(config: &Config) -> ResultRanker {
    let mut ranker = ResultRanker::new();
    if !config.engine.debug {
        ranker = ranker.with_threshold(config.engine.min_score);
    }
    if let Some(top) = config.output.top {
        ranker = ranker.with_limit(top);
    }
    ranker
}

fn override_value<T>(target: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *target = value;
    }
}

/// Picks the output file (`None` is stdout) and refuses to overwrite the input.
fn resolve_output(args: &AnalyzeArgs, config: &Config) -> Result<Option<PathBuf>> {
    let output = if args.output_default {
        let mut name = args.input.as_os_str().to_owned();
        name.push(".out");
        Some(PathBuf::from(name))
    } else {
        args.output
            .clone()
            .or_else(|| config.output.file.as_ref().map(PathBuf::from))
    };

    if let Some(path) = &output {
        if same_file(path, &args.input) {
            anyhow::bail!(
                "Output file {} would overwrite the input log",
                path.display()
            );
        }
    }
    Ok(output)
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

fn run_synth(config: &SynthConfig, seed: Option<u64>, output: Option<&Path>) -> Result<()> {
    let seed = seed.unwrap_or_else(rand::random);
    info!("Generating {} hours of traffic (seed {})", config.hours, seed);
    let mut rng = StdRng::seed_from_u64(seed);

    let mut writer: Box<dyn Write> = match output {
        Some(path) => Box::new(BufWriter::new(File::create(path).with_context(|| {
            format!("Failed to create output file: {}", path.display())
        })?)),
        None => Box::new(BufWriter::new(io::stdout().lock())),
    };

    let summary =
        generate(config, &mut rng, &mut writer).context("Failed to write synthetic log")?;
    info!(
        "Wrote {} lines, {} from beacon source {}",
        summary.lines, summary.beacon_lines, summary.beacon_source
    );
    Ok(())
}
