//! # whois-ingest CLI
//!
//! The `whois-ingest` binary drives versioned imports of WHOIS CSV exports
//! into Elasticsearch and exposes the operator actions around them.
//!
//! ## Usage
//!
//! ```bash
//! whois-ingest --config ./config/whois-ingest.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `whois-ingest ingest` | Import a file or directory as the next version |
//! | `whois-ingest reingest` | Resume an interrupted import or repeat the last one |
//! | `whois-ingest config-template` | Install the index template and exit |
//! | `whois-ingest clear-interrupted` | Discard the interrupted-import marker |
//! | `whois-ingest stats [VERSION]` | Show the stored totals of a version |
//!
//! ## Examples
//!
//! ```bash
//! # First import bootstraps templates, metadata and indices
//! whois-ingest ingest -d ./data/2024-01 -D 2024-01-01 -o "January export"
//!
//! # Quarterly export, only compare registrant fields
//! whois-ingest ingest -d ./data/2024-q2 -D 2024-04-00 -n registrant_name,registrant_email
//!
//! # Resume after a crash or Ctrl-C
//! whois-ingest reingest -d ./data/2024-q2
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use whois_ingest::config::{self, Config, LogFormat, LoggingConfig};
use whois_ingest::elastic::ElasticBackend;
use whois_ingest::events::EventTracker;
use whois_ingest::file_reader::InputSource;
use whois_ingest::ingest::{DataPopulator, PopulatorOptions};
use whois_ingest::ingest_handler::IngestHandler;
use whois_ingest::progress::ProgressMode;
use whois_ingest::stats::{render_summary, Stats};

/// whois-ingest: versioned, diffable WHOIS ingestion into Elasticsearch.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/whois-ingest.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "whois-ingest",
    about = "Versioned, diffable bulk ingestion of WHOIS CSV records into Elasticsearch",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/whois-ingest.toml")]
    config: PathBuf,

    /// Debug-level logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Trace-level logging, including every per-domain decision.
    #[arg(long, global = true)]
    debug: bool,

    /// Progress on stderr: `off`, `human` or `json`. Defaults to `human`
    /// when stderr is a terminal.
    #[arg(long, global = true, value_parser = parse_progress)]
    progress: Option<ProgressMode>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Import a file or directory as the next version.
    ///
    /// The first import on an empty cluster installs the index template and
    /// creates the metadata and data indices. Refuses to start while a
    /// previous import is marked interrupted.
    Ingest {
        #[command(flatten)]
        source: SourceArgs,

        /// Date the data represents (YYYY-MM-DD). `YYYY-MM-00` marks a
        /// quarterly export and is stored as the first of the month.
        #[arg(short = 'D', long, value_parser = parse_ingest_day)]
        ingest_day: Option<String>,

        /// Free-text comment stored with this version.
        #[arg(short = 'o', long)]
        comment: Option<String>,

        /// Only compare these detail fields when detecting changes.
        #[arg(short = 'n', long, value_delimiter = ',', conflicts_with = "exclude")]
        include: Option<Vec<String>>,

        /// Ignore these detail fields when detecting changes.
        #[arg(short = 'x', long, value_delimiter = ',')]
        exclude: Option<Vec<String>>,
    },

    /// Resume an interrupted import, or repeat the last one.
    ///
    /// Reuses the stored field filters and continues the stored counters.
    /// Records already at the target version are skipped.
    Reingest {
        #[command(flatten)]
        source: SourceArgs,
    },

    /// Install the index template for the cluster's major version and exit.
    ConfigTemplate,

    /// Clear the interrupted-import marker so `ingest` can start a new version.
    ClearInterrupted,

    /// Print the stored totals of a version (default: the last one).
    Stats { version: Option<u64> },
}

#[derive(Args)]
struct SourceArgs {
    /// Import a single CSV file.
    #[arg(short = 'f', long, conflicts_with = "directory", required_unless_present = "directory")]
    file: Option<PathBuf>,

    /// Import every matching file under a directory, in name order.
    #[arg(short = 'd', long)]
    directory: Option<PathBuf>,

    /// File extension to import from a directory; empty admits every file.
    #[arg(short = 'e', long)]
    extension: Option<String>,

    /// Number of parallel pipelines.
    #[arg(long)]
    pipelines: Option<usize>,

    /// Fetcher threads per pipeline.
    #[arg(long)]
    fetcher_threads: Option<usize>,

    /// Shipper threads per pipeline.
    #[arg(long)]
    shipper_threads: Option<usize>,

    /// Documents per bulk lookup.
    #[arg(long)]
    bulk_fetch_size: Option<usize>,

    /// Writes per bulk request.
    #[arg(long)]
    bulk_ship_size: Option<usize>,

    /// Print a summary of the run's totals when done.
    #[arg(short = 's', long)]
    stats: bool,
}

impl SourceArgs {
    fn input(&self) -> Option<InputSource> {
        match (&self.file, &self.directory) {
            (Some(file), _) => Some(InputSource::File(file.clone())),
            (None, Some(dir)) => Some(InputSource::Directory(dir.clone())),
            (None, None) => None,
        }
    }

    fn apply(&self, mut options: PopulatorOptions) -> PopulatorOptions {
        if let Some(source) = self.input() {
            options = options.with_source(source);
        }
        if let Some(ext) = &self.extension {
            options.extension = ext.clone();
        }
        if let Some(n) = self.pipelines {
            options.pipelines = n;
        }
        if let Some(n) = self.fetcher_threads {
            options.fetcher_threads = n;
        }
        if let Some(n) = self.shipper_threads {
            options.shipper_threads = n;
        }
        if let Some(n) = self.bulk_fetch_size {
            options.bulk_fetch_size = n;
        }
        if let Some(n) = self.bulk_ship_size {
            options.bulk_ship_size = n;
        }
        options
    }
}

fn parse_progress(value: &str) -> Result<ProgressMode, String> {
    ProgressMode::parse(value)
        .ok_or_else(|| format!("invalid progress mode '{}', expected off, human or json", value))
}

/// Validate an ingest day, mapping the quarterly `YYYY-MM-00` form to the
/// first of the month.
fn parse_ingest_day(value: &str) -> Result<String, String> {
    let normalized = match value.strip_suffix("-00") {
        Some(month) => format!("{}-01", month),
        None => value.to_string(),
    };
    NaiveDate::parse_from_str(&normalized, "%Y-%m-%d")
        .map(|d| d.format("%Y-%m-%d").to_string())
        .map_err(|_| format!("invalid ingest day '{}', expected YYYY-MM-DD", value))
}

fn init_logging(logging: &LoggingConfig, verbose: bool, debug: bool) {
    let filter = if debug {
        EnvFilter::new("trace")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level))
    };
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

fn build_handler(cfg: &Config) -> anyhow::Result<IngestHandler> {
    let backend = ElasticBackend::new(&cfg.elastic)?;
    Ok(IngestHandler::new(
        Arc::new(backend),
        &cfg.elastic.index_prefix,
        cfg.elastic.rollover_size,
        Duration::from_secs(cfg.ingest.rollover_check_secs),
    ))
}

fn print_run(version_label: &str, stats: &Stats, detailed: bool) {
    if detailed {
        print!("{}", render_summary(version_label, stats));
    } else {
        println!(
            "{}: {} records ({} new, {} updated, {} unchanged, {} duplicates)",
            version_label, stats.total, stats.new, stats.updated, stats.unchanged, stats.duplicates
        );
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    init_logging(&cfg.logging, cli.verbose, cli.debug);

    let handler = build_handler(&cfg)?;
    let events = EventTracker::new();
    let progress = cli.progress.unwrap_or_else(ProgressMode::default_for_tty);
    let options = PopulatorOptions::from_config(&cfg.ingest);

    match cli.command {
        Commands::Ingest {
            source,
            ingest_day,
            comment,
            include,
            exclude,
        } => {
            let mut options = source.apply(options);
            if let Some(day) = ingest_day {
                options.ingest_day = day;
            }
            options.comment = comment.unwrap_or_default();
            options.include_fields = include;
            options.exclude_fields = exclude;

            let mut populator = DataPopulator::new(handler, options, events.clone())
                .with_progress(progress.reporter());
            install_interrupt_handler(&events)?;
            let stats = populator.ingest().context("Import failed")?;
            let version = populator.metadata(None)?.metadata;
            print_run(&format!("Version {}", version), &stats, source.stats);
        }
        Commands::Reingest { source } => {
            let options = source.apply(options);
            let mut populator = DataPopulator::new(handler, options, events.clone())
                .with_progress(progress.reporter());
            install_interrupt_handler(&events)?;
            let stats = populator.reingest().context("Reingest failed")?;
            let version = populator.metadata(None)?.metadata;
            print_run(&format!("Version {} (reingest)", version), &stats, source.stats);
        }
        Commands::ConfigTemplate => {
            DataPopulator::new(handler, options, events).config_template()?;
            println!("Index template configured.");
        }
        Commands::ClearInterrupted => {
            DataPopulator::new(handler, options, events).clear_interrupted()?;
            println!("Interrupted import cleared.");
        }
        Commands::Stats { version } => {
            let record = DataPopulator::new(handler, options, events).metadata(version)?;
            let title = format!("Version {}", record.metadata);
            println!("Comment:        {}", record.comment);
            println!("Date processed: {}", record.date_processed);
            println!("Date ingested:  {}", record.date_ingest);
            println!();
            print!("{}", render_summary(&title, &Stats::from_record(&record)));
        }
    }

    Ok(())
}

/// Ctrl-C cancels the running import; the supervisor finalizes what it can.
fn install_interrupt_handler(events: &EventTracker) -> anyhow::Result<()> {
    let events = events.clone();
    ctrlc::set_handler(move || {
        eprintln!("Interrupt received, shutting down...");
        events.set_shutdown();
    })
    .context("Failed to install interrupt handler")
}
