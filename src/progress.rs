//! Import progress reporting.
//!
//! Reports observable progress during `whois-ingest ingest` and `reingest` so
//! operators see how many records have been processed and how they were
//! classified. Progress is emitted on **stderr** so stdout remains parseable
//! for scripts.

use std::io::Write;

use crate::stats::Stats;

/// A single progress event for an import.
#[derive(Clone, Debug)]
pub enum ImportProgressEvent {
    /// Pipelines are starting for this version.
    Started { version: u64, reingest: bool },
    /// Periodic snapshot of the running totals.
    Ingesting { version: u64, stats: Stats },
}

/// Reports import progress. Implementations write to stderr (human or JSON).
pub trait ImportProgressReporter: Send + Sync {
    /// Emit a progress event. Called from the import supervisor.
    fn report(&self, event: ImportProgressEvent);
}

/// Human-friendly progress on stderr: "ingest v2  1,234 records  new 10  updated 2 ...".
pub struct StderrProgress;

impl ImportProgressReporter for StderrProgress {
    fn report(&self, event: ImportProgressEvent) {
        let line = match &event {
            ImportProgressEvent::Started { version, reingest } => {
                let mode = if *reingest { "reingest" } else { "ingest" };
                format!("{} v{}  starting...\n", mode, version)
            }
            ImportProgressEvent::Ingesting { version, stats } => format!(
                "ingest v{}  {} records  new {}  updated {}  unchanged {}  duplicates {}\n",
                version,
                format_number(stats.total),
                format_number(stats.new),
                format_number(stats.updated),
                format_number(stats.unchanged),
                format_number(stats.duplicates),
            ),
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ImportProgressReporter for JsonProgress {
    fn report(&self, event: ImportProgressEvent) {
        let obj = match &event {
            ImportProgressEvent::Started { version, reingest } => serde_json::json!({
                "event": "progress",
                "phase": "starting",
                "version": version,
                "reingest": reingest
            }),
            ImportProgressEvent::Ingesting { version, stats } => serde_json::json!({
                "event": "progress",
                "phase": "ingesting",
                "version": version,
                "total": stats.total,
                "new": stats.new,
                "updated": stats.updated,
                "unchanged": stats.unchanged,
                "duplicates": stats.duplicates,
                "failed": stats.failed
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ImportProgressReporter for NoProgress {
    fn report(&self, _event: ImportProgressEvent) {}
}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    /// Parse a `--progress` value.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "off" | "none" => Some(ProgressMode::Off),
            "human" => Some(ProgressMode::Human),
            "json" => Some(ProgressMode::Json),
            _ => None,
        }
    }

    /// Build a reporter for this mode. Caller can pass it to the populator.
    pub fn reporter(&self) -> Box<dyn ImportProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
