//! Import statistics.
//!
//! A single aggregator thread owns the running totals. Pipeline threads hold a
//! [`StatHandle`] that batches events and sends them in chunks, flushing on
//! drop. Totals can be seeded from a stored [`MetadataRecord`] so a resumed
//! import keeps counting where the interrupted one stopped.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use serde::Serialize;
use tracing::debug;

use whois_ingest_core::diff::Outcome;
use whois_ingest_core::models::MetadataRecord;

const MAX_CHUNK_SIZE: usize = 100;
const POLL: Duration = Duration::from_millis(200);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Stat {
    Total,
    New,
    Updated,
    Unchanged,
    Duplicates,
    /// Entries lost to a failed fetch. Reported, never persisted.
    Failed,
}

#[derive(Clone, Debug)]
enum StatEvent {
    Incr(Stat),
    Changed(String),
}

/// Running totals of one import.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub total: u64,
    pub new: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub duplicates: u64,
    pub failed: u64,
    pub changed_stats: BTreeMap<String, u64>,
}

impl Stats {
    /// Totals recorded in a stored metadata record.
    pub fn from_record(record: &MetadataRecord) -> Self {
        Self {
            total: record.total,
            new: record.new,
            updated: record.updated,
            unchanged: record.unchanged,
            duplicates: record.duplicates,
            failed: 0,
            changed_stats: record.changed_stats.clone(),
        }
    }

    /// Copy the persisted counters into `record`.
    pub fn apply_to(&self, record: &mut MetadataRecord) {
        record.total = self.total;
        record.new = self.new;
        record.updated = self.updated;
        record.unchanged = self.unchanged;
        record.duplicates = self.duplicates;
        record.changed_stats = self.changed_stats.clone();
    }

    fn apply(&mut self, event: StatEvent) {
        match event {
            StatEvent::Incr(stat) => {
                let slot = match stat {
                    Stat::Total => &mut self.total,
                    Stat::New => &mut self.new,
                    Stat::Updated => &mut self.updated,
                    Stat::Unchanged => &mut self.unchanged,
                    Stat::Duplicates => &mut self.duplicates,
                    Stat::Failed => &mut self.failed,
                };
                *slot += 1;
            }
            StatEvent::Changed(field) => {
                *self.changed_stats.entry(field).or_insert(0) += 1;
            }
        }
    }
}

/// Aggregates stat events from every pipeline thread.
pub struct StatTracker {
    sender: Sender<Vec<StatEvent>>,
    totals: Arc<Mutex<Stats>>,
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl StatTracker {
    /// Start the aggregator thread with `seed` as the initial totals.
    pub fn start(seed: Stats) -> Self {
        let (sender, receiver) = unbounded::<Vec<StatEvent>>();
        let totals = Arc::new(Mutex::new(seed));
        let shutdown = Arc::new(AtomicBool::new(false));

        let thread = {
            let totals = Arc::clone(&totals);
            let shutdown = Arc::clone(&shutdown);
            std::thread::Builder::new()
                .name("stat-tracker".into())
                .spawn(move || aggregate(receiver, totals, shutdown))
                .ok()
        };
        if thread.is_none() {
            tracing::error!("unable to spawn stat tracker thread");
        }

        Self {
            sender,
            totals,
            shutdown,
            thread,
        }
    }

    /// A batching handle for one worker thread.
    pub fn handle(&self) -> StatHandle {
        StatHandle {
            sender: self.sender.clone(),
            chunk: Vec::new(),
        }
    }

    /// Current totals.
    pub fn snapshot(&self) -> Stats {
        self.totals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Drain outstanding events, stop the aggregator and return final totals.
    pub fn stop(&mut self) -> Stats {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        self.snapshot()
    }
}

impl Drop for StatTracker {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn aggregate(receiver: Receiver<Vec<StatEvent>>, totals: Arc<Mutex<Stats>>, shutdown: Arc<AtomicBool>) {
    let apply = |chunk: Vec<StatEvent>| {
        let mut stats = totals.lock().unwrap_or_else(PoisonError::into_inner);
        for event in chunk {
            stats.apply(event);
        }
    };

    loop {
        match receiver.recv_timeout(POLL) {
            Ok(chunk) => apply(chunk),
            Err(RecvTimeoutError::Timeout) => {
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    while let Ok(chunk) = receiver.try_recv() {
        apply(chunk);
    }
    debug!("stat tracker exiting");
}

/// Per-thread batching sender for stat events.
pub struct StatHandle {
    sender: Sender<Vec<StatEvent>>,
    chunk: Vec<StatEvent>,
}

impl StatHandle {
    /// A new, empty handle feeding the same tracker.
    pub fn fork(&self) -> StatHandle {
        StatHandle {
            sender: self.sender.clone(),
            chunk: Vec::new(),
        }
    }

    pub fn incr(&mut self, stat: Stat) {
        self.push(StatEvent::Incr(stat));
    }

    pub fn add_changed(&mut self, field: &str) {
        self.push(StatEvent::Changed(field.to_string()));
    }

    /// Count one settled entry: `total`, its outcome and, for updates, the
    /// fields that changed.
    pub fn record(&mut self, outcome: Outcome, changed: &[String]) {
        if !outcome.counted() {
            return;
        }
        self.incr(Stat::Total);
        match outcome {
            Outcome::Skipped => {}
            Outcome::Duplicate => self.incr(Stat::Duplicates),
            Outcome::New => self.incr(Stat::New),
            Outcome::Unchanged => self.incr(Stat::Unchanged),
            Outcome::Updated => {
                self.incr(Stat::Updated);
                for field in changed {
                    self.add_changed(field);
                }
            }
        }
    }

    pub fn flush(&mut self) {
        if self.chunk.is_empty() {
            return;
        }
        let chunk = std::mem::take(&mut self.chunk);
        let _ = self.sender.send(chunk);
    }

    fn push(&mut self, event: StatEvent) {
        self.chunk.push(event);
        if self.chunk.len() >= MAX_CHUNK_SIZE {
            self.flush();
        }
    }
}

impl Drop for StatHandle {
    fn drop(&mut self) {
        self.flush();
    }
}

/// Human-readable summary of an import's totals.
pub fn render_summary(title: &str, stats: &Stats) -> String {
    let mut out = String::new();
    out.push_str(title);
    out.push('\n');
    out.push_str(&"=".repeat(title.chars().count()));
    out.push_str("\n\n");
    out.push_str(&format!("  Total:       {}\n", stats.total));
    out.push_str(&format!("  New:         {}\n", stats.new));
    out.push_str(&format!("  Updated:     {}\n", stats.updated));
    out.push_str(&format!("  Unchanged:   {}\n", stats.unchanged));
    out.push_str(&format!("  Duplicates:  {}\n", stats.duplicates));
    if stats.failed > 0 {
        out.push_str(&format!("  Failed:      {}\n", stats.failed));
    }
    if !stats.changed_stats.is_empty() {
        out.push_str("\n  Changed fields:\n");
        let mut fields: Vec<(&String, &u64)> = stats.changed_stats.iter().collect();
        fields.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        for (field, count) in fields {
            out.push_str(&format!("    {:<30} {}\n", field, count));
        }
    }
    out
}
