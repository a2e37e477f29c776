//! Input discovery.
//!
//! The [`FileReader`] walks an input directory in sorted order (or admits a
//! single file), filters by extension and feeds paths into the shared file
//! queue. Whatever happens, it signals `file_reader_done` when it stops.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::Result;
use crossbeam_channel::{SendTimeoutError, Sender};
use globset::{Glob, GlobMatcher};
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::events::EventTracker;

const QUEUE_POLL: Duration = Duration::from_millis(100);

/// Where input files come from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InputSource {
    File(PathBuf),
    Directory(PathBuf),
}

pub struct FileReader {
    source: InputSource,
    extension: String,
    file_queue: Sender<PathBuf>,
    events: EventTracker,
    shutdown: Arc<AtomicBool>,
}

/// Control handle for a running [`FileReader`].
pub struct FileReaderHandle {
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl FileReaderHandle {
    /// Stop after the current file.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, |t| t.is_finished())
    }

    pub fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("file reader thread panicked");
            }
        }
    }
}

impl FileReader {
    pub fn new(
        source: InputSource,
        extension: &str,
        file_queue: Sender<PathBuf>,
        events: EventTracker,
    ) -> Self {
        Self {
            source,
            extension: extension.trim_start_matches('.').to_string(),
            file_queue,
            events,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn spawn(self) -> std::io::Result<FileReaderHandle> {
        let shutdown = Arc::clone(&self.shutdown);
        let thread = std::thread::Builder::new()
            .name("file-reader".into())
            .spawn(move || self.run())?;
        Ok(FileReaderHandle {
            shutdown,
            thread: Some(thread),
        })
    }

    /// Queue every input file, then signal completion.
    pub fn run(&self) {
        match self.scan() {
            Ok(queued) => info!(files = queued, "file reader finished"),
            Err(e) => error!(error = %e, "file reader failed"),
        }
        debug!("setting file reader done");
        self.events.set_file_reader_done();
    }

    fn stopping(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst) || self.events.shutdown()
    }

    fn scan(&self) -> Result<usize> {
        match &self.source {
            InputSource::File(path) => {
                if !path.is_file() {
                    anyhow::bail!("input file does not exist: {}", path.display());
                }
                Ok(usize::from(self.enqueue(path.clone())))
            }
            InputSource::Directory(root) => {
                if !root.is_dir() {
                    anyhow::bail!("input directory does not exist: {}", root.display());
                }
                let matcher = self.matcher()?;
                let mut queued = 0;
                for entry in WalkDir::new(root).sort_by_file_name() {
                    if self.stopping() {
                        debug!("file reader shutting down");
                        break;
                    }
                    let entry = match entry {
                        Ok(entry) => entry,
                        Err(e) => {
                            warn!(error = %e, "unable to read directory entry");
                            continue;
                        }
                    };
                    if !entry.file_type().is_file() {
                        continue;
                    }
                    if let Some(matcher) = &matcher {
                        if !matcher.is_match(entry.file_name()) {
                            continue;
                        }
                    }
                    if !self.enqueue(entry.into_path()) {
                        break;
                    }
                    queued += 1;
                }
                Ok(queued)
            }
        }
    }

    fn matcher(&self) -> Result<Option<GlobMatcher>> {
        if self.extension.is_empty() {
            return Ok(None);
        }
        Ok(Some(Glob::new(&format!("*.{}", self.extension))?.compile_matcher()))
    }

    /// Push a path, polling so shutdown is observed while the queue is full.
    fn enqueue(&self, mut path: PathBuf) -> bool {
        loop {
            if self.stopping() {
                return false;
            }
            match self.file_queue.send_timeout(path, QUEUE_POLL) {
                Ok(()) => return true,
                Err(SendTimeoutError::Timeout(p)) => path = p,
                Err(SendTimeoutError::Disconnected(_)) => return false,
            }
        }
    }
}
