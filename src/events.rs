//! Process-wide signals shared by every pipeline stage.
//!
//! Each flag is set once and observed everywhere. Clones share state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct EventTracker {
    shutdown: Arc<AtomicBool>,
    fetch_error: Arc<AtomicBool>,
    ship_error: Arc<AtomicBool>,
    file_reader_done: Arc<AtomicBool>,
}

impl EventTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn set_fetch_error(&self) {
        self.fetch_error.store(true, Ordering::SeqCst);
    }

    pub fn fetch_error(&self) -> bool {
        self.fetch_error.load(Ordering::SeqCst)
    }

    pub fn set_ship_error(&self) {
        self.ship_error.store(true, Ordering::SeqCst);
    }

    pub fn ship_error(&self) -> bool {
        self.ship_error.load(Ordering::SeqCst)
    }

    /// Any fatal bulk failure.
    pub fn bulk_error(&self) -> bool {
        self.fetch_error() || self.ship_error()
    }

    pub fn set_file_reader_done(&self) {
        self.file_reader_done.store(true, Ordering::SeqCst);
    }

    pub fn file_reader_done(&self) -> bool {
        self.file_reader_done.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_are_shared_between_clones() {
        let events = EventTracker::new();
        let other = events.clone();
        assert!(!other.bulk_error());

        events.set_ship_error();
        assert!(other.ship_error());
        assert!(other.bulk_error());
        assert!(!other.fetch_error());

        std::thread::spawn(move || other.set_file_reader_done())
            .join()
            .unwrap();
        assert!(events.file_reader_done());
        assert!(!events.shutdown());
    }
}
