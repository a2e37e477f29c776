//! DataFetcher: turns rows into entries and looks up their LiveRecords.

use std::sync::Arc;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, warn};

use whois_ingest_core::domain::{build_entry, generate_doc_id};
use whois_ingest_core::backend::MultiGetResult;
use whois_ingest_core::models::{DocRef, DomainRecord, FetchedRecord, WorkItem};

use super::{push, ProcessOptions, Row, StageControl, POLL};
use crate::events::EventTracker;
use crate::ingest_handler::IngestHandler;
use crate::stats::{Stat, StatHandle};

pub struct DataFetcher {
    pipeline: usize,
    data_queue: Receiver<Row>,
    work_queue: Sender<WorkItem>,
    handler: IngestHandler,
    events: EventTracker,
    stats: StatHandle,
    control: Arc<StageControl>,
    options: Arc<ProcessOptions>,
    /// Live indices to search, newest first. Empty skips the lookup.
    index_list: Arc<Vec<String>>,
}

impl DataFetcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pipeline: usize,
        data_queue: Receiver<Row>,
        work_queue: Sender<WorkItem>,
        handler: IngestHandler,
        events: EventTracker,
        stats: StatHandle,
        control: Arc<StageControl>,
        options: Arc<ProcessOptions>,
        index_list: Arc<Vec<String>>,
    ) -> Self {
        Self {
            pipeline,
            data_queue,
            work_queue,
            handler,
            events,
            stats,
            control,
            options,
            index_list,
        }
    }

    pub fn run(mut self) {
        let stamp = self.options.stamp();
        let batch_size = self.options.bulk_fetch_size.max(1);
        let mut batch: Vec<DomainRecord> = Vec::with_capacity(batch_size);

        loop {
            if self.control.is_shutdown() {
                break;
            }
            match self.data_queue.recv_timeout(POLL) {
                Ok(row) => {
                    let entry = match build_entry(
                        &row.header,
                        &row.fields,
                        &self.options.ignore_field_prefixes,
                        &stamp,
                    ) {
                        Ok(entry) => entry,
                        Err(e) => {
                            warn!(pipeline = self.pipeline, error = %e, "unable to build entry");
                            continue;
                        }
                    };

                    if self.index_list.is_empty() {
                        let item = WorkItem {
                            entry,
                            existing: None,
                        };
                        if !push(&self.work_queue, item, &self.control) {
                            break;
                        }
                        continue;
                    }

                    batch.push(entry);
                    if batch.len() >= batch_size && !self.fetch(&mut batch) {
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    if self.control.is_finishing() {
                        if !batch.is_empty() {
                            self.fetch(&mut batch);
                        }
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    if !batch.is_empty() {
                        self.fetch(&mut batch);
                    }
                    break;
                }
            }
        }
        self.stats.flush();
        debug!(pipeline = self.pipeline, "fetcher exiting");
    }

    /// Look up every entry in `batch` and forward the pairs. A failed lookup
    /// counts the batch as failed and raises the fetch error; the thread keeps
    /// going. Returns false when the work queue is gone.
    fn fetch(&mut self, batch: &mut Vec<DomainRecord>) -> bool {
        let entries = std::mem::take(batch);
        let stride = self.index_list.len().max(1);

        let mut docs = Vec::with_capacity(entries.len() * stride);
        let mut lookups = Vec::with_capacity(entries.len());
        for entry in entries {
            let id = match generate_doc_id(&entry.domain_name) {
                Ok(id) => id,
                Err(e) => {
                    warn!(pipeline = self.pipeline, error = %e, "unable to derive document id");
                    continue;
                }
            };
            for index in self.index_list.iter() {
                docs.push(DocRef {
                    index: index.clone(),
                    id: id.clone(),
                });
            }
            lookups.push(entry);
        }
        if lookups.is_empty() {
            return true;
        }

        let results = match self.handler.fetch_documents(&docs) {
            Ok(results) => results,
            Err(e) => {
                error!(pipeline = self.pipeline, error = %e, "bulk fetch failed");
                self.events.set_fetch_error();
                for _ in 0..lookups.len() {
                    self.stats.incr(Stat::Failed);
                }
                return true;
            }
        };

        if results.len() != lookups.len() * stride {
            warn!(
                pipeline = self.pipeline,
                expected = lookups.len() * stride,
                received = results.len(),
                "multi-get returned an unexpected number of documents"
            );
        }
        let (groups, missing) = slot_groups(&results, lookups.len(), stride);
        for _ in 0..missing {
            self.stats.incr(Stat::Failed);
        }

        for (entry, slots) in lookups.into_iter().zip(groups) {
            let found = slots
                .iter()
                .find_map(|slot| slot.source.as_ref().map(|source| (slot, source)));
            let existing = match found {
                None => None,
                Some((slot, source)) => match serde_json::from_value(source.clone()) {
                    Ok(record) => Some(FetchedRecord {
                        index: slot.index.clone(),
                        id: slot.id.clone(),
                        source: record,
                    }),
                    Err(e) => {
                        warn!(
                            pipeline = self.pipeline,
                            index = %slot.index,
                            id = %slot.id,
                            error = %e,
                            "stored record could not be decoded"
                        );
                        self.stats.incr(Stat::Failed);
                        continue;
                    }
                },
            };
            if !push(&self.work_queue, WorkItem { entry, existing }, &self.control) {
                return false;
            }
        }
        true
    }
}

/// One group of `stride` results per lookup, plus the number of lookups the
/// response has no complete group for.
fn slot_groups(
    results: &[MultiGetResult],
    lookups: usize,
    stride: usize,
) -> (std::slice::ChunksExact<'_, MultiGetResult>, usize) {
    let complete = (results.len() / stride).min(lookups);
    (results.chunks_exact(stride), lookups - complete)
}
