//! # whois-ingest
//!
//! Versioned, diffable bulk ingestion of WHOIS CSV exports into an
//! Elasticsearch cluster.
//!
//! Every import run is a numbered version. Each domain has one live record
//! holding its current details; when a later version changes those details
//! the prior record is archived as an immutable delta record and the live
//! record is rewritten. Unchanged domains only have their version and
//! last-seen date bumped.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌──────────────────────────────────────────┐   ┌───────────────┐
//! │ FileReader │──▶│ DataProcessorPool                        │──▶│ Elasticsearch │
//! │ (dir walk) │   │  reader ▶ fetchers ▶ worker ▶ shippers   │   │ live + delta  │
//! └────────────┘   │  (one pipeline per processor)            │   │ indices       │
//!                  └──────────────────────────────────────────┘   └───────────────┘
//!                         ▲ pause / resume for rollover
//!                  ┌──────┴───────┐
//!                  │ DataPopulator│  version bookkeeping, supervision
//!                  └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! whois-ingest ingest -d ./data/2024-01 -D 2024-01-01   # first import bootstraps the cluster
//! whois-ingest ingest -d ./data/2024-02 -D 2024-02-01   # next version
//! whois-ingest stats                                    # totals of the last version
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`elastic`] | HTTP search backend |
//! | [`ingest_handler`] | Index naming, metadata, rollover, bulk I/O |
//! | [`file_reader`] | Input discovery |
//! | [`pipeline`] | Reader, fetcher, worker and shipper stages; processors and pool |
//! | [`ingest`] | Import orchestration |
//! | [`stats`] | Run counters |
//! | [`events`] | Shared shutdown and error signals |
//! | [`template`] | Index templates |
//! | [`progress`] | Progress reporting |
//! | [`error`] | Error types |

pub mod config;
pub mod elastic;
pub mod error;
pub mod events;
pub mod file_reader;
pub mod ingest;
pub mod ingest_handler;
pub mod pipeline;
pub mod progress;
pub mod stats;
pub mod template;
