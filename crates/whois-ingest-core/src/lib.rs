//! # whois-ingest core
//!
//! Engine-agnostic logic for whois-ingest: record models, CSV row
//! validation and normalization, the change-detection/versioning algorithm,
//! and the [`backend::SearchBackend`] abstraction with an in-memory
//! implementation.
//!
//! This crate performs no network or filesystem I/O. Threads, HTTP and
//! configuration live in the `whois-ingest` crate.

pub mod backend;
pub mod diff;
pub mod domain;
pub mod models;
