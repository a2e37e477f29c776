//! Domain-name handling and CSV row normalization.
//!
//! A raw CSV row passes through [`RowValidator::validate`] in the reader and
//! [`build_entry`] in the fetcher before it reaches the diff stage. The
//! deterministic document id for a domain comes from [`generate_doc_id`].

use regex::Regex;
use sha1::{Digest, Sha1};
use thiserror::Error;

use crate::models::{keys, Details, DomainRecord};

/// Longest accepted domain name, and the point past which ids are hashed.
pub const MAX_DOMAIN_LEN: usize = 255;

const LABEL_PATTERN: &str = r"^[A-Za-z0-9_-]{0,63}$";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("unable to parse domain '{0}'")]
    Unparseable(String),
}

/// Why a CSV row was rejected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RowError {
    #[error("row has {found} fields but header has {expected}")]
    LengthMismatch { expected: usize, found: usize },
    #[error("zero length domain name")]
    EmptyDomain,
    #[error("unable to parse domainName: {0}")]
    NoTld(String),
    #[error("long domainName: {0}")]
    TooLong(String),
    #[error("domain name label(s) do not match valid pattern: {0}")]
    BadLabel(String),
}

/// Split a domain into everything before the last dot and the tld.
pub fn parse_domain(domain_name: &str) -> Result<(&str, &str), DomainError> {
    domain_name
        .rsplit_once('.')
        .ok_or_else(|| DomainError::Unparseable(domain_name.to_string()))
}

/// Deterministic document id for a domain: `<tld>.<name>`, or
/// `<tld>.h.<sha1(name)>` when the name is unreasonably long.
pub fn generate_doc_id(domain_name: &str) -> Result<String, DomainError> {
    let (name, tld) = parse_domain(domain_name)?;
    if name.len() > MAX_DOMAIN_LEN {
        let digest = Sha1::digest(name.as_bytes());
        let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
        return Ok(format!("{}.h.{}", tld, hex));
    }
    Ok(format!("{}.{}", tld, name))
}

/// Row-level checks run by the reader before a row is queued.
pub struct RowValidator {
    label: Regex,
}

impl RowValidator {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            label: Regex::new(LABEL_PATTERN)?,
        })
    }

    /// Validate `row` against `header`; `domain_idx` is the position of the
    /// `domainName` column.
    pub fn validate(
        &self,
        header: &[String],
        row: &[String],
        domain_idx: usize,
    ) -> Result<(), RowError> {
        if header.len() != row.len() {
            return Err(RowError::LengthMismatch {
                expected: header.len(),
                found: row.len(),
            });
        }

        let domain = row.get(domain_idx).map(String::as_str).unwrap_or("");
        if domain.is_empty() {
            return Err(RowError::EmptyDomain);
        }

        let Some((labels, _tld)) = domain.rsplit_once('.') else {
            return Err(RowError::NoTld(domain.to_string()));
        };

        if domain.len() > MAX_DOMAIN_LEN {
            return Err(RowError::TooLong(domain.to_string()));
        }

        if labels.split('.').any(|label| !self.label.is_match(label)) {
            return Err(RowError::BadLabel(domain.to_string()));
        }

        Ok(())
    }
}

/// Version and timestamps stamped onto every entry of one import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stamp {
    pub version: u64,
    /// Date the data represents (`YYYY-MM-DD`).
    pub ingest_day: String,
    /// Wall-clock time of this run.
    pub ingest_now: String,
}

/// Normalize a validated row into a fresh LiveRecord body.
///
/// Columns starting with any of `ignore_prefixes` are dropped, `domainName`
/// is lifted out of `details`, empty cells become `None`, and HTML entities
/// in values are decoded.
pub fn build_entry(
    header: &[String],
    row: &[String],
    ignore_prefixes: &[String],
    stamp: &Stamp,
) -> Result<DomainRecord, DomainError> {
    let mut details = Details::new();
    let mut domain_name = String::new();

    for (column, value) in header.iter().zip(row.iter()) {
        if ignore_prefixes.iter().any(|p| column.starts_with(p.as_str())) {
            continue;
        }
        if column == keys::DOMAIN_NAME {
            domain_name = value.clone();
            continue;
        }
        let value = if value.is_empty() {
            None
        } else {
            Some(unescape_html(value))
        };
        details.insert(column.clone(), value);
    }

    let tld = parse_domain(&domain_name)?.1.to_string();

    Ok(DomainRecord {
        domain_name,
        tld,
        details,
        data_version: stamp.version,
        data_first_seen: stamp.version,
        date_first_seen: stamp.ingest_day.clone(),
        date_last_seen: stamp.ingest_day.clone(),
        date_created: stamp.ingest_now.clone(),
        date_updated: stamp.ingest_now.clone(),
        historical: false,
    })
}

/// Decode HTML5 named and numeric character references. Malformed
/// references are left as they are.
fn unescape_html(value: &str) -> String {
    html_escape::decode_html_entities(value).into_owned()
}
