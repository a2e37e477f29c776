//! Index templates, one per search-engine major version.
//!
//! Templates live in `<template_dir>/es<major>.data.template` as plain JSON
//! with `settings`, `mappings` and an `aliases` object. The index pattern and
//! the shared search alias are filled in at install time.

use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::error::{IngestError, Result};

/// Oldest supported major version.
pub const MIN_MAJOR_VERSION: u64 = 7;

/// Highest major version across the cluster's nodes.
///
/// Every node must be at least [`MIN_MAJOR_VERSION`].
pub fn cluster_major_version(node_versions: &[String]) -> Result<u64> {
    let mut highest = None;
    for version in node_versions {
        let major: u64 = version
            .split('.')
            .next()
            .and_then(|m| m.trim().parse().ok())
            .ok_or_else(|| IngestError::Template(format!("unparseable node version '{}'", version)))?;
        if major < MIN_MAJOR_VERSION {
            return Err(IngestError::Template(format!(
                "Elasticsearch {}.0 is the minimum supported version, found {}",
                MIN_MAJOR_VERSION, version
            )));
        }
        highest = highest.max(Some(major));
    }
    highest.ok_or_else(|| IngestError::Template("cluster reported no nodes".into()))
}

pub fn template_path(dir: &Path, major: u64) -> PathBuf {
    dir.join(format!("es{}.data.template", major))
}

/// Read and parse the data template for `major`.
pub fn load_template(dir: &Path, major: u64) -> Result<Value> {
    let path = template_path(dir, major);
    if !path.exists() {
        return Err(IngestError::Template(format!(
            "Unable to find template at {}",
            path.display()
        )));
    }
    let content = std::fs::read_to_string(&path)?;
    let template: Value = serde_json::from_str(&content).map_err(|e| {
        IngestError::Template(format!("Unable to read template file {}: {}", path.display(), e))
    })?;
    if !template.is_object() {
        return Err(IngestError::Template(format!(
            "template {} is not a JSON object",
            path.display()
        )));
    }
    Ok(template)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn versions(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn picks_highest_major() {
        assert_eq!(cluster_major_version(&versions(&["7.17.1", "8.11.3"])).unwrap(), 8);
        assert_eq!(cluster_major_version(&versions(&["7.10.2"])).unwrap(), 7);
    }

    #[test]
    fn rejects_old_or_missing_versions() {
        assert!(cluster_major_version(&versions(&["6.8.0", "7.10.0"])).is_err());
        assert!(cluster_major_version(&[]).is_err());
        assert!(cluster_major_version(&versions(&["banana"])).is_err());
    }

    #[test]
    fn loads_template_from_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("es8.data.template"),
            r#"{"settings": {}, "mappings": {}, "aliases": {}}"#,
        )
        .unwrap();
        let template = load_template(dir.path(), 8).unwrap();
        assert!(template["aliases"].is_object());
        assert!(matches!(
            load_template(dir.path(), 7),
            Err(IngestError::Template(_))
        ));
    }

    #[test]
    fn shipped_templates_parse() {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("templates");
        for major in [7, 8] {
            let template = load_template(&dir, major).unwrap();
            assert!(template["mappings"].is_object());
            assert!(template["aliases"].is_object());
        }
    }
}
