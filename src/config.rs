use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub elastic: ElasticConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ElasticConfig {
    pub hosts: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub ca_cert: Option<PathBuf>,
    #[serde(default = "default_index_prefix")]
    pub index_prefix: String,
    #[serde(default = "default_rollover_size")]
    pub rollover_size: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_index_prefix() -> String {
    "whois".to_string()
}
fn default_rollover_size() -> u64 {
    50_000_000
}
fn default_timeout_secs() -> u64 {
    100
}
fn default_max_retries() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_pipelines")]
    pub pipelines: usize,
    #[serde(default = "default_fetcher_threads")]
    pub fetcher_threads: usize,
    #[serde(default = "default_shipper_threads")]
    pub shipper_threads: usize,
    #[serde(default = "default_bulk_fetch_size")]
    pub bulk_fetch_size: usize,
    #[serde(default = "default_bulk_ship_size")]
    pub bulk_ship_size: usize,
    #[serde(default = "default_extension")]
    pub extension: String,
    #[serde(default = "default_ignore_field_prefixes")]
    pub ignore_field_prefixes: Vec<String>,
    #[serde(default = "default_template_dir")]
    pub template_dir: PathBuf,
    #[serde(default = "default_rollover_check_secs")]
    pub rollover_check_secs: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            pipelines: default_pipelines(),
            fetcher_threads: default_fetcher_threads(),
            shipper_threads: default_shipper_threads(),
            bulk_fetch_size: default_bulk_fetch_size(),
            bulk_ship_size: default_bulk_ship_size(),
            extension: default_extension(),
            ignore_field_prefixes: default_ignore_field_prefixes(),
            template_dir: default_template_dir(),
            rollover_check_secs: default_rollover_check_secs(),
        }
    }
}

fn default_pipelines() -> usize {
    2
}
fn default_fetcher_threads() -> usize {
    2
}
fn default_shipper_threads() -> usize {
    1
}
fn default_bulk_fetch_size() -> usize {
    50
}
fn default_bulk_ship_size() -> usize {
    1000
}
fn default_extension() -> String {
    "csv".to_string()
}
fn default_ignore_field_prefixes() -> Vec<String> {
    vec![
        "zoneContact".to_string(),
        "billingContact".to_string(),
        "technicalContact".to_string(),
    ]
}
fn default_template_dir() -> PathBuf {
    PathBuf::from("./templates")
}
fn default_rollover_check_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::Text,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    // Validate elastic
    if config.elastic.hosts.is_empty() {
        anyhow::bail!("elastic.hosts must list at least one host");
    }
    if config.elastic.username.is_some() && config.elastic.password.is_none() {
        anyhow::bail!("elastic.password is required when elastic.username is set");
    }
    if config.elastic.rollover_size == 0 {
        anyhow::bail!("elastic.rollover_size must be > 0");
    }
    if config.elastic.timeout_secs == 0 {
        anyhow::bail!("elastic.timeout_secs must be > 0");
    }
    if config.elastic.index_prefix.is_empty() {
        anyhow::bail!("elastic.index_prefix must not be empty");
    }

    // Validate ingest
    let sizes = [
        ("ingest.pipelines", config.ingest.pipelines),
        ("ingest.fetcher_threads", config.ingest.fetcher_threads),
        ("ingest.shipper_threads", config.ingest.shipper_threads),
        ("ingest.bulk_fetch_size", config.ingest.bulk_fetch_size),
        ("ingest.bulk_ship_size", config.ingest.bulk_ship_size),
    ];
    for (name, value) in sizes {
        if value == 0 {
            anyhow::bail!("{} must be > 0", name);
        }
    }
    if config.ingest.rollover_check_secs == 0 {
        anyhow::bail!("ingest.rollover_check_secs must be > 0");
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_gets_defaults() {
        let config = parse_config("[elastic]\nhosts = [\"http://localhost:9200\"]\n").unwrap();
        assert_eq!(config.elastic.index_prefix, "whois");
        assert_eq!(config.elastic.rollover_size, 50_000_000);
        assert_eq!(config.ingest.pipelines, 2);
        assert_eq!(config.ingest.bulk_ship_size, 1000);
        assert_eq!(config.ingest.ignore_field_prefixes.len(), 3);
        assert_eq!(config.logging.format, LogFormat::Text);
    }

    #[test]
    fn full_config_parses() {
        let config = parse_config(
            r#"
[elastic]
hosts = ["https://es1:9200", "https://es2:9200"]
username = "elastic"
password = "changeme"
ca_cert = "/etc/ssl/ca.pem"
index_prefix = "pdns"
rollover_size = 1000

[ingest]
pipelines = 4
bulk_fetch_size = 25
ignore_field_prefixes = []

[logging]
level = "debug"
format = "json"
"#,
        )
        .unwrap();
        assert_eq!(config.elastic.hosts.len(), 2);
        assert_eq!(config.elastic.ca_cert, Some(PathBuf::from("/etc/ssl/ca.pem")));
        assert_eq!(config.ingest.pipelines, 4);
        assert_eq!(config.ingest.fetcher_threads, 2);
        assert!(config.ingest.ignore_field_prefixes.is_empty());
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(parse_config("[elastic]\nhosts = []\n").is_err());
        assert!(parse_config("[elastic]\nhosts = [\"h\"]\nusername = \"u\"\n").is_err());
        assert!(parse_config("[elastic]\nhosts = [\"h\"]\n[ingest]\npipelines = 0\n").is_err());
        assert!(parse_config("[ingest]\npipelines = 1\n").is_err());
    }
}
