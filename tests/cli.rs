use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn whois_ingest_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("whois-ingest");
    path
}

/// A config pointing at a port nothing listens on.
fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    let data_dir = root.join("data");
    fs::create_dir_all(&data_dir).unwrap();
    fs::write(
        data_dir.join("2024-01.csv"),
        "domainName,registrant_name\nexample.com,Alice\n",
    )
    .unwrap();

    let config_content = format!(
        r#"[elastic]
hosts = ["http://127.0.0.1:1"]
timeout_secs = 2
max_retries = 0

[ingest]
pipelines = 1
template_dir = "{}/templates"

[logging]
level = "error"
"#,
        root.display()
    );
    let config_path = config_dir.join("whois-ingest.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_whois_ingest(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = whois_ingest_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run whois-ingest binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn test_help_lists_commands() {
    let (_tmp, config) = setup_test_env();
    let (stdout, _, success) = run_whois_ingest(&config, &["--help"]);
    assert!(success);
    for command in ["ingest", "reingest", "config-template", "clear-interrupted", "stats"] {
        assert!(stdout.contains(command), "missing {} in help", command);
    }
}

#[test]
fn test_missing_config_fails() {
    let (stdout, stderr, success) =
        run_whois_ingest(Path::new("/no/such/whois-ingest.toml"), &["stats"]);
    assert!(!success);
    assert!(stdout.is_empty());
    assert!(stderr.contains("Failed to read config file"));
}

#[test]
fn test_invalid_config_fails() {
    let tmp = TempDir::new().unwrap();
    let config = tmp.path().join("bad.toml");
    fs::write(&config, "[elastic]\nhosts = []\n").unwrap();
    let (_, stderr, success) = run_whois_ingest(&config, &["stats"]);
    assert!(!success);
    assert!(stderr.contains("elastic.hosts"));
}

#[test]
fn test_ingest_requires_source() {
    let (_tmp, config) = setup_test_env();
    let (_, stderr, success) = run_whois_ingest(&config, &["ingest"]);
    assert!(!success);
    assert!(stderr.contains("--file") || stderr.contains("--directory"));
}

#[test]
fn test_ingest_rejects_bad_day() {
    let (_tmp, config) = setup_test_env();
    let (_, stderr, success) =
        run_whois_ingest(&config, &["ingest", "-d", "/tmp", "-D", "2024-13-40"]);
    assert!(!success);
    assert!(stderr.contains("invalid ingest day"));
}

#[test]
fn test_unreachable_cluster_fails_cleanly() {
    let (_tmp, config) = setup_test_env();
    let (stdout, stderr, success) = run_whois_ingest(&config, &["stats"]);
    assert!(!success);
    assert!(stdout.is_empty());
    assert!(stderr.contains("Error"));
}
