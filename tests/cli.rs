use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use tempfile::TempDir;

const CONFIG: &str = r#"
[[targets]]
name = "rack-01"
remote_path = "/reports"

[targets.endpoint]
host = "127.0.0.1"
port = 1
"#;

fn racksync(tmp: &TempDir) -> Command {
    let config = tmp.path().join("racks.toml");
    if !config.exists() {
        std::fs::write(&config, CONFIG).unwrap();
    }
    let mut cmd = cargo_bin_cmd!("racksync");
    cmd.current_dir(tmp.path())
        .env_remove("RACKSYNC_MEDIA_ROOT")
        .env_remove("RACKSYNC_DB")
        .env_remove("RACKSYNC_REPORT_PATTERN")
        .env_remove("RACKSYNC_CONNECT_TIMEOUT_SECS")
        .env("RUST_LOG", "warn")
        .arg("--config")
        .arg(&config)
        .arg("--data-dir")
        .arg(tmp.path().join("data"));
    cmd
}

#[test]
fn completions_mention_binary_name() {
    cargo_bin_cmd!("racksync")
        .args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("racksync"));
}

#[test]
fn man_page_renders() {
    cargo_bin_cmd!("racksync")
        .arg("man")
        .assert()
        .success()
        .stdout(predicate::str::contains(".TH"));
}

#[test]
fn status_lists_configured_targets_as_json() {
    let tmp = TempDir::new().unwrap();
    let out = racksync(&tmp)
        .args(["status", "--json"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let rows: serde_json::Value = serde_json::from_slice(&out).unwrap();
    let rows = rows.as_array().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["name"], "rack-01");
    assert_eq!(rows[0]["host"], "127.0.0.1");
    assert_eq!(rows[0]["total"], 0);
    assert!(rows[0]["archive"].is_null());
}

#[test]
fn status_text_for_unsynced_target() {
    let tmp = TempDir::new().unwrap();
    racksync(&tmp)
        .env("NO_COLOR", "1")
        .args(["status", "rack-01"])
        .assert()
        .success()
        .stdout(predicate::str::contains("rack-01").and(predicate::str::contains("never synced")));
}

#[test]
fn unknown_target_is_an_error() {
    let tmp = TempDir::new().unwrap();
    racksync(&tmp)
        .args(["peek", "rack-99"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown target 'rack-99'"));
}

#[test]
fn invalid_config_is_rejected() {
    let tmp = TempDir::new().unwrap();
    std::fs::write(
        tmp.path().join("racks.toml"),
        "report_pattern = \"(\"\n",
    )
    .unwrap();
    racksync(&tmp)
        .arg("status")
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid report pattern"));
}

#[test]
fn failed_sync_exits_nonzero_and_records_status() {
    let tmp = TempDir::new().unwrap();
    // No credentials configured: the connect fails before dialing.
    let out = racksync(&tmp)
        .args(["sync", "--json"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to sync"))
        .get_output()
        .stdout
        .clone();
    let outcomes: serde_json::Value = serde_json::from_slice(&out).unwrap();
    assert_eq!(outcomes[0]["target_name"], "rack-01");
    assert_eq!(outcomes[0]["status"], "failed");

    let status = std::fs::read_to_string(tmp.path().join("data").join("sync_status.json")).unwrap();
    let status: serde_json::Value = serde_json::from_str(&status).unwrap();
    assert_eq!(status["targets"]["rack-01"]["last_result"], "failed");
}

#[test]
fn every_rejects_zero() {
    let tmp = TempDir::new().unwrap();
    racksync(&tmp)
        .args(["sync", "--every", "0"])
        .assert()
        .failure();
}

#[test]
fn piped_logs_are_plain_and_carry_build_info() {
    let tmp = TempDir::new().unwrap();
    racksync(&tmp)
        .env("RUST_LOG", "racksync=debug")
        .arg("status")
        .assert()
        .success()
        .stderr(
            predicate::str::contains("racksync starting")
                .and(predicate::str::contains("imported sync targets"))
                .and(predicate::str::contains("\u{1b}[").not())
                .and(predicate::str::contains("built=\"unknown\"").not())
                .and(predicate::str::contains("built=unknown").not()),
        );
}
