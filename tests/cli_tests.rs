use assert_cmd::Command;
use std::fs;
use std::path::Path;
use tempfile::tempdir;

fn pipkin() -> Command {
    Command::cargo_bin("pipkin").unwrap()
}

/// Global flags pointing every path into the temp dir, so tests never see
/// the user's real base or config.
fn base_args(dir: &Path) -> Vec<String> {
    vec![
        "--base".to_string(),
        dir.display().to_string(),
        "--config".to_string(),
        dir.join("no-config.json").display().to_string(),
    ]
}

fn stdout_of(assert: assert_cmd::assert::Assert) -> String {
    String::from_utf8_lossy(&assert.get_output().stdout).to_string()
}

fn stderr_of(assert: assert_cmd::assert::Assert) -> String {
    String::from_utf8_lossy(&assert.get_output().stderr).to_string()
}

#[test]
fn test_list_empty_base() {
    let dir = tempdir().unwrap();
    let assert = pipkin().args(base_args(dir.path())).arg("list").assert().success();
    assert!(stdout_of(assert).contains("No packages installed"));
}

#[test]
fn test_dry_run_install_with_explicit_version() {
    let dir = tempdir().unwrap();
    let assert = pipkin()
        .args(base_args(dir.path()))
        .args(["--dry-run", "install", "mgit==1.3.0"])
        .assert()
        .success();

    let output = stdout_of(assert);
    assert!(output.contains("would create virtual environment"));
    assert!(output.contains("would deliver"));
    // nothing materialized
    assert!(!dir.path().join(".pipkin").join("mgit").join("1.3.0").exists());
}

#[test]
fn test_dry_run_install_bundle_from_config() {
    let dir = tempdir().unwrap();
    let config = dir.path().join("config.json");
    fs::write(
        &config,
        serde_json::json!({
            "bundle": {"dev": ["mgit"]},
            "pinned": {"mgit": "1.3.0"},
        })
        .to_string(),
    )
    .unwrap();

    let assert = pipkin()
        .args(["--base", &dir.path().display().to_string()])
        .args(["--config", &config.display().to_string()])
        .args(["--dry-run", "install", "bundle:dev"])
        .assert()
        .success();

    let output = stdout_of(assert);
    assert!(output.contains("mgit"));
    assert!(output.contains("would"));
}

#[test]
fn test_unknown_bundle_aborts() {
    let dir = tempdir().unwrap();
    let assert = pipkin()
        .args(base_args(dir.path()))
        .args(["install", "bundle:nope"])
        .assert()
        .failure();
    assert!(stderr_of(assert).contains("bundle 'nope' is not configured"));
}

#[test]
fn test_malformed_name_aborts_with_one_liner() {
    let dir = tempdir().unwrap();
    let assert = pipkin()
        .args(base_args(dir.path()))
        .args(["install", "0-0"])
        .assert()
        .failure();
    let err = stderr_of(assert);
    assert!(err.contains("not a valid package name"));
    // one clean line, no stack trace
    assert!(!err.contains("panicked"));
}

#[test]
fn test_upgrade_of_missing_package_aborts() {
    let dir = tempdir().unwrap();
    let assert = pipkin()
        .args(base_args(dir.path()))
        .args(["upgrade", "mgit"])
        .assert()
        .failure();
    assert!(stderr_of(assert).contains("not installed"));
}

#[test]
fn test_uninstall_of_missing_package_aborts() {
    let dir = tempdir().unwrap();
    let assert = pipkin()
        .args(base_args(dir.path()))
        .args(["uninstall", "mgit"])
        .assert()
        .failure();
    assert!(stderr_of(assert).contains("not installed"));
}

#[test]
fn test_check_empty_base() {
    let dir = tempdir().unwrap();
    let assert = pipkin().args(base_args(dir.path())).arg("check").assert().success();
    assert!(stdout_of(assert).contains("No packages installed"));
}

#[test]
fn test_check_and_list_with_pinned_package_installed() {
    let dir = tempdir().unwrap();
    let config = dir.path().join("config.json");
    fs::write(&config, serde_json::json!({"pinned": {"mgit": "1.3.0"}}).to_string()).unwrap();
    let meta = dir.path().join(".pipkin").join("mgit");
    fs::create_dir_all(&meta).unwrap();
    fs::write(
        meta.join(".manifest.json"),
        serde_json::json!({
            "settings": {"delivery": "symlink", "index": "https://pypi.org/pypi", "python": "python3"},
            "entrypoints": {"mgit": "bin/mgit"},
            "version": "1.3.0",
        })
        .to_string(),
    )
    .unwrap();

    let assert = pipkin()
        .args(["--base", &dir.path().display().to_string()])
        .args(["--config", &config.display().to_string()])
        .arg("check")
        .assert()
        .success();
    assert!(stdout_of(assert).contains("mgit v1.3.0 (pinned): up-to-date"));

    let assert = pipkin()
        .args(["--base", &dir.path().display().to_string()])
        .args(["--config", &config.display().to_string()])
        .arg("list")
        .assert()
        .success();
    assert!(stdout_of(assert).contains("mgit v1.3.0 (symlink)"));
}
