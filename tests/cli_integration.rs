//! CLI Integration Tests
//!
//! Tests the command-line interface end-to-end.

use assert_cmd::Command;
use assert_fs::prelude::*;
use predicates::prelude::*;

/// Get the binary to test, isolated from user configuration.
fn pluginhost(temp: &assert_fs::TempDir) -> Command {
    let mut cmd = Command::cargo_bin("pluginhost").unwrap();
    cmd.current_dir(temp.path())
        .env("XDG_CONFIG_HOME", temp.path().join("xdg"))
        .env_remove("PLUGINHOST_DIR")
        .env_remove("PLUGINHOST_INTERVAL")
        .env_remove("PLUGINHOST_TIMEOUT")
        .env_remove("PLUGINHOST_GRACE_MS")
        .env_remove("RUST_LOG");
    cmd
}

/// A temp dir with a `plugins/` directory holding the given files.
fn plugin_dir(files: &[&str]) -> assert_fs::TempDir {
    let temp = assert_fs::TempDir::new().unwrap();
    temp.child("plugins").create_dir_all().unwrap();
    for file in files {
        temp.child("plugins").child(file).write_str("not a library").unwrap();
    }
    temp
}

// ============================================================================
// Help & Version Tests
// ============================================================================

#[test]
fn test_help_flag() {
    let temp = plugin_dir(&[]);
    pluginhost(&temp)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Dynamic plugin lifecycle manager"));
}

#[test]
fn test_version_flag() {
    let temp = plugin_dir(&[]);
    pluginhost(&temp)
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn test_invalid_subcommand() {
    let temp = plugin_dir(&[]);
    pluginhost(&temp).arg("invalid-command-xyz").assert().failure();
}

// ============================================================================
// Scan Command Tests
// ============================================================================

#[test]
fn test_scan_lists_only_matching_archives() {
    let temp = plugin_dir(&["alpha.so", "beta.so", "readme.txt"]);
    temp.child("plugins").child("nested.so").create_dir_all().unwrap();

    pluginhost(&temp)
        .args(["scan", "--extension", "so"])
        .assert()
        .success()
        .stdout(predicate::str::contains("alpha.so"))
        .stdout(predicate::str::contains("beta.so"))
        .stdout(predicate::str::contains("readme.txt").not())
        .stdout(predicate::str::contains("Total: 2 archives"));
}

#[test]
fn test_scan_json_output() {
    let temp = plugin_dir(&["alpha.so"]);

    pluginhost(&temp)
        .args(["scan", "--extension", "so", "--format", "json"])
        .assert()
        .success()
        .stdout(predicate::str::starts_with("["))
        .stdout(predicate::str::contains("alpha.so"));
}

#[test]
fn test_scan_missing_directory_fails() {
    let temp = assert_fs::TempDir::new().unwrap();

    pluginhost(&temp)
        .args(["scan", "--dir", "does-not-exist"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not a directory"));
}

#[test]
fn test_dir_from_environment() {
    let temp = plugin_dir(&[]);
    temp.child("elsewhere").create_dir_all().unwrap();
    temp.child("elsewhere").child("gamma.so").write_str("x").unwrap();

    pluginhost(&temp)
        .env("PLUGINHOST_DIR", temp.path().join("elsewhere"))
        .args(["scan", "--extension", "so"])
        .assert()
        .success()
        .stdout(predicate::str::contains("gamma.so"));
}

// ============================================================================
// List Command Tests
// ============================================================================

#[test]
fn test_list_skips_corrupt_archive() {
    let temp = plugin_dir(&["broken.so"]);

    pluginhost(&temp)
        .args(["list", "--extension", "so"])
        .assert()
        .success()
        .stderr(predicate::str::contains("broken.so"))
        .stdout(predicate::str::contains("Total: 0 plugins"));
}

#[test]
fn test_list_json_output() {
    let temp = plugin_dir(&[]);

    pluginhost(&temp)
        .args(["list", "--format", "json"])
        .assert()
        .success()
        .stdout(predicate::str::starts_with("[]"));
}

// ============================================================================
// Run Command Tests
// ============================================================================

#[test]
fn test_run_reads_commands_until_exit() {
    let temp = plugin_dir(&[]);

    pluginhost(&temp)
        .arg("run")
        .write_stdin("help\nstart\nlist\nexit\n")
        .assert()
        .success()
        .stdout(predicate::str::contains("Commands:"))
        .stdout(predicate::str::contains("start: 0 succeeded"))
        .stdout(predicate::str::contains("Bye"));
}

#[test]
fn test_run_reports_unknown_commands() {
    let temp = plugin_dir(&[]);

    pluginhost(&temp)
        .write_stdin("frobnicate\n")
        .assert()
        .success()
        .stderr(predicate::str::contains("Unknown command 'frobnicate'"));
}

#[test]
fn test_run_exits_on_end_of_input() {
    let temp = plugin_dir(&[]);
    pluginhost(&temp).arg("run").write_stdin("").assert().success();
}

// ============================================================================
// Config Tests
// ============================================================================

#[test]
fn test_config_display() {
    let temp = plugin_dir(&[]);

    pluginhost(&temp)
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("[plugins]"))
        .stdout(predicate::str::contains("unload_grace_ms = 3000"));
}

#[test]
fn test_local_config_file_is_used() {
    let temp = plugin_dir(&[]);
    temp.child(".pluginhost.toml").write_str("[plugins]\nrescan_interval_secs = 7\n").unwrap();

    pluginhost(&temp)
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("rescan_interval_secs = 7"));
}

#[test]
fn test_explicit_config_file() {
    let temp = plugin_dir(&[]);
    temp.child("custom.toml").write_str("[plugins]\ncall_timeout_ms = 1234\n").unwrap();

    pluginhost(&temp)
        .args(["--config", "custom.toml", "config"])
        .assert()
        .success()
        .stdout(predicate::str::contains("call_timeout_ms = 1234"));
}

#[test]
fn test_zero_timeout_is_rejected() {
    let temp = plugin_dir(&[]);

    pluginhost(&temp)
        .args(["scan", "--timeout", "0"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("call timeout must be positive"));
}
