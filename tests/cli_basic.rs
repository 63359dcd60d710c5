//! Integration tests for basic CLI behavior.
//!
//! Tests that the binary exists, accepts standard flags, and rejects bad
//! input before touching the network or spawning a decoder.

#![allow(deprecated)] // cargo_bin deprecation, replacement not yet stable

use assert_cmd::Command;
use predicates::prelude::*;

/// Helper: get a Command for the `livegrab` binary, isolated from any user config.
fn livegrab() -> Command {
    let mut cmd = Command::cargo_bin("livegrab").expect("binary 'livegrab' should be built");
    cmd.args(["--config", "/nonexistent/livegrab/config.toml"]);
    cmd
}

// ─── Top-level flags ─────────────────────────────────────────────────────────

#[test]
fn help_flag_shows_usage() {
    livegrab()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Usage: livegrab"))
        .stdout(predicate::str::contains("play"))
        .stdout(predicate::str::contains("info"));
}

#[test]
fn version_flag_shows_semver() {
    Command::cargo_bin("livegrab")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::is_match(r"^livegrab \d+\.\d+\.\d+\n$").unwrap());
}

#[test]
fn no_args_shows_error_and_usage() {
    Command::cargo_bin("livegrab")
        .unwrap()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage: livegrab"));
}

#[test]
fn invalid_subcommand_fails() {
    livegrab()
        .arg("record")
        .assert()
        .failure()
        .stderr(predicate::str::contains("unrecognized subcommand"));
}

// ─── Subcommand help ─────────────────────────────────────────────────────────

#[test]
fn play_help() {
    livegrab()
        .args(["play", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Play a stream"))
        .stdout(predicate::str::contains("<URL>"))
        .stdout(predicate::str::contains("--no-preview"))
        .stdout(predicate::str::contains("--force-cpu"))
        .stdout(predicate::str::contains("--max-stalls"));
}

#[test]
fn info_help() {
    livegrab()
        .args(["info", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Show renditions"))
        .stdout(predicate::str::contains("<URL>"));
}

// ─── Argument validation ─────────────────────────────────────────────────────

#[test]
fn play_requires_url() {
    livegrab()
        .arg("play")
        .assert()
        .failure()
        .stderr(predicate::str::contains("<URL>"));
}

#[test]
fn width_without_height_fails() {
    livegrab()
        .args(["play", "https://example.com/live.m3u8", "--width", "640"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--height"));
}

#[test]
fn empty_url_is_invalid_input() {
    livegrab()
        .args(["play", "", "--no-preview", "--force-cpu"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid input"));
}

#[test]
fn unsupported_scheme_is_invalid_input() {
    livegrab()
        .args(["info", "ftp://example.com/live.m3u8", "--force-cpu"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unsupported scheme"));
}

#[test]
fn malformed_config_fails() {
    let path = std::env::temp_dir().join(format!("livegrab-bad-{}.toml", std::process::id()));
    std::fs::write(&path, "[source]\nmax_consecutive_stalls = \"many\"\n").unwrap();

    Command::cargo_bin("livegrab")
        .unwrap()
        .args(["--config", path.to_str().unwrap(), "info", "https://example.com/x.m3u8"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid TOML"));

    let _ = std::fs::remove_file(path);
}
