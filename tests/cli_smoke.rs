//! Behavioural smoke tests for the CLI entrypoint.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use tempfile::TempDir;

fn machina(home: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("machina");
    cmd.env("HOME", home.path())
        .env_remove("MACHINA_CONFIG_PATH")
        .env_remove("MACHINA_STORAGE_PATH")
        .env_remove("MACHINA_PLUGIN_MAGIC_COOKIE")
        .env("MACHINA_LOG", "error");
    cmd
}

fn home() -> TempDir {
    TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"))
}

#[test]
fn help_lists_the_subcommands() {
    let home = home();
    machina(&home)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("create").and(predicate::str::contains("regenerate-certs")));
}

#[test]
fn listing_an_empty_installation_prints_the_header() {
    let home = home();
    machina(&home)
        .arg("ls")
        .assert()
        .success()
        .stdout("NAME   DRIVER   STATE   URL   ERRORS\n");
}

#[test]
fn unknown_hosts_fail_with_exit_code_one() {
    let home = home();
    machina(&home)
        .args(["url", "ghost"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("host does not exist: ghost"));
}

#[test]
fn invalid_configuration_is_reported() {
    let home = home();
    machina(&home)
        .env("MACHINA_FANOUT_LIMIT", "0")
        .arg("ls")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("MACHINA_FANOUT_LIMIT"));
}
