//! Unit tests for host records and lifecycle verbs.

use std::time::Duration;

use rstest::rstest;
use serde_json::json;
use tempfile::TempDir;

use super::*;
use crate::cert::CertPaths;
use crate::files;
use crate::options::REMOTE_UNIT_PATH;
use crate::test_support::{FakeBehaviour, FakeDriver, ScriptedSsh};

const UBUNTU: &str = "ID=ubuntu\nVERSION_ID=\"22.04\"\n";

fn fake_host(name: &str, behaviour: &FakeBehaviour) -> Host {
    Host::new(
        name,
        FakeDriver::NAME,
        Box::new(FakeDriver::new(name, behaviour.clone())),
        AuthOptions::default(),
        EngineOptions::default(),
    )
    .unwrap_or_else(|err| panic!("host: {err}"))
    .with_state_wait(RetryPolicy::fixed(3, Duration::ZERO))
}

fn zero_policies() -> Policies {
    let quick = RetryPolicy::fixed(3, Duration::ZERO);
    Policies {
        ssh: quick,
        runtime: quick,
        package_lock: quick,
    }
}

#[rstest]
#[case("m1", true)]
#[case("web.prod-01_a", true)]
#[case("-leading", false)]
#[case("has space", false)]
#[case("", false)]
#[case("slash/name", false)]
fn host_names_follow_the_allowed_pattern(#[case] name: &str, #[case] expected: bool) {
    assert_eq!(valid_name(name), expected);
}

#[test]
fn invalid_names_are_rejected_on_construction() {
    let Err(err) = Host::new(
        "bad name",
        FakeDriver::NAME,
        Box::new(FakeDriver::default()),
        AuthOptions::default(),
        EngineOptions::default(),
    ) else {
        panic!("a name with a space should be refused");
    };
    assert_eq!(err.kind(), ErrorKind::ConfigInvalid);
}

#[test]
fn unversioned_records_gain_remote_paths_and_engine_defaults() {
    let bytes = json!({
        "name": "old",
        "driver_name": "generic",
        "driver": {"ip_address": "10.0.0.1"},
        "engine_options": {"tls_port": 0, "install_url": ""}
    })
    .to_string();
    let record = HostRecord::decode(bytes.as_bytes()).unwrap_or_else(|err| panic!("decode: {err}"));
    assert_eq!(record.config_version, CONFIG_VERSION);
    assert_eq!(record.auth_options.server_key_remote_path, "/etc/docker/server-key.pem");
    assert_eq!(record.engine_options.tls_port, 2376);
    assert_eq!(record.engine_options.install_url, "https://get.docker.com");
    assert_eq!(record.swarm_options, SwarmOptions::default());
    assert_eq!(
        record.driver.get("ip_address").and_then(serde_json::Value::as_str),
        Some("10.0.0.1")
    );
}

#[test]
fn records_from_newer_releases_are_refused() {
    let bytes = json!({"config_version": 9, "name": "new", "driver_name": "none"}).to_string();
    let Err(err) = HostRecord::decode(bytes.as_bytes()) else {
        panic!("a future record version should not load");
    };
    assert!(err.to_string().contains("newer"));
}

#[test]
fn malformed_records_are_reported() {
    let Err(err) = HostRecord::decode(b"{not json") else {
        panic!("garbage should not decode");
    };
    assert!(matches!(err, HostError::Record { .. }));
}

#[tokio::test]
async fn records_carry_the_driver_snapshot_across_reloads() {
    let behaviour = FakeBehaviour::new();
    let mut host = fake_host("m1", &behaviour);
    let record = host
        .to_record()
        .await
        .unwrap_or_else(|err| panic!("record: {err}"));
    let bytes = record.encode().unwrap_or_else(|err| panic!("encode: {err}"));

    let decoded = HostRecord::decode(&bytes).unwrap_or_else(|err| panic!("decode: {err}"));
    assert_eq!(decoded, record);
    let reloaded = Host::from_record(decoded, Box::new(FakeDriver::new("other", behaviour)))
        .await
        .unwrap_or_else(|err| panic!("reload: {err}"));
    let ip = reloaded.ip().await.unwrap_or_else(|err| panic!("ip: {err}"));
    assert_eq!(ip, "192.0.2.10");
    assert_eq!(reloaded.name, "m1");
}

#[tokio::test]
async fn stop_then_start_reaches_each_state() {
    let behaviour = FakeBehaviour::new();
    behaviour.set_state("m1", MachineState::Running);
    let mut host = fake_host("m1", &behaviour);

    host.stop().await.unwrap_or_else(|err| panic!("stop: {err}"));
    assert_eq!(behaviour.state_of("m1"), MachineState::Stopped);
    host.start().await.unwrap_or_else(|err| panic!("start: {err}"));
    assert_eq!(behaviour.state_of("m1"), MachineState::Running);
}

#[tokio::test]
async fn starting_a_running_machine_reports_already_in_state() {
    let behaviour = FakeBehaviour::new();
    behaviour.set_state("m1", MachineState::Running);
    let mut host = fake_host("m1", &behaviour);

    let Err(err) = host.start().await else {
        panic!("start on a running machine should be flagged");
    };
    assert_eq!(err.kind(), ErrorKind::AlreadyInState);
    assert!(!behaviour.calls_for("m1").contains(&String::from("start")));
}

#[tokio::test]
async fn stopping_a_stopped_machine_never_reaches_the_driver() {
    let behaviour = FakeBehaviour::new();
    behaviour.set_state("m1", MachineState::Stopped);
    behaviour.fail(
        "m1",
        "stop",
        DriverError::provider("action poweroff not allowed on a stopped server"),
    );
    let mut host = fake_host("m1", &behaviour);

    let Err(err) = host.stop().await else {
        panic!("stop on a stopped machine should be flagged");
    };
    assert_eq!(err.kind(), ErrorKind::AlreadyInState);
    assert!(!behaviour.calls_for("m1").contains(&String::from("stop")));
}

#[tokio::test]
async fn driver_refusals_surface_for_real_transitions() {
    let behaviour = FakeBehaviour::new();
    behaviour.set_state("m1", MachineState::Stopped);
    behaviour.fail("m1", "start", DriverError::unsupported("none", "start"));
    let mut host = fake_host("m1", &behaviour);

    let Err(err) = host.start().await else {
        panic!("the driver refused to start");
    };
    assert_eq!(err.kind(), ErrorKind::UnsupportedForDriver);
}

#[tokio::test]
async fn restart_of_a_stopped_machine_starts_it() {
    let behaviour = FakeBehaviour::new();
    behaviour.set_state("m1", MachineState::Stopped);
    let mut host = fake_host("m1", &behaviour);

    host.restart().await.unwrap_or_else(|err| panic!("restart: {err}"));
    let calls = behaviour.calls_for("m1");
    assert!(calls.contains(&String::from("start")));
    assert!(!calls.contains(&String::from("restart")));
}

#[tokio::test]
async fn kill_does_not_check_the_prior_state() {
    let behaviour = FakeBehaviour::new();
    behaviour.set_state("m1", MachineState::Stopped);
    let mut host = fake_host("m1", &behaviour);
    host.kill().await.unwrap_or_else(|err| panic!("kill: {err}"));
}

#[tokio::test]
async fn url_requires_a_running_machine() {
    let behaviour = FakeBehaviour::new();
    behaviour.set_state("m1", MachineState::Stopped);
    let host = fake_host("m1", &behaviour);
    let Err(err) = host.url().await else {
        panic!("a stopped machine has no endpoint");
    };
    assert_eq!(err.kind(), ErrorKind::NotRunning);

    behaviour.set_state("m1", MachineState::Running);
    let url = host.url().await.unwrap_or_else(|err| panic!("url: {err}"));
    assert_eq!(url, "tcp://192.0.2.10:2376");
}

#[tokio::test]
async fn ssh_targets_come_from_the_driver() {
    let behaviour = FakeBehaviour::new();
    behaviour.set_state("m1", MachineState::Running);
    let host = fake_host("m1", &behaviour);
    let ssh = ScriptedSsh::new();
    ssh.respond("uptime", 7, "");

    let code = host
        .ssh_command(&ssh, &[String::from("uptime")])
        .await
        .unwrap_or_else(|err| panic!("ssh: {err}"));
    assert_eq!(code, Some(7));
    let targets = ssh.targets();
    let [target] = targets.as_slice() else {
        panic!("expected one connection, got {targets:?}");
    };
    assert_eq!((target.host.as_str(), target.port), ("192.0.2.10", 22));
}

#[tokio::test]
async fn provisioning_runs_over_the_driver_connection() {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let root = files::utf8(tmp.path().to_path_buf()).unwrap_or_else(|err| panic!("utf8: {err}"));
    let paths = CertPaths::in_dir(&root.join("certs"));
    let authority = CertAuthority::new(paths.clone(), "tester");
    let behaviour = FakeBehaviour::new();
    behaviour.set_state("m1", MachineState::Running);
    let mut host = fake_host("m1", &behaviour);
    host.auth_options = AuthOptions::for_machine(&paths, &root.join("machines/m1"));
    let ssh = ScriptedSsh::new();
    ssh.respond("os-release", 0, UBUNTU);
    ssh.respond("ss -tln", 0, "LISTEN 0 4096 0.0.0.0:2376 0.0.0.0:*\n");
    let services = HostServices {
        connector: &ssh,
        authority: &authority,
        policies: zero_policies(),
    };

    let report = host
        .provision(services)
        .await
        .unwrap_or_else(|err| panic!("provision: {err}"));
    assert_eq!(report.storage_driver, "overlay2");
    assert_eq!(host.engine_options.storage_driver, "overlay2");
    assert!(ssh.ran(REMOTE_UNIT_PATH));

    host.regenerate_certs(services, true)
        .await
        .unwrap_or_else(|err| panic!("regenerate: {err}"));
    assert!(ssh.ran("sudo systemctl restart docker"));
}
