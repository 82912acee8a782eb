//! Unit tests for the controller: create, fan-out, listing and removal.

use std::collections::BTreeMap;
use std::time::Duration;

use camino::Utf8PathBuf;
use rstest::{fixture, rstest};
use tempfile::TempDir;

use super::*;
use crate::cert::CertPaths;
use crate::driver::MachineState;
use crate::files;
use crate::test_support::{
    FakeBehaviour, FakeDriver, FakeDriverFactory, MemoryStore, ScriptedSsh,
};

const UBUNTU_XENIAL: &str = "ID=ubuntu\nVERSION_ID=\"16.04\"\n";

struct Rig {
    _tmp: TempDir,
    root: Utf8PathBuf,
    store: MemoryStore,
    behaviour: FakeBehaviour,
    drivers: FakeDriverFactory,
    ssh: ScriptedSsh,
    authority: CertAuthority,
}

impl Rig {
    fn settings(&self) -> ControllerSettings {
        let quick = RetryPolicy::fixed(3, Duration::ZERO);
        ControllerSettings {
            log_drain: Duration::ZERO,
            policies: Policies {
                ssh: quick,
                runtime: quick,
                package_lock: quick,
            },
            state_wait: quick,
            ..ControllerSettings::new(self.root.clone())
        }
    }

    fn controller(&self) -> Controller<'_> {
        Controller::new(
            &self.store,
            &self.drivers,
            &self.ssh,
            &self.authority,
            self.settings(),
        )
    }

    async fn seed(&self, name: &str, state: MachineState) {
        self.behaviour.set_state(name, state);
        let mut host = Host::new(
            name,
            FakeDriver::NAME,
            Box::new(FakeDriver::new(name, self.behaviour.clone())),
            AuthOptions::default(),
            EngineOptions::default(),
        )
        .unwrap_or_else(|err| panic!("host: {err}"));
        let record = host
            .to_record()
            .await
            .unwrap_or_else(|err| panic!("record: {err}"));
        self.store
            .save(&record)
            .unwrap_or_else(|err| panic!("seed: {err}"));
    }
}

#[fixture]
fn rig() -> Rig {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let root = files::utf8(tmp.path().to_path_buf()).unwrap_or_else(|err| panic!("utf8: {err}"));
    let behaviour = FakeBehaviour::new();
    let ssh = ScriptedSsh::new();
    ssh.respond("os-release", 0, UBUNTU_XENIAL);
    ssh.respond("ss -tln", 0, "LISTEN 0 4096 *:2376 *:*\n");
    Rig {
        authority: CertAuthority::new(CertPaths::in_dir(&store::certs_dir(&root)), "tester"),
        _tmp: tmp,
        root,
        store: MemoryStore::new(),
        drivers: FakeDriverFactory::new(behaviour.clone()),
        behaviour,
        ssh,
    }
}

fn fake_request(name: &str) -> CreateRequest {
    CreateRequest {
        name: name.to_owned(),
        driver_name: FakeDriver::NAME.to_owned(),
        flags: BTreeMap::from([(String::from("fake-label"), vec![String::from("blue")])]),
        ..CreateRequest::default()
    }
}

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|name| (*name).to_owned()).collect()
}

#[rstest]
#[tokio::test]
async fn create_saves_around_each_phase_and_provisions(rig: Rig) {
    let created = rig
        .controller()
        .create(fake_request("m1"))
        .await
        .unwrap_or_else(|err| panic!("create: {err}"));

    assert_eq!(rig.store.saves(), names(&["m1", "m1", "m1"]));
    let report = created.report.unwrap_or_else(|| panic!("fake hosts are provisioned"));
    assert_eq!(report.storage_driver, "overlay2");
    assert_eq!(rig.behaviour.allocated("m1"), 1);

    let record = rig
        .store
        .record("m1")
        .unwrap_or_else(|| panic!("record missing"));
    assert_eq!(
        record.driver.get("label").and_then(serde_json::Value::as_str),
        Some("blue")
    );
    assert_eq!(record.engine_options.storage_driver, "overlay2");
    assert_eq!(record.swarm_options, SwarmOptions::default());
    assert!(!record.swarm_options.is_swarm);
    assert_eq!(record.swarm_options.host, "tcp://0.0.0.0:3376");
    assert_eq!(record.swarm_options.image, "swarm:latest");
    assert_eq!(record.swarm_options.strategy, "spread");
    assert!(
        record
            .auth_options
            .server_cert_path
            .as_str()
            .ends_with("machines/m1/server.pem")
    );
    assert!(rig.ssh.ran("sudo hostname m1"));
}

#[rstest]
#[tokio::test]
async fn precreate_failures_leave_nothing_behind(rig: Rig) {
    rig.behaviour.fail(
        "m1",
        "pre-create-check",
        DriverError::PrecreateFailed {
            message: String::from("quota exhausted"),
        },
    );
    let Err(err) = rig.controller().create(fake_request("m1")).await else {
        panic!("create should stop at the pre-create check");
    };

    assert_eq!(err.kind(), ErrorKind::PrecreateFailed);
    assert_eq!(err.kind().exit_code(), 3);
    assert!(rig.store.saves().is_empty());
    assert_eq!(rig.behaviour.allocated("m1"), 0);
}

#[rstest]
#[tokio::test]
async fn configuration_failures_close_the_driver(rig: Rig) {
    rig.behaviour
        .fail("m1", "configure", DriverError::config("bad flag value"));
    let Err(err) = rig.controller().create(fake_request("m1")).await else {
        panic!("create should stop at configure");
    };

    assert_eq!(err.kind(), ErrorKind::ConfigInvalid);
    assert_eq!(rig.behaviour.closes("m1"), 1);
    assert!(rig.store.saves().is_empty());
}

#[rstest]
#[tokio::test]
async fn unknown_flags_close_the_driver(rig: Rig) {
    let request = CreateRequest {
        flags: BTreeMap::from([(String::from("fake-colour"), vec![String::from("red")])]),
        ..fake_request("m1")
    };
    let Err(err) = rig.controller().create(request).await else {
        panic!("create should reject an unknown flag");
    };

    assert_eq!(err.kind(), ErrorKind::ConfigInvalid);
    assert_eq!(rig.behaviour.closes("m1"), 1);
    assert!(!rig.behaviour.calls_for("m1").contains(&String::from("configure")));
}

#[rstest]
#[tokio::test]
async fn failed_creates_release_partial_allocations(rig: Rig) {
    rig.behaviour.fail(
        "m1",
        "create",
        DriverError::CreateFailed {
            message: String::from("volume attach failed"),
        },
    );
    let Err(err) = rig.controller().create(fake_request("m1")).await else {
        panic!("create should fail");
    };

    assert_eq!(err.kind(), ErrorKind::CreateFailed);
    assert_eq!(rig.behaviour.allocated("m1"), 0);
    assert!(rig.store.record("m1").is_none());
    assert!(rig.behaviour.calls_for("m1").contains(&String::from("remove")));
}

#[rstest]
#[tokio::test]
async fn unreleased_allocations_keep_the_record(rig: Rig) {
    rig.behaviour.fail(
        "m1",
        "create",
        DriverError::CreateFailed {
            message: String::from("boom"),
        },
    );
    rig.behaviour
        .fail("m1", "remove", DriverError::provider("api down"));
    let Err(err) = rig.controller().create(fake_request("m1")).await else {
        panic!("create should fail");
    };

    assert_eq!(err.kind(), ErrorKind::CreateFailed);
    assert!(rig.store.record("m1").is_some());
}

#[rstest]
#[tokio::test]
async fn provisioning_failures_are_reported_after_saving(rig: Rig) {
    rig.ssh.respond("os-release", 0, "ID=arch\n");
    let Err(err) = rig.controller().create(fake_request("m1")).await else {
        panic!("arch cannot be provisioned");
    };

    assert_eq!(err.kind(), ErrorKind::OsUnrecognized);
    assert_eq!(rig.store.saves().len(), 3);
    assert!(rig.store.record("m1").is_some());
}

#[rstest]
#[tokio::test]
async fn duplicate_and_malformed_names_are_refused(rig: Rig) {
    rig.seed("m1", MachineState::Running).await;
    let Err(duplicate) = rig.controller().create(fake_request("m1")).await else {
        panic!("m1 already exists");
    };
    assert_eq!(duplicate.kind(), ErrorKind::AlreadyExists);

    let Err(malformed) = rig.controller().create(fake_request("no/slashes")).await else {
        panic!("slashes are not allowed");
    };
    assert_eq!(malformed.kind(), ErrorKind::ConfigInvalid);
}

#[rstest]
#[tokio::test]
async fn parallel_stop_brings_every_host_down(rig: Rig) {
    rig.seed("m1", MachineState::Running).await;
    rig.seed("m2", MachineState::Stopped).await;
    rig.seed("m3", MachineState::Running).await;
    let seeded = rig.store.saves().len();

    let reports = rig
        .controller()
        .for_each(&names(&["m1", "m2", "m3"]), HostVerb::Stop)
        .await
        .unwrap_or_else(|err| panic!("stop: {err}"));

    assert_eq!(reports.len(), 3);
    for name in ["m1", "m2", "m3"] {
        assert_eq!(rig.behaviour.state_of(name), MachineState::Stopped);
    }
    assert_eq!(rig.store.saves().len() - seeded, 3);
}

#[rstest]
#[tokio::test]
async fn one_failing_host_does_not_stop_its_siblings(rig: Rig) {
    for name in ["m1", "m2", "m3"] {
        rig.seed(name, MachineState::Running).await;
    }
    rig.behaviour
        .fail("m2", "stop", DriverError::provider("rate limited"));

    let Err(err) = rig
        .controller()
        .for_each(&names(&["m1", "m2", "m3"]), HostVerb::Stop)
        .await
    else {
        panic!("m2 should fail");
    };

    let ControllerError::Fanout { failures } = &err else {
        panic!("expected a fan-out error, got {err}");
    };
    assert_eq!(failures.len(), 1);
    assert!(err.to_string().starts_with("m2: "));
    assert_eq!(err.kind(), ErrorKind::Provider);
    assert_eq!(rig.behaviour.state_of("m1"), MachineState::Stopped);
    assert_eq!(rig.behaviour.state_of("m3"), MachineState::Stopped);
}

#[rstest]
#[tokio::test]
async fn stopping_a_mixed_fleet_skips_stopped_hosts(rig: Rig) {
    rig.seed("m1", MachineState::Running).await;
    rig.seed("m2", MachineState::Stopped).await;
    rig.behaviour.fail(
        "m2",
        "stop",
        DriverError::provider("action poweroff not allowed on a stopped server"),
    );

    rig.controller()
        .for_each(&names(&["m1", "m2"]), HostVerb::Stop)
        .await
        .unwrap_or_else(|err| panic!("stop: {err}"));

    assert_eq!(rig.behaviour.state_of("m1"), MachineState::Stopped);
    assert!(!rig.behaviour.calls_for("m2").contains(&String::from("stop")));
}

#[rstest]
#[tokio::test]
async fn ip_fan_out_reports_each_address(rig: Rig) {
    rig.seed("m10", MachineState::Running).await;
    rig.seed("m2", MachineState::Running).await;
    let reports = rig
        .controller()
        .for_each(&names(&["m10", "m2"]), HostVerb::Ip)
        .await
        .unwrap_or_else(|err| panic!("ip: {err}"));
    let order: Vec<&str> = reports.iter().map(|report| report.name.as_str()).collect();
    assert_eq!(order, vec!["m2", "m10"]);
    assert!(
        reports
            .iter()
            .all(|report| report.output.as_deref() == Some("192.0.2.10"))
    );
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn stuck_hosts_time_out_without_blocking_the_list(rig: Rig) {
    rig.seed("m1", MachineState::Running).await;
    rig.seed("m2", MachineState::Stopped).await;
    rig.seed("m3", MachineState::Running).await;
    rig.behaviour
        .delay("m3", "state", Duration::from_secs(600));

    let controller = Controller::new(
        &rig.store,
        &rig.drivers,
        &rig.ssh,
        &rig.authority,
        ControllerSettings {
            list_timeout: Duration::from_secs(10),
            ..rig.settings()
        },
    );
    let rows = controller
        .list()
        .await
        .unwrap_or_else(|err| panic!("list: {err}"));

    let states: Vec<(&str, MachineState)> = rows
        .iter()
        .map(|row| (row.name.as_str(), row.state))
        .collect();
    assert_eq!(
        states,
        vec![
            ("m1", MachineState::Running),
            ("m2", MachineState::Stopped),
            ("m3", MachineState::Timeout),
        ]
    );
    let stuck = rows
        .iter()
        .find(|row| row.name == "m3")
        .unwrap_or_else(|| panic!("m3 missing"));
    assert_eq!(stuck.response_time, Duration::from_secs(10));
    let running = rows
        .iter()
        .find(|row| row.name == "m1")
        .unwrap_or_else(|| panic!("m1 missing"));
    assert_eq!(running.url.as_deref(), Some("tcp://192.0.2.10:2376"));
}

#[rstest]
#[tokio::test]
async fn hosts_with_unknown_drivers_still_list_and_remove(rig: Rig) {
    let record = HostRecord {
        config_version: crate::host::CONFIG_VERSION,
        name: String::from("legacy"),
        driver_name: String::from("vmwarefusion"),
        driver: serde_json::json!({"machine_name": "legacy"}),
        auth_options: AuthOptions::default(),
        engine_options: EngineOptions::default(),
        swarm_options: SwarmOptions::default(),
    };
    rig.store
        .save(&record)
        .unwrap_or_else(|err| panic!("seed: {err}"));

    let rows = rig
        .controller()
        .list()
        .await
        .unwrap_or_else(|err| panic!("list: {err}"));
    let [row] = rows.as_slice() else {
        panic!("expected one row, got {rows:?}");
    };
    assert_eq!(row.state, MachineState::Error);
    assert_eq!(row.driver_name, "vmwarefusion");

    let Err(err) = rig.controller().remove("legacy", false).await else {
        panic!("the driver cannot release resources");
    };
    assert_eq!(err.kind(), ErrorKind::PluginUnreachable);
    rig.controller()
        .remove("legacy", true)
        .await
        .unwrap_or_else(|err| panic!("forced remove: {err}"));
    assert!(rig.store.record("legacy").is_none());
}

#[rstest]
#[tokio::test]
async fn remove_asks_the_driver_before_forgetting(rig: Rig) {
    rig.seed("m1", MachineState::Running).await;
    rig.controller()
        .remove("m1", false)
        .await
        .unwrap_or_else(|err| panic!("remove: {err}"));
    assert_eq!(rig.behaviour.calls_for("m1").last().map(String::as_str), Some("remove"));
    assert!(rig.store.record("m1").is_none());

    let Err(err) = rig.controller().remove("m1", false).await else {
        panic!("m1 is gone");
    };
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn no_driver_hosts_refuse_lifecycle_verbs() {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let root = files::utf8(tmp.path().to_path_buf()).unwrap_or_else(|err| panic!("utf8: {err}"));
    let store = MemoryStore::new();
    let drivers = InProcessFactory::new(&root);
    let ssh = ScriptedSsh::new();
    let authority = CertAuthority::new(CertPaths::in_dir(&store::certs_dir(&root)), "tester");
    let controller = Controller::new(
        &store,
        &drivers,
        &ssh,
        &authority,
        ControllerSettings {
            state_wait: RetryPolicy::fixed(2, Duration::ZERO),
            ..ControllerSettings::new(root.clone())
        },
    );

    let created = controller
        .create(CreateRequest {
            name: String::from("m1"),
            driver_name: String::from("none"),
            flags: BTreeMap::from([(
                String::from("url"),
                vec![String::from("tcp://1.2.3.4:2376")],
            )]),
            ..CreateRequest::default()
        })
        .await
        .unwrap_or_else(|err| panic!("create: {err}"));
    assert!(created.report.is_none());
    assert!(ssh.commands().is_empty());

    let hosts = names(&["m1"]);
    for verb in [HostVerb::Stop, HostVerb::Kill, HostVerb::Restart] {
        let Err(err) = controller.for_each(&hosts, verb).await else {
            panic!("{verb} should be refused");
        };
        assert_eq!(err.kind(), ErrorKind::UnsupportedForDriver);
    }
    controller
        .for_each(&hosts, HostVerb::Start)
        .await
        .unwrap_or_else(|err| panic!("a driverless host always runs: {err}"));
    let url = controller
        .url("m1")
        .await
        .unwrap_or_else(|err| panic!("url: {err}"));
    assert_eq!(url, "tcp://1.2.3.4:2376");

    controller
        .remove("m1", false)
        .await
        .unwrap_or_else(|err| panic!("remove: {err}"));
    assert!(store.record("m1").is_none());
}
