//! Tests for the plugin transport over loopback sockets.

use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use rstest::rstest;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::wire::{Call, Outcome, Reply, Request, Response, decode, encode, framed};
use super::*;
use crate::driver::{Driver, DriverError, DriverOptions, FlagDescriptor, FlagValue, MachineState};
use crate::error::ErrorKind;
use crate::test_support::{FakeBehaviour, FakeDriver};

async fn spawn_server(
    behaviour: &FakeBehaviour,
    protocol: Protocol,
) -> (SocketAddr, JoinHandle<Result<(), TransportError>>) {
    let listener = TcpListener::bind(("127.0.0.1", 0))
        .await
        .unwrap_or_else(|err| panic!("bind: {err}"));
    let address = listener
        .local_addr()
        .unwrap_or_else(|err| panic!("local addr: {err}"));
    let driver = Box::new(FakeDriver::new("m1", behaviour.clone()));
    let server = tokio::spawn(serve_with(listener, driver, protocol));
    (address, server)
}

fn options(protocol_version: u32, heartbeat: Duration) -> ClientOptions {
    ClientOptions {
        protocol_version,
        heartbeat_interval: heartbeat,
        machine_name: String::from("m1"),
    }
}

#[tokio::test]
async fn negotiates_the_current_protocol() {
    let behaviour = FakeBehaviour::new();
    let (address, server) = spawn_server(&behaviour, Protocol::default()).await;

    let mut client = RpcClientDriver::connect(address, ClientOptions::default())
        .await
        .unwrap_or_else(|err| panic!("connect: {err}"));
    assert_eq!(client.service(), "machina.driver.v1");
    let name = client
        .driver_name()
        .await
        .unwrap_or_else(|err| panic!("driver name: {err}"));
    assert_eq!(name, "fake");

    client
        .close()
        .await
        .unwrap_or_else(|err| panic!("close: {err}"));
    server
        .await
        .unwrap_or_else(|err| panic!("join: {err}"))
        .unwrap_or_else(|err| panic!("serve: {err}"));
}

#[tokio::test]
async fn downgrades_once_to_the_previous_protocol() {
    let behaviour = FakeBehaviour::new();
    let (address, _server) = spawn_server(&behaviour, Protocol::version(0)).await;

    let client = RpcClientDriver::connect(address, options(1, DEFAULT_HEARTBEAT_INTERVAL))
        .await
        .unwrap_or_else(|err| panic!("connect: {err}"));
    assert_eq!(client.service(), "machina.driver.v0");
    let name = client
        .machine_name()
        .await
        .unwrap_or_else(|err| panic!("machine name: {err}"));
    assert_eq!(name, "m1");
}

#[rstest]
#[case::two_versions_behind(Protocol::version(1), 3)]
#[case::wrong_reported_version(Protocol { service: service_name(1), version: 7 }, 1)]
#[case::nothing_older(Protocol::version(4), 0)]
#[tokio::test]
async fn refuses_incompatible_plugins(#[case] protocol: Protocol, #[case] client_version: u32) {
    let behaviour = FakeBehaviour::new();
    let (address, _server) = spawn_server(&behaviour, protocol).await;

    let result =
        RpcClientDriver::connect(address, options(client_version, DEFAULT_HEARTBEAT_INTERVAL))
            .await;
    let Err(err) = result else {
        panic!("negotiation should fail");
    };
    assert_eq!(err.kind(), ErrorKind::IncompatibleDriver, "{err}");
}

#[tokio::test]
async fn unreachable_address_is_plugin_unreachable() {
    let listener = TcpListener::bind(("127.0.0.1", 0))
        .await
        .unwrap_or_else(|err| panic!("bind: {err}"));
    let address = listener
        .local_addr()
        .unwrap_or_else(|err| panic!("local addr: {err}"));
    drop(listener);

    let Err(err) = RpcClientDriver::connect(address, ClientOptions::default()).await else {
        panic!("connecting to a closed port should fail");
    };
    assert_eq!(err.kind(), ErrorKind::PluginUnreachable);
}

#[tokio::test]
async fn slow_create_keeps_the_heartbeat_alive() {
    let behaviour = FakeBehaviour::new();
    behaviour.delay("m1", "create", Duration::from_millis(400));
    let (address, _server) = spawn_server(&behaviour, Protocol::default()).await;

    let mut client = RpcClientDriver::connect(address, options(1, Duration::from_millis(50)))
        .await
        .unwrap_or_else(|err| panic!("connect: {err}"));
    client
        .create()
        .await
        .unwrap_or_else(|err| panic!("create: {err}"));
    let state = client
        .state()
        .await
        .unwrap_or_else(|err| panic!("state: {err}"));
    assert_eq!(state, MachineState::Running);
    assert_eq!(behaviour.allocated("m1"), 1);
}

/// Answers `get-version` and then goes silent, recording every method it
/// receives.
async fn silent_server(listener: TcpListener, seen: mpsc::UnboundedSender<&'static str>) {
    let Ok((stream, _)) = listener.accept().await else {
        return;
    };
    let (mut sink, mut frames) = framed(stream).split();
    while let Some(Ok(frame)) = frames.next().await {
        let Ok(request) = decode::<Request>(&frame) else {
            continue;
        };
        seen.send(request.call.method()).ok();
        if request.call == Call::GetVersion {
            let response = Response {
                id: request.id,
                outcome: Outcome::Result(Reply::Version(PROTOCOL_VERSION)),
            };
            let Ok(bytes) = encode(&response) else {
                return;
            };
            if sink.send(bytes).await.is_err() {
                return;
            }
        }
    }
}

#[tokio::test]
async fn heartbeat_loss_fails_the_in_flight_call() {
    let listener = TcpListener::bind(("127.0.0.1", 0))
        .await
        .unwrap_or_else(|err| panic!("bind: {err}"));
    let address = listener
        .local_addr()
        .unwrap_or_else(|err| panic!("local addr: {err}"));
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    let _server = tokio::spawn(silent_server(listener, seen_tx));

    let mut client = RpcClientDriver::connect(address, options(1, Duration::from_millis(50)))
        .await
        .unwrap_or_else(|err| panic!("connect: {err}"));
    let started = tokio::time::Instant::now();
    let Err(err) = client.create().await else {
        panic!("create against a silent plugin should fail");
    };
    assert_eq!(err.kind(), ErrorKind::PluginUnreachable, "{err}");
    assert!(err.to_string().contains("missed a heartbeat"), "{err}");
    assert!(started.elapsed() < Duration::from_secs(2));

    let Err(next) = client.state().await else {
        panic!("calls after heartbeat loss should fail");
    };
    assert_eq!(next.kind(), ErrorKind::PluginUnreachable);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut methods = Vec::new();
    while let Ok(method) = seen_rx.try_recv() {
        methods.push(method);
    }
    assert!(methods.contains(&"create"), "{methods:?}");
    assert!(!methods.contains(&"state"), "{methods:?}");
}

#[tokio::test]
async fn panics_become_errors_and_the_plugin_keeps_serving() {
    let behaviour = FakeBehaviour::new();
    behaviour.panic_on("m1", "create");
    let (address, _server) = spawn_server(&behaviour, Protocol::default()).await;

    let mut client = RpcClientDriver::connect(address, ClientOptions::default())
        .await
        .unwrap_or_else(|err| panic!("connect: {err}"));
    let Err(err) = client.create().await else {
        panic!("create should surface the panic");
    };
    assert_eq!(err.kind(), ErrorKind::DriverPanic);
    assert!(
        err.message()
            .starts_with("panic in the driver: fake driver told to panic during create"),
        "{err}"
    );

    let state = client
        .state()
        .await
        .unwrap_or_else(|err| panic!("state after panic: {err}"));
    assert_eq!(state, MachineState::None);
}

#[tokio::test]
async fn driver_errors_surface_unchanged() {
    let behaviour = FakeBehaviour::new();
    behaviour.fail(
        "m1",
        "pre-create-check",
        DriverError::PrecreateFailed {
            message: String::from("quota exhausted"),
        },
    );
    let (address, _server) = spawn_server(&behaviour, Protocol::default()).await;

    let client = RpcClientDriver::connect(address, ClientOptions::default())
        .await
        .unwrap_or_else(|err| panic!("connect: {err}"));
    let Err(err) = client.pre_create_check().await else {
        panic!("pre-create check should fail");
    };
    assert_eq!(
        err,
        DriverError::PrecreateFailed {
            message: String::from("quota exhausted"),
        }
    );
}

#[tokio::test]
async fn flags_and_configuration_cross_the_wire() {
    let behaviour = FakeBehaviour::new();
    let (address, _server) = spawn_server(&behaviour, Protocol::default()).await;

    let mut client = RpcClientDriver::connect(address, ClientOptions::default())
        .await
        .unwrap_or_else(|err| panic!("connect: {err}"));
    let flags = client
        .create_flags()
        .await
        .unwrap_or_else(|err| panic!("flags: {err}"));
    assert_eq!(
        flags,
        vec![
            FlagDescriptor::string("fake-label", "label recorded by the fake", "plain")
                .with_env("FAKE_LABEL")
        ]
    );

    let values =
        DriverOptions::new().with("fake-label", FlagValue::String(String::from("blue")));
    client
        .configure(&values)
        .await
        .unwrap_or_else(|err| panic!("configure: {err}"));
    let raw = client
        .config_raw()
        .await
        .unwrap_or_else(|err| panic!("config raw: {err}"));
    let snapshot: serde_json::Value =
        serde_json::from_slice(&raw).unwrap_or_else(|err| panic!("decode: {err}"));
    assert_eq!(snapshot["label"], "blue");
    assert_eq!(snapshot["machine_name"], "m1");

    client
        .set_config_raw(&raw)
        .await
        .unwrap_or_else(|err| panic!("set config raw: {err}"));
    let port = client
        .ssh_port()
        .await
        .unwrap_or_else(|err| panic!("ssh port: {err}"));
    assert_eq!(port, 22);
}

#[tokio::test]
async fn url_requires_a_running_machine() {
    let behaviour = FakeBehaviour::new();
    behaviour.set_state("m1", MachineState::Stopped);
    let (address, _server) = spawn_server(&behaviour, Protocol::default()).await;

    let client = RpcClientDriver::connect(address, ClientOptions::default())
        .await
        .unwrap_or_else(|err| panic!("connect: {err}"));
    let Err(err) = client.url().await else {
        panic!("url should require running");
    };
    assert_eq!(err.kind(), ErrorKind::NotRunning);
}

#[tokio::test]
async fn calls_after_close_fail_without_a_connection() {
    let behaviour = FakeBehaviour::new();
    let (address, server) = spawn_server(&behaviour, Protocol::default()).await;

    let mut client = RpcClientDriver::connect(address, ClientOptions::default())
        .await
        .unwrap_or_else(|err| panic!("connect: {err}"));
    client
        .close()
        .await
        .unwrap_or_else(|err| panic!("close: {err}"));
    let Err(err) = client.ip().await else {
        panic!("closed client should refuse calls");
    };
    assert_eq!(err.kind(), ErrorKind::PluginUnreachable);
    server
        .await
        .unwrap_or_else(|err| panic!("join: {err}"))
        .unwrap_or_else(|err| panic!("serve: {err}"));
}

#[test]
fn service_names_carry_the_version() {
    assert_eq!(service_name(PROTOCOL_VERSION), "machina.driver.v1");
    assert_eq!(service_name(0), "machina.driver.v0");
}
