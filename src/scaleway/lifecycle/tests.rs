//! Unit tests for Scaleway lifecycle helpers.

use std::cell::Cell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use camino::Utf8Path;
use rstest::{fixture, rstest};
use scaleway_rs::ScalewayImage;

use super::InstanceSnapshot;
use crate::scaleway::types::{Action, InstanceId, InstanceState};
use crate::scaleway::{ScalewayDriver, ScalewayDriverError, WaitTiming};

fn snapshot(
    id: impl Into<InstanceId>,
    state: impl Into<InstanceState>,
    allowed: impl IntoIterator<Item = impl Into<Action>>,
    public_ip: Option<&str>,
) -> InstanceSnapshot {
    InstanceSnapshot {
        id: id.into(),
        state: state.into(),
        allowed_actions: allowed.into_iter().map(Into::into).collect(),
        public_ip: public_ip.map(str::to_owned),
    }
}

#[derive(Copy, Clone)]
struct ImageSpec {
    id: &'static str,
    arch: &'static str,
    state: &'static str,
    creation_date: &'static str,
}

fn image(spec: ImageSpec) -> ScalewayImage {
    ScalewayImage {
        id: spec.id.to_owned(),
        name: String::new(),
        arch: spec.arch.to_owned(),
        creation_date: spec.creation_date.to_owned(),
        modification_date: String::new(),
        from_server: None,
        organization: String::new(),
        public: true,
        state: spec.state.to_owned(),
        project: String::new(),
        tags: vec![],
        zone: String::new(),
        root_volume: scaleway_rs::ScalewayImageRootVolume {
            id: String::new(),
            name: String::new(),
            size: 0,
            volume_type: String::new(),
        },
        default_bootscript: None,
        extra_volumes: scaleway_rs::ScalewayImageExtraVolumes {
            volumes: HashMap::new(),
        },
    }
}

#[fixture]
fn driver() -> ScalewayDriver {
    let mut driver = ScalewayDriver::new("m1", Utf8Path::new("/tmp/store")).with_timing(
        WaitTiming {
            poll_interval: Duration::from_millis(1),
            wait_timeout: Duration::from_millis(5),
        },
    );
    driver.secret_key = String::from("dummy");
    driver.project_id = String::from("proj");
    driver.instance_type = String::from("DEV1-S");
    driver
}

#[rstest]
#[tokio::test]
async fn power_on_if_needed_returns_ok_for_running(driver: ScalewayDriver) {
    let snap = snapshot("id", "running", [Action::from("poweron")], Some("1.1.1.1"));
    let result = driver.power_on_if_needed(&snap).await;
    assert!(result.is_ok());
}

#[rstest]
#[tokio::test]
async fn power_on_if_needed_errors_when_not_allowed(driver: ScalewayDriver) {
    let snap = snapshot("id", "stopped", Vec::<Action>::new(), None);
    let result = driver.power_on_if_needed(&snap).await;
    assert!(matches!(
        result,
        Err(ScalewayDriverError::PowerOnNotAllowed { .. })
    ));
}

#[rstest]
fn select_image_id_returns_newest_creation_date(driver: ScalewayDriver) {
    let images = vec![
        image(ImageSpec {
            id: "older",
            arch: "x86_64",
            state: "available",
            creation_date: "2025-01-01T00:00:00Z",
        }),
        image(ImageSpec {
            id: "newest",
            arch: "x86_64",
            state: "available",
            creation_date: "2025-02-01T00:00:00Z",
        }),
    ];

    let id = driver
        .select_image_id(images)
        .unwrap_or_else(|err| panic!("image selected: {err}"));
    assert_eq!(id, "newest");
}

#[rstest]
fn select_image_id_errors_on_empty(driver: ScalewayDriver) {
    let Err(err) = driver.select_image_id(Vec::new()) else {
        panic!("empty candidates should fail");
    };
    assert!(matches!(err, ScalewayDriverError::ImageNotFound { .. }));
}

#[rstest]
fn filter_images_drops_other_arches_and_unavailable_images(driver: ScalewayDriver) {
    let images = vec![
        image(ImageSpec {
            id: "arm",
            arch: "arm64",
            state: "available",
            creation_date: "2025-03-01T00:00:00Z",
        }),
        image(ImageSpec {
            id: "creating",
            arch: "x86_64",
            state: "creating",
            creation_date: "2025-03-01T00:00:00Z",
        }),
        image(ImageSpec {
            id: "ok",
            arch: "x86_64",
            state: "available",
            creation_date: "2025-01-01T00:00:00Z",
        }),
    ];

    let kept: Vec<String> = driver
        .filter_images(images)
        .into_iter()
        .map(|candidate| candidate.id)
        .collect();
    assert_eq!(kept, ["ok"]);
}

#[rstest]
#[tokio::test]
#[expect(
    clippy::excessive_nesting,
    reason = "nested async closures keep fixtures inline for readability"
)]
async fn resolve_image_id_prefers_project_results(driver: ScalewayDriver) {
    let public_called = Rc::new(Cell::new(false));

    let result = driver
        .resolve_image_id_with(
            || async {
                Ok(vec![image(ImageSpec {
                    id: "project-img",
                    arch: "x86_64",
                    state: "available",
                    creation_date: "2025-02-01T00:00:00Z",
                })])
            },
            {
                let flag = Rc::clone(&public_called);
                move || {
                    flag.set(true);
                    async { Ok(Vec::new()) }
                }
            },
        )
        .await;

    assert_eq!(result, Ok(String::from("project-img")));
    assert!(!public_called.get());
}

#[rstest]
#[tokio::test]
async fn resolve_image_id_falls_back_to_public_images(driver: ScalewayDriver) {
    let result = driver
        .resolve_image_id_with(
            || async { Ok(Vec::new()) },
            || async {
                Ok(vec![image(ImageSpec {
                    id: "public-img",
                    arch: "x86_64",
                    state: "available",
                    creation_date: "2025-01-01T00:00:00Z",
                })])
            },
        )
        .await;

    assert_eq!(result, Ok(String::from("public-img")));
}
