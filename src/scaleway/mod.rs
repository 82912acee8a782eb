//! Driver that provisions machines through the Scaleway Instances API.

mod error;
mod lifecycle;
mod types;
mod user_data;

use std::time::Duration;

use camino::Utf8Path;
use scaleway_rs::ScalewayApi;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::command::ProcessCommandRunner;
use crate::driver::{
    BaseDriver, DEFAULT_ENGINE_PORT, DEFAULT_SSH_USER, Driver, DriverError, DriverFuture,
    DriverOptions, FlagDescriptor, MachineState, decode_config, encode_config,
};
use crate::ssh::{generate_key_pair, public_key_path};

pub use error::ScalewayDriverError;

/// Registry name of the driver.
pub const DRIVER_NAME: &str = "scaleway";

const SECRET_KEY_FLAG: &str = "scaleway-secret-key";
const PROJECT_FLAG: &str = "scaleway-project-id";
const ORGANIZATION_FLAG: &str = "scaleway-organization-id";
const ZONE_FLAG: &str = "scaleway-zone";
const INSTANCE_TYPE_FLAG: &str = "scaleway-instance-type";
const IMAGE_FLAG: &str = "scaleway-image";
const ARCH_FLAG: &str = "scaleway-arch";
const SSH_USER_FLAG: &str = "scaleway-ssh-user";

const DEFAULT_ZONE: &str = "fr-par-1";
const DEFAULT_INSTANCE_TYPE: &str = "DEV1-S";
const DEFAULT_IMAGE: &str = "Ubuntu 24.04 Noble Numbat";
const DEFAULT_ARCH: &str = "x86_64";

const POLL_INTERVAL: Duration = Duration::from_secs(5);
const WAIT_TIMEOUT: Duration = Duration::from_secs(300);

/// Polling cadence for provider-side waits.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct WaitTiming {
    /// Delay between API polls.
    pub poll_interval: Duration,
    /// Upper bound for one wait.
    pub wait_timeout: Duration,
}

impl Default for WaitTiming {
    fn default() -> Self {
        Self {
            poll_interval: POLL_INTERVAL,
            wait_timeout: WAIT_TIMEOUT,
        }
    }
}

/// Driver state for one Scaleway server.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ScalewayDriver {
    /// Shared driver attributes.
    #[serde(flatten)]
    pub base: BaseDriver,
    /// API secret key.
    #[serde(default)]
    pub secret_key: String,
    /// Project owning the server.
    #[serde(default)]
    pub project_id: String,
    /// Optional organisation scope for image lookups.
    #[serde(default)]
    pub organization_id: Option<String>,
    /// Availability zone.
    #[serde(default)]
    pub zone: String,
    /// Commercial instance type.
    #[serde(default)]
    pub instance_type: String,
    /// Image label.
    #[serde(default)]
    pub image: String,
    /// Image architecture.
    #[serde(default)]
    pub architecture: String,
    /// Provider identifier of the server, once created.
    #[serde(default)]
    pub server_id: String,
    #[serde(skip)]
    timing: WaitTiming,
}

impl ScalewayDriver {
    /// Creates an unconfigured driver.
    #[must_use]
    pub fn new(machine_name: &str, store_path: &Utf8Path) -> Self {
        Self {
            base: BaseDriver::new(machine_name, store_path),
            zone: DEFAULT_ZONE.to_owned(),
            instance_type: DEFAULT_INSTANCE_TYPE.to_owned(),
            image: DEFAULT_IMAGE.to_owned(),
            architecture: DEFAULT_ARCH.to_owned(),
            ..Self::default()
        }
    }

    /// Overrides the polling cadence.
    #[must_use]
    pub const fn with_timing(mut self, timing: WaitTiming) -> Self {
        self.timing = timing;
        self
    }

    fn api(&self) -> ScalewayApi {
        ScalewayApi::new(&self.secret_key)
    }

    fn apply(&mut self, options: &DriverOptions) -> Result<(), DriverError> {
        let secret = options.string(SECRET_KEY_FLAG).unwrap_or_default();
        if secret.is_empty() {
            return Err(DriverError::CredentialsMissing {
                message: format!(
                    "the scaleway driver requires --{SECRET_KEY_FLAG} or SCW_SECRET_KEY"
                ),
            });
        }
        let project = options.string(PROJECT_FLAG).unwrap_or_default();
        if project.is_empty() {
            return Err(DriverError::config(format!(
                "the scaleway driver requires --{PROJECT_FLAG}"
            )));
        }
        self.secret_key = secret.to_owned();
        self.project_id = project.to_owned();
        self.organization_id = options
            .string(ORGANIZATION_FLAG)
            .filter(|org| !org.is_empty())
            .map(str::to_owned);
        self.zone = non_empty(options, ZONE_FLAG, DEFAULT_ZONE);
        self.instance_type = non_empty(options, INSTANCE_TYPE_FLAG, DEFAULT_INSTANCE_TYPE);
        self.image = non_empty(options, IMAGE_FLAG, DEFAULT_IMAGE);
        self.architecture = non_empty(options, ARCH_FLAG, DEFAULT_ARCH);
        self.base.ssh_user = non_empty(options, SSH_USER_FLAG, DEFAULT_SSH_USER);
        Ok(())
    }

    async fn provision_server(&mut self) -> Result<(), ScalewayDriverError> {
        let key_path = self.base.resolve_store_path("id_rsa");
        generate_key_pair(&ProcessCommandRunner, &key_path).await?;
        let public_key = tokio::fs::read_to_string(public_key_path(&key_path))
            .await
            .map_err(|err| ScalewayDriverError::SshKey {
                message: err.to_string(),
            })?;
        self.base.ssh_key_path = key_path.into_string();

        let image_id = self.resolve_image_id().await?;
        let user_data = user_data::authorized_key_user_data(&self.base.ssh_user(), &public_key);
        let server = self.create_instance_stopped(&image_id, user_data).await?;
        self.server_id.clone_from(&server.id);
        info!(machine = %self.base.machine_name, server = %self.server_id, "created stopped server");

        let snapshot = lifecycle::InstanceSnapshot::from(server);
        self.power_on_if_needed(&snapshot).await?;
        let address = self.wait_for_public_ip().await?;
        self.base.ip_address = address.to_string();
        self.wait_for_ssh_ready(address).await
    }

    async fn perform(&self, action: &str) -> Result<(), DriverError> {
        if self.server_id.is_empty() {
            return Err(DriverError::provider(format!(
                "machine {} has no server",
                self.base.machine_name
            )));
        }
        self.api()
            .perform_instance_action_async(&self.zone, &self.server_id, action)
            .await
            .map_err(|err| DriverError::provider(err.to_string()))
    }

    async fn current_state(&self) -> Result<MachineState, DriverError> {
        if self.server_id.is_empty() {
            return Ok(MachineState::None);
        }
        let snapshot = self.fetch_instance().await?;
        Ok(snapshot.map_or(MachineState::None, |server| server.state.machine_state()))
    }

    async fn current_ip(&self) -> Result<String, DriverError> {
        if self.server_id.is_empty() {
            return Ok(self.base.ip_address.clone());
        }
        let snapshot = self.fetch_instance().await?;
        Ok(snapshot
            .and_then(|server| server.public_ip)
            .unwrap_or_else(|| self.base.ip_address.clone()))
    }
}

fn non_empty(options: &DriverOptions, name: &str, default: &str) -> String {
    options
        .string(name)
        .filter(|value| !value.is_empty())
        .unwrap_or(default)
        .to_owned()
}

impl Driver for ScalewayDriver {
    fn driver_name(&self) -> DriverFuture<'_, String> {
        Box::pin(async { Ok(DRIVER_NAME.to_owned()) })
    }

    fn machine_name(&self) -> DriverFuture<'_, String> {
        Box::pin(async move { Ok(self.base.machine_name.clone()) })
    }

    fn create_flags(&self) -> DriverFuture<'_, Vec<FlagDescriptor>> {
        Box::pin(async {
            Ok(vec![
                FlagDescriptor::string(SECRET_KEY_FLAG, "Scaleway API secret key", "")
                    .with_env("SCW_SECRET_KEY"),
                FlagDescriptor::string(PROJECT_FLAG, "Scaleway project identifier", "")
                    .with_env("SCW_DEFAULT_PROJECT_ID"),
                FlagDescriptor::string(ORGANIZATION_FLAG, "Scaleway organisation identifier", "")
                    .with_env("SCW_DEFAULT_ORGANIZATION_ID"),
                FlagDescriptor::string(ZONE_FLAG, "Availability zone", DEFAULT_ZONE)
                    .with_env("SCW_DEFAULT_ZONE"),
                FlagDescriptor::string(
                    INSTANCE_TYPE_FLAG,
                    "Commercial instance type",
                    DEFAULT_INSTANCE_TYPE,
                ),
                FlagDescriptor::string(IMAGE_FLAG, "Image label", DEFAULT_IMAGE),
                FlagDescriptor::string(ARCH_FLAG, "Image architecture", DEFAULT_ARCH),
                FlagDescriptor::string(SSH_USER_FLAG, "SSH user", DEFAULT_SSH_USER),
            ])
        })
    }

    fn configure<'a>(&'a mut self, options: &'a DriverOptions) -> DriverFuture<'a, ()> {
        Box::pin(async move { self.apply(options) })
    }

    fn pre_create_check(&self) -> DriverFuture<'_, ()> {
        Box::pin(async move {
            self.resolve_image_id()
                .await
                .map(|image_id| {
                    info!(image = %self.image, id = %image_id, zone = %self.zone, "resolved image");
                })
                .map_err(|err| DriverError::PrecreateFailed {
                    message: err.to_string(),
                })
        })
    }

    fn create(&mut self) -> DriverFuture<'_, ()> {
        Box::pin(async move {
            let Err(err) = self.provision_server().await else {
                return Ok(());
            };
            let residual = self.release_after_failure().await;
            let message = residual.map_or_else(|| err.to_string(), |left| format!("{err}; {left}"));
            Err(DriverError::CreateFailed { message })
        })
    }

    fn state(&self) -> DriverFuture<'_, MachineState> {
        Box::pin(self.current_state())
    }

    fn start(&mut self) -> DriverFuture<'_, ()> {
        Box::pin(self.perform("poweron"))
    }

    fn stop(&mut self) -> DriverFuture<'_, ()> {
        Box::pin(self.perform("poweroff"))
    }

    fn restart(&mut self) -> DriverFuture<'_, ()> {
        Box::pin(self.perform("reboot"))
    }

    fn kill(&mut self) -> DriverFuture<'_, ()> {
        Box::pin(self.perform("stop_in_place"))
    }

    fn remove(&mut self) -> DriverFuture<'_, ()> {
        Box::pin(async move {
            self.release().await?;
            self.server_id.clear();
            Ok(())
        })
    }

    fn ip(&self) -> DriverFuture<'_, String> {
        Box::pin(self.current_ip())
    }

    fn ssh_hostname(&self) -> DriverFuture<'_, String> {
        Box::pin(self.current_ip())
    }

    fn ssh_port(&self) -> DriverFuture<'_, u16> {
        Box::pin(async move { Ok(self.base.ssh_port()) })
    }

    fn ssh_username(&self) -> DriverFuture<'_, String> {
        Box::pin(async move { Ok(self.base.ssh_user()) })
    }

    fn ssh_key_path(&self) -> DriverFuture<'_, String> {
        Box::pin(async move { Ok(self.base.ssh_key_path.clone()) })
    }

    fn url(&self) -> DriverFuture<'_, String> {
        Box::pin(async move {
            let state = self.current_state().await?;
            if state != MachineState::Running {
                return Err(DriverError::NotRunning {
                    message: format!("{} is {state}", self.base.machine_name),
                });
            }
            let ip = self.current_ip().await?;
            Ok(format!("tcp://{ip}:{DEFAULT_ENGINE_PORT}"))
        })
    }

    fn config_raw(&self) -> DriverFuture<'_, Vec<u8>> {
        Box::pin(async move { encode_config(self) })
    }

    fn set_config_raw<'a>(&'a mut self, raw: &'a [u8]) -> DriverFuture<'a, ()> {
        Box::pin(async move {
            let timing = self.timing;
            *self = decode_config::<Self>(raw)?.with_timing(timing);
            Ok(())
        })
    }
}
