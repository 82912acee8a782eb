//! Driver for an existing server reachable over SSH.
//!
//! No infrastructure is allocated. `create` copies the operator's key into
//! the machine directory and waits for the SSH port, `state` dials that port,
//! and `restart` reboots over SSH. Power management is unavailable.

use std::time::Duration;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tracing::{debug, info};

use super::{
    BaseDriver, DEFAULT_ENGINE_PORT, DEFAULT_SSH_PORT, DEFAULT_SSH_USER, Driver, DriverError,
    DriverFuture, DriverOptions, FlagDescriptor, MachineState, decode_config, encode_config, ready,
};
use crate::ssh::{ExternalSshClient, SshClient, SshTarget};

/// Registry name of the driver.
pub const DRIVER_NAME: &str = "generic";

const IP_FLAG: &str = "generic-ip-address";
const USER_FLAG: &str = "generic-ssh-user";
const KEY_FLAG: &str = "generic-ssh-key";
const PORT_FLAG: &str = "generic-ssh-port";
const ENGINE_PORT_FLAG: &str = "generic-engine-port";

const DIAL_TIMEOUT: Duration = Duration::from_secs(15);
const CREATE_POLL_INTERVAL: Duration = Duration::from_secs(3);
const CREATE_ATTEMPTS: u32 = 20;

/// Driver for pre-existing servers.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct GenericDriver {
    /// Shared driver attributes.
    #[serde(flatten)]
    pub base: BaseDriver,
    /// Engine TLS port.
    #[serde(default)]
    pub engine_port: u16,
    /// Operator-supplied key, copied into the store on create.
    #[serde(default)]
    pub source_key_path: String,
}

impl GenericDriver {
    /// Creates an unconfigured driver.
    #[must_use]
    pub fn new(machine_name: &str, store_path: &Utf8Path) -> Self {
        Self {
            base: BaseDriver::new(machine_name, store_path),
            engine_port: DEFAULT_ENGINE_PORT,
            source_key_path: String::new(),
        }
    }

    fn apply(&mut self, options: &DriverOptions) -> Result<(), DriverError> {
        let ip = options.string(IP_FLAG).ok_or_else(|| {
            DriverError::config(format!("generic driver requires the --{IP_FLAG} option"))
        })?;
        self.base.ip_address = ip.to_owned();
        self.base.ssh_user = options
            .string(USER_FLAG)
            .unwrap_or(DEFAULT_SSH_USER)
            .to_owned();
        self.base.ssh_port = port_option(options, PORT_FLAG, DEFAULT_SSH_PORT)?;
        self.engine_port = port_option(options, ENGINE_PORT_FLAG, DEFAULT_ENGINE_PORT)?;
        self.source_key_path = options.string(KEY_FLAG).unwrap_or_default().to_owned();
        Ok(())
    }

    async fn dial(&self, limit: Duration) -> bool {
        let addr = (self.base.ip_address.as_str(), self.base.ssh_port());
        matches!(timeout(limit, TcpStream::connect(addr)).await, Ok(Ok(_)))
    }

    async fn import_key(&mut self) -> Result<(), DriverError> {
        if self.source_key_path.is_empty() {
            return Ok(());
        }
        let target = self.base.resolve_store_path("id_rsa");
        tokio::fs::create_dir_all(self.base.machine_dir())
            .await
            .map_err(|err| DriverError::CreateFailed {
                message: format!("failed to create {}: {err}", self.base.machine_dir()),
            })?;
        tokio::fs::copy(&self.source_key_path, &target)
            .await
            .map_err(|err| DriverError::CreateFailed {
                message: format!("failed to copy SSH key {}: {err}", self.source_key_path),
            })?;
        self.base.ssh_key_path = target.into_string();
        Ok(())
    }

    async fn wait_for_ssh_port(&self) -> Result<(), DriverError> {
        for attempt in 1..=CREATE_ATTEMPTS {
            if self.dial(DIAL_TIMEOUT).await {
                return Ok(());
            }
            debug!(attempt, machine = %self.base.machine_name, "SSH port not reachable yet");
            sleep(CREATE_POLL_INTERVAL).await;
        }
        Err(DriverError::CreateFailed {
            message: format!(
                "{}:{} never accepted SSH connections",
                self.base.ip_address,
                self.base.ssh_port()
            ),
        })
    }

    fn ssh_target(&self) -> SshTarget {
        SshTarget {
            host: self.base.ip_address.clone(),
            port: self.base.ssh_port(),
            user: self.base.ssh_user(),
            key_path: (!self.base.ssh_key_path.is_empty())
                .then(|| self.base.ssh_key_path.clone().into()),
        }
    }

    fn unsupported<'a, T: Send + 'a>(operation: &str) -> DriverFuture<'a, T> {
        ready(Err(DriverError::unsupported(DRIVER_NAME, operation)))
    }
}

fn port_option(options: &DriverOptions, name: &str, default: u16) -> Result<u16, DriverError> {
    options.int(name).map_or(Ok(default), |value| {
        u16::try_from(value)
            .map_err(|_| DriverError::config(format!("--{name} must be a TCP port, got {value}")))
    })
}

impl Driver for GenericDriver {
    fn driver_name(&self) -> DriverFuture<'_, String> {
        ready(Ok(DRIVER_NAME.to_owned()))
    }

    fn machine_name(&self) -> DriverFuture<'_, String> {
        ready(Ok(self.base.machine_name.clone()))
    }

    fn create_flags(&self) -> DriverFuture<'_, Vec<FlagDescriptor>> {
        ready(Ok(vec![
            FlagDescriptor::string(IP_FLAG, "IP address of the host", "")
                .with_env("GENERIC_IP_ADDRESS"),
            FlagDescriptor::string(USER_FLAG, "SSH user", DEFAULT_SSH_USER)
                .with_env("GENERIC_SSH_USER"),
            FlagDescriptor::string(KEY_FLAG, "SSH private key path", "")
                .with_env("GENERIC_SSH_KEY"),
            FlagDescriptor::int(PORT_FLAG, "SSH port", i64::from(DEFAULT_SSH_PORT))
                .with_env("GENERIC_SSH_PORT"),
            FlagDescriptor::int(
                ENGINE_PORT_FLAG,
                "Container runtime TLS port",
                i64::from(DEFAULT_ENGINE_PORT),
            )
            .with_env("GENERIC_ENGINE_PORT"),
        ]))
    }

    fn configure<'a>(&'a mut self, options: &'a DriverOptions) -> DriverFuture<'a, ()> {
        ready(self.apply(options))
    }

    fn pre_create_check(&self) -> DriverFuture<'_, ()> {
        Box::pin(async move {
            if self.source_key_path.is_empty() {
                return Ok(());
            }
            match tokio::fs::try_exists(&self.source_key_path).await {
                Ok(true) => Ok(()),
                Ok(false) => Err(DriverError::PrecreateFailed {
                    message: format!("SSH key {} does not exist", self.source_key_path),
                }),
                Err(err) => Err(DriverError::PrecreateFailed {
                    message: format!("cannot access SSH key {}: {err}", self.source_key_path),
                }),
            }
        })
    }

    fn create(&mut self) -> DriverFuture<'_, ()> {
        Box::pin(async move {
            info!(machine = %self.base.machine_name, ip = %self.base.ip_address, "importing existing host");
            self.import_key().await?;
            self.wait_for_ssh_port().await
        })
    }

    fn state(&self) -> DriverFuture<'_, MachineState> {
        Box::pin(async move {
            if self.dial(DIAL_TIMEOUT).await {
                Ok(MachineState::Running)
            } else {
                Ok(MachineState::Stopped)
            }
        })
    }

    fn start(&mut self) -> DriverFuture<'_, ()> {
        Self::unsupported("start")
    }

    fn stop(&mut self) -> DriverFuture<'_, ()> {
        Self::unsupported("stop")
    }

    fn restart(&mut self) -> DriverFuture<'_, ()> {
        Box::pin(async move {
            let client = ExternalSshClient::new(self.ssh_target());
            let output = client
                .output("sudo shutdown -r now")
                .await
                .map_err(|err| DriverError::provider(err.to_string()))?;
            // The session usually drops with 255 while the host goes down.
            if output.is_success() || output.code == Some(255) {
                Ok(())
            } else {
                Err(DriverError::provider(format!(
                    "reboot exited with {}: {}",
                    output.status_text(),
                    output.stderr.trim()
                )))
            }
        })
    }

    fn kill(&mut self) -> DriverFuture<'_, ()> {
        Self::unsupported("kill")
    }

    fn remove(&mut self) -> DriverFuture<'_, ()> {
        ready(Ok(()))
    }

    fn ip(&self) -> DriverFuture<'_, String> {
        ready(Ok(self.base.ip_address.clone()))
    }

    fn ssh_hostname(&self) -> DriverFuture<'_, String> {
        ready(Ok(self.base.ip_address.clone()))
    }

    fn ssh_port(&self) -> DriverFuture<'_, u16> {
        ready(Ok(self.base.ssh_port()))
    }

    fn ssh_username(&self) -> DriverFuture<'_, String> {
        ready(Ok(self.base.ssh_user()))
    }

    fn ssh_key_path(&self) -> DriverFuture<'_, String> {
        ready(Ok(self.base.ssh_key_path.clone()))
    }

    fn url(&self) -> DriverFuture<'_, String> {
        Box::pin(async move {
            if !self.dial(DIAL_TIMEOUT).await {
                return Err(DriverError::NotRunning {
                    message: format!("{} is not reachable", self.base.machine_name),
                });
            }
            Ok(format!("tcp://{}:{}", self.base.ip_address, self.engine_port))
        })
    }

    fn config_raw(&self) -> DriverFuture<'_, Vec<u8>> {
        ready(encode_config(self))
    }

    fn set_config_raw<'a>(&'a mut self, raw: &'a [u8]) -> DriverFuture<'a, ()> {
        ready(decode_config(raw).map(|decoded| *self = decoded))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::FlagValue;
    use crate::error::ErrorKind;
    use tokio::net::TcpListener;

    fn options(ip: &str, port: i64) -> DriverOptions {
        DriverOptions::new()
            .with(IP_FLAG, FlagValue::String(ip.to_owned()))
            .with(PORT_FLAG, FlagValue::Int(port))
    }

    #[tokio::test]
    async fn reachable_port_reports_running() {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap_or_else(|err| panic!("bind: {err}"));
        let port = listener
            .local_addr()
            .unwrap_or_else(|err| panic!("addr: {err}"))
            .port();

        let mut driver = GenericDriver::new("existing", Utf8Path::new("/tmp/store"));
        driver
            .configure(&options("127.0.0.1", i64::from(port)))
            .await
            .unwrap_or_else(|err| panic!("configure: {err}"));

        assert_eq!(driver.state().await, Ok(MachineState::Running));
        assert_eq!(driver.url().await, Ok(String::from("tcp://127.0.0.1:2376")));
        assert_eq!(driver.ssh_port().await, Ok(port));
    }

    #[tokio::test]
    async fn closed_port_reports_stopped_and_url_fails() {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap_or_else(|err| panic!("bind: {err}"));
        let port = listener
            .local_addr()
            .unwrap_or_else(|err| panic!("addr: {err}"))
            .port();
        drop(listener);

        let mut driver = GenericDriver::new("existing", Utf8Path::new("/tmp/store"));
        driver
            .configure(&options("127.0.0.1", i64::from(port)))
            .await
            .unwrap_or_else(|err| panic!("configure: {err}"));

        assert_eq!(driver.state().await, Ok(MachineState::Stopped));
        let Err(err) = driver.url().await else {
            panic!("url should require a running machine");
        };
        assert_eq!(err.kind(), ErrorKind::NotRunning);
    }

    #[tokio::test]
    async fn configure_rejects_out_of_range_ports() {
        let mut driver = GenericDriver::new("existing", Utf8Path::new("/tmp/store"));
        let Err(err) = driver.configure(&options("10.0.0.1", 70_000)).await else {
            panic!("port above 65535 should be rejected");
        };
        assert_eq!(err.kind(), ErrorKind::ConfigInvalid);
    }

    #[tokio::test]
    async fn missing_key_fails_the_pre_create_check() {
        let mut driver = GenericDriver::new("existing", Utf8Path::new("/tmp/store"));
        let opts = options("10.0.0.1", 22).with(
            KEY_FLAG,
            FlagValue::String(String::from("/nonexistent/machina/id_rsa")),
        );
        driver
            .configure(&opts)
            .await
            .unwrap_or_else(|err| panic!("configure: {err}"));

        let Err(err) = driver.pre_create_check().await else {
            panic!("missing key should fail the check");
        };
        assert_eq!(err.kind(), ErrorKind::PrecreateFailed);
    }

    #[tokio::test]
    async fn power_management_is_unsupported() {
        let mut driver = GenericDriver::new("existing", Utf8Path::new("/tmp/store"));
        let Err(err) = driver.stop().await else {
            panic!("stop should be unsupported");
        };
        assert_eq!(err.kind(), ErrorKind::UnsupportedForDriver);
    }
}
