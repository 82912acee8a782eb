//! Driver for an engine that already exists and needs no infrastructure.
//!
//! The machine is described by its URL alone. Lifecycle verbs cannot be
//! honoured and fail with [`DriverError::Unsupported`]; `remove` only
//! forgets the record.

use camino::Utf8Path;
use reqwest::Url;
use serde::{Deserialize, Serialize};

use super::{
    BaseDriver, Driver, DriverError, DriverFuture, DriverOptions, FlagDescriptor, MachineState,
    decode_config, encode_config, ready,
};

/// Registry name of the driver.
pub const DRIVER_NAME: &str = "none";

const URL_FLAG: &str = "url";

/// Driver for hosts reached through a pre-existing engine URL.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct NoneDriver {
    /// Shared driver attributes.
    #[serde(flatten)]
    pub base: BaseDriver,
    /// Engine URL, for example `tcp://1.2.3.4:2376`.
    #[serde(default)]
    pub url: String,
}

impl NoneDriver {
    /// Creates an unconfigured driver.
    #[must_use]
    pub fn new(machine_name: &str, store_path: &Utf8Path) -> Self {
        Self {
            base: BaseDriver::new(machine_name, store_path),
            url: String::new(),
        }
    }

    fn apply(&mut self, options: &DriverOptions) -> Result<(), DriverError> {
        let Some(raw) = options.string(URL_FLAG) else {
            return Err(DriverError::config(
                "--url option is required when no driver is selected",
            ));
        };
        let parsed = Url::parse(raw)
            .map_err(|err| DriverError::config(format!("invalid --url '{raw}': {err}")))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| DriverError::config(format!("--url '{raw}' has no host")))?;
        self.base.ip_address = host.to_owned();
        self.url = raw.to_owned();
        Ok(())
    }

    fn unsupported<'a, T: Send + 'a>(operation: &str) -> DriverFuture<'a, T> {
        ready(Err(DriverError::unsupported(DRIVER_NAME, operation)))
    }
}

impl Driver for NoneDriver {
    fn driver_name(&self) -> DriverFuture<'_, String> {
        ready(Ok(DRIVER_NAME.to_owned()))
    }

    fn machine_name(&self) -> DriverFuture<'_, String> {
        ready(Ok(self.base.machine_name.clone()))
    }

    fn create_flags(&self) -> DriverFuture<'_, Vec<FlagDescriptor>> {
        ready(Ok(vec![FlagDescriptor::string(
            URL_FLAG,
            "URL of host when no driver is selected",
            "",
        )]))
    }

    fn configure<'a>(&'a mut self, options: &'a DriverOptions) -> DriverFuture<'a, ()> {
        ready(self.apply(options))
    }

    fn pre_create_check(&self) -> DriverFuture<'_, ()> {
        ready(Ok(()))
    }

    fn create(&mut self) -> DriverFuture<'_, ()> {
        ready(Ok(()))
    }

    fn state(&self) -> DriverFuture<'_, MachineState> {
        ready(Ok(MachineState::Running))
    }

    fn start(&mut self) -> DriverFuture<'_, ()> {
        Self::unsupported("start")
    }

    fn stop(&mut self) -> DriverFuture<'_, ()> {
        Self::unsupported("stop")
    }

    fn restart(&mut self) -> DriverFuture<'_, ()> {
        Self::unsupported("restart")
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
        Self::unsupported("ssh-hostname")
    }

    fn ssh_port(&self) -> DriverFuture<'_, u16> {
        Self::unsupported("ssh-port")
    }

    fn ssh_username(&self) -> DriverFuture<'_, String> {
        Self::unsupported("ssh-username")
    }

    fn ssh_key_path(&self) -> DriverFuture<'_, String> {
        Self::unsupported("ssh-key-path")
    }

    fn url(&self) -> DriverFuture<'_, String> {
        ready(Ok(self.url.clone()))
    }

    fn config_raw(&self) -> DriverFuture<'_, Vec<u8>> {
        ready(encode_config(self))
    }

    fn set_config_raw<'a>(&'a mut self, raw: &'a [u8]) -> DriverFuture<'a, ()> {
        ready(decode_config(raw).map(|decoded| *self = decoded))
    }
}
