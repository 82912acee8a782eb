//! How the controller obtains driver handles.

use camino::{Utf8Path, Utf8PathBuf};
use tracing::debug;

use crate::driver::{BUILTIN_DRIVERS, Driver, DriverError, DriverFuture, builtin_driver};
use crate::plugin::{ClientOptions, PluginLauncher, RpcClientDriver};
use crate::store;

/// Produces driver handles by registry name.
pub trait DriverFactory: Send + Sync {
    /// Opens a driver named `driver_name` for machine `machine_name`.
    fn open<'a>(
        &'a self,
        driver_name: &'a str,
        machine_name: &'a str,
    ) -> DriverFuture<'a, Box<dyn Driver>>;

    /// Returns where driver output for `machine_name` is recorded, if
    /// anywhere.
    fn log_path(&self, _machine_name: &str) -> Option<Utf8PathBuf> {
        None
    }
}

fn unknown_driver(driver_name: &str) -> DriverError {
    DriverError::config(format!(
        "driver \"{driver_name}\" not found; available drivers: {}",
        BUILTIN_DRIVERS.join(", ")
    ))
}

/// Runs every driver in a child plugin process of this executable.
#[derive(Clone, Debug)]
pub struct PluginFactory {
    launcher: PluginLauncher,
    root: Utf8PathBuf,
    client: ClientOptions,
}

impl PluginFactory {
    /// Launches plugins with `launcher` for an installation rooted at `root`.
    #[must_use]
    pub fn new(launcher: PluginLauncher, root: impl Into<Utf8PathBuf>) -> Self {
        Self {
            launcher,
            root: root.into(),
            client: ClientOptions::default(),
        }
    }

    /// Overrides the connection tuning.
    #[must_use]
    pub fn with_client_options(mut self, client: ClientOptions) -> Self {
        self.client = client;
        self
    }
}

impl DriverFactory for PluginFactory {
    fn open<'a>(
        &'a self,
        driver_name: &'a str,
        machine_name: &'a str,
    ) -> DriverFuture<'a, Box<dyn Driver>> {
        Box::pin(async move {
            if !BUILTIN_DRIVERS.contains(&driver_name) {
                return Err(unknown_driver(driver_name));
            }
            let (address, process) = self
                .launcher
                .launch(driver_name, machine_name, self.log_path(machine_name))
                .await?;
            let options = ClientOptions {
                machine_name: machine_name.to_owned(),
                ..self.client.clone()
            };
            let driver = RpcClientDriver::connect(address, options).await?;
            debug!(
                driver = driver_name,
                machine = machine_name,
                service = driver.service(),
                "driver plugin connected"
            );
            let boxed: Box<dyn Driver> = Box::new(driver.with_process(process));
            Ok(boxed)
        })
    }

    fn log_path(&self, machine_name: &str) -> Option<Utf8PathBuf> {
        Some(store::driver_log(&self.root, machine_name))
    }
}

/// Runs drivers inside the calling process.
#[derive(Clone, Debug)]
pub struct InProcessFactory {
    root: Utf8PathBuf,
}

impl InProcessFactory {
    /// Opens drivers for an installation rooted at `root`.
    #[must_use]
    pub fn new(root: &Utf8Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }
}

impl DriverFactory for InProcessFactory {
    fn open<'a>(
        &'a self,
        driver_name: &'a str,
        machine_name: &'a str,
    ) -> DriverFuture<'a, Box<dyn Driver>> {
        let driver = builtin_driver(driver_name, machine_name, &self.root)
            .ok_or_else(|| unknown_driver(driver_name));
        Box::pin(std::future::ready(driver))
    }
}
