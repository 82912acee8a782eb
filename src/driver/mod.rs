//! Driver contract implemented by every infrastructure back-end.
//!
//! A driver knows how to create and control machines on one kind of
//! infrastructure. The controller never links driver code directly: it
//! talks to [`Driver`] trait objects that are either in-process drivers from
//! the built-in registry or RPC clients speaking to a plugin child process.

mod base;
mod error;
mod flags;
pub mod generic;
pub mod none;
mod state;
mod unavailable;

use std::future::Future;
use std::pin::Pin;

use camino::Utf8Path;
use serde::Serialize;
use serde::de::DeserializeOwned;

pub use base::{BaseDriver, DEFAULT_ENGINE_PORT, DEFAULT_SSH_PORT, DEFAULT_SSH_USER};
pub use error::DriverError;
pub use flags::{DriverOptions, FlagDescriptor, FlagValue, group_flag_args};
pub use generic::GenericDriver;
pub use none::NoneDriver;
pub use state::MachineState;
pub use unavailable::UnavailableDriver;

use crate::scaleway::ScalewayDriver;

/// Boxed future returned by [`Driver`] operations.
pub type DriverFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, DriverError>> + Send + 'a>>;

/// Capability set every driver variant exposes.
pub trait Driver: Send + Sync {
    /// Returns the static driver name.
    fn driver_name(&self) -> DriverFuture<'_, String>;

    /// Returns the machine name.
    fn machine_name(&self) -> DriverFuture<'_, String>;

    /// Returns the configurable parameters for this driver. The result is the
    /// same across calls.
    fn create_flags(&self) -> DriverFuture<'_, Vec<FlagDescriptor>>;

    /// Applies resolved flag values to the driver state.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::ConfigInvalid`] for absent or inconsistent
    /// values and [`DriverError::CredentialsMissing`] when an auth-bearing
    /// driver has no usable credentials.
    fn configure<'a>(&'a mut self, options: &'a DriverOptions) -> DriverFuture<'a, ()>;

    /// Read-only validation against the infrastructure.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::PrecreateFailed`] when validation fails.
    fn pre_create_check(&self) -> DriverFuture<'_, ()>;

    /// Allocates infrastructure and returns once SSH is reachable.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::CreateFailed`] after releasing any partially
    /// allocated resources.
    fn create(&mut self) -> DriverFuture<'_, ()>;

    /// Queries the remote lifecycle state.
    fn state(&self) -> DriverFuture<'_, MachineState>;

    /// Powers the machine on.
    fn start(&mut self) -> DriverFuture<'_, ()>;

    /// Powers the machine off gracefully.
    fn stop(&mut self) -> DriverFuture<'_, ()>;

    /// Reboots the machine.
    fn restart(&mut self) -> DriverFuture<'_, ()>;

    /// Forcibly powers the machine off.
    fn kill(&mut self) -> DriverFuture<'_, ()>;

    /// Releases the infrastructure. Already-gone resources count as success.
    fn remove(&mut self) -> DriverFuture<'_, ()>;

    /// Returns the machine IP address.
    fn ip(&self) -> DriverFuture<'_, String>;

    /// Returns the hostname used for SSH.
    fn ssh_hostname(&self) -> DriverFuture<'_, String>;

    /// Returns the SSH port.
    fn ssh_port(&self) -> DriverFuture<'_, u16>;

    /// Returns the SSH user.
    fn ssh_username(&self) -> DriverFuture<'_, String>;

    /// Returns the private key path used for SSH.
    fn ssh_key_path(&self) -> DriverFuture<'_, String>;

    /// Returns the container-runtime endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::NotRunning`] when the machine is not running.
    fn url(&self) -> DriverFuture<'_, String>;

    /// Serialises the driver state.
    fn config_raw(&self) -> DriverFuture<'_, Vec<u8>>;

    /// Replaces the driver state with a serialised snapshot.
    fn set_config_raw<'a>(&'a mut self, raw: &'a [u8]) -> DriverFuture<'a, ()>;

    /// Releases transport resources. In-process drivers have none.
    fn close(&mut self) -> DriverFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}

/// Names of the drivers compiled into this binary.
pub const BUILTIN_DRIVERS: [&str; 3] = [
    none::DRIVER_NAME,
    generic::DRIVER_NAME,
    crate::scaleway::DRIVER_NAME,
];

/// Instantiates a built-in driver by name.
#[must_use]
pub fn builtin_driver(
    driver_name: &str,
    machine_name: &str,
    store_path: &Utf8Path,
) -> Option<Box<dyn Driver>> {
    let driver: Box<dyn Driver> = match driver_name {
        none::DRIVER_NAME => Box::new(NoneDriver::new(machine_name, store_path)),
        generic::DRIVER_NAME => Box::new(GenericDriver::new(machine_name, store_path)),
        crate::scaleway::DRIVER_NAME => Box::new(ScalewayDriver::new(machine_name, store_path)),
        _ => return None,
    };
    Some(driver)
}

/// Serialises in-process driver state for [`Driver::config_raw`].
///
/// # Errors
///
/// Returns [`DriverError::Provider`] when serialisation fails.
pub fn encode_config<T: Serialize>(value: &T) -> Result<Vec<u8>, DriverError> {
    serde_json::to_vec(value)
        .map_err(|err| DriverError::provider(format!("failed to encode driver state: {err}")))
}

/// Deserialises in-process driver state for [`Driver::set_config_raw`].
///
/// # Errors
///
/// Returns [`DriverError::ConfigInvalid`] when the snapshot cannot be
/// decoded.
pub fn decode_config<T: DeserializeOwned>(raw: &[u8]) -> Result<T, DriverError> {
    serde_json::from_slice(raw)
        .map_err(|err| DriverError::config(format!("failed to decode driver state: {err}")))
}

/// Wraps a ready value in a [`DriverFuture`].
pub(crate) fn ready<'a, T: Send + 'a>(value: Result<T, DriverError>) -> DriverFuture<'a, T> {
    Box::pin(std::future::ready(value))
}
