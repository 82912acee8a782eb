//! Placeholder for hosts whose driver cannot be loaded.

use super::{Driver, DriverError, DriverFuture, DriverOptions, FlagDescriptor, MachineState, ready};

/// Stands in for a driver whose plugin could not be launched.
///
/// Identity queries answer from the persisted record and the raw state is
/// preserved verbatim, so the host can still be listed, saved, and removed
/// from the store. Every other operation fails with
/// [`DriverError::PluginUnreachable`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UnavailableDriver {
    driver_name: String,
    machine_name: String,
    raw: Vec<u8>,
    reason: String,
}

impl UnavailableDriver {
    /// Creates a placeholder recording why the real driver is unavailable.
    #[must_use]
    pub fn new(driver_name: &str, machine_name: &str, reason: impl Into<String>) -> Self {
        Self {
            driver_name: driver_name.to_owned(),
            machine_name: machine_name.to_owned(),
            raw: Vec::new(),
            reason: reason.into(),
        }
    }

    fn fail<'a, T: Send + 'a>(&self) -> DriverFuture<'a, T> {
        ready(Err(DriverError::PluginUnreachable {
            message: format!(
                "driver \"{}\" could not be loaded: {}",
                self.driver_name, self.reason
            ),
        }))
    }
}

impl Driver for UnavailableDriver {
    fn driver_name(&self) -> DriverFuture<'_, String> {
        ready(Ok(self.driver_name.clone()))
    }

    fn machine_name(&self) -> DriverFuture<'_, String> {
        ready(Ok(self.machine_name.clone()))
    }

    fn create_flags(&self) -> DriverFuture<'_, Vec<FlagDescriptor>> {
        self.fail()
    }

    fn configure<'a>(&'a mut self, _options: &'a DriverOptions) -> DriverFuture<'a, ()> {
        self.fail()
    }

    fn pre_create_check(&self) -> DriverFuture<'_, ()> {
        self.fail()
    }

    fn create(&mut self) -> DriverFuture<'_, ()> {
        self.fail()
    }

    fn state(&self) -> DriverFuture<'_, MachineState> {
        self.fail()
    }

    fn start(&mut self) -> DriverFuture<'_, ()> {
        self.fail()
    }

    fn stop(&mut self) -> DriverFuture<'_, ()> {
        self.fail()
    }

    fn restart(&mut self) -> DriverFuture<'_, ()> {
        self.fail()
    }

    fn kill(&mut self) -> DriverFuture<'_, ()> {
        self.fail()
    }

    fn remove(&mut self) -> DriverFuture<'_, ()> {
        self.fail()
    }

    fn ip(&self) -> DriverFuture<'_, String> {
        self.fail()
    }

    fn ssh_hostname(&self) -> DriverFuture<'_, String> {
        self.fail()
    }

    fn ssh_port(&self) -> DriverFuture<'_, u16> {
        self.fail()
    }

    fn ssh_username(&self) -> DriverFuture<'_, String> {
        self.fail()
    }

    fn ssh_key_path(&self) -> DriverFuture<'_, String> {
        self.fail()
    }

    fn url(&self) -> DriverFuture<'_, String> {
        self.fail()
    }

    fn config_raw(&self) -> DriverFuture<'_, Vec<u8>> {
        ready(Ok(self.raw.clone()))
    }

    fn set_config_raw<'a>(&'a mut self, raw: &'a [u8]) -> DriverFuture<'a, ()> {
        self.raw = raw.to_vec();
        ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[tokio::test]
    async fn preserves_raw_state_and_fails_operations() {
        let mut driver = UnavailableDriver::new("openstack", "db-1", "plugin exited");
        driver
            .set_config_raw(br#"{"tenant":"x"}"#)
            .await
            .unwrap_or_else(|err| panic!("set raw: {err}"));

        assert_eq!(driver.config_raw().await, Ok(br#"{"tenant":"x"}"#.to_vec()));
        assert_eq!(driver.driver_name().await, Ok(String::from("openstack")));
        let Err(err) = driver.state().await else {
            panic!("state should fail");
        };
        assert_eq!(err.kind(), ErrorKind::PluginUnreachable);
        assert!(err.to_string().contains("plugin exited"), "{err}");
    }
}
