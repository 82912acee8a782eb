//! Attributes shared by every concrete driver.

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

/// Default SSH user for freshly created machines.
pub const DEFAULT_SSH_USER: &str = "root";

/// Default SSH port.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Default TLS port of the container runtime.
pub const DEFAULT_ENGINE_PORT: u16 = 2376;

/// Common driver state embedded by concrete drivers.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BaseDriver {
    /// Machine name.
    pub machine_name: String,
    /// Installation base directory.
    pub store_path: Utf8PathBuf,
    /// Last known IP address.
    pub ip_address: String,
    /// SSH user.
    pub ssh_user: String,
    /// SSH port.
    pub ssh_port: u16,
    /// Private key used to reach the machine.
    pub ssh_key_path: String,
}

impl BaseDriver {
    /// Creates the shared state for `machine_name` under `store_path`.
    #[must_use]
    pub fn new(machine_name: &str, store_path: &Utf8Path) -> Self {
        Self {
            machine_name: machine_name.to_owned(),
            store_path: store_path.to_path_buf(),
            ip_address: String::new(),
            ssh_user: DEFAULT_SSH_USER.to_owned(),
            ssh_port: DEFAULT_SSH_PORT,
            ssh_key_path: String::new(),
        }
    }

    /// Returns the per-machine directory inside the store.
    #[must_use]
    pub fn machine_dir(&self) -> Utf8PathBuf {
        self.store_path.join("machines").join(&self.machine_name)
    }

    /// Resolves `file` inside the per-machine directory.
    #[must_use]
    pub fn resolve_store_path(&self, file: &str) -> Utf8PathBuf {
        self.machine_dir().join(file)
    }

    /// Returns the SSH user, falling back to [`DEFAULT_SSH_USER`].
    #[must_use]
    pub fn ssh_user(&self) -> String {
        if self.ssh_user.is_empty() {
            DEFAULT_SSH_USER.to_owned()
        } else {
            self.ssh_user.clone()
        }
    }

    /// Returns the SSH port, falling back to [`DEFAULT_SSH_PORT`].
    #[must_use]
    pub const fn ssh_port(&self) -> u16 {
        if self.ssh_port == 0 {
            DEFAULT_SSH_PORT
        } else {
            self.ssh_port
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_resolve_under_the_machine_directory() {
        let base = BaseDriver::new("web-1", Utf8Path::new("/var/lib/machina"));
        assert_eq!(
            base.resolve_store_path("id_rsa"),
            Utf8PathBuf::from("/var/lib/machina/machines/web-1/id_rsa")
        );
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let base: BaseDriver = serde_json::from_str(r#"{"machine_name":"m"}"#)
            .unwrap_or_else(|err| panic!("decode: {err}"));
        assert_eq!(base.ssh_user(), "root");
        assert_eq!(base.ssh_port(), 22);
    }
}
