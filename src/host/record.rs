//! Persisted form of a host and its forward migrations.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::HostError;
use crate::driver::DEFAULT_ENGINE_PORT;
use crate::options::{
    AuthOptions, DEFAULT_INSTALL_URL, EngineOptions, REMOTE_DOCKER_DIR, SwarmOptions,
};

/// Record layout written by this release.
pub const CONFIG_VERSION: u32 = 3;

/// What `config.json` holds for one host.
///
/// `driver` is the driver's own snapshot, stored verbatim so a driver that
/// is not available in this build still round-trips untouched.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HostRecord {
    /// Layout version; absent in the oldest records.
    #[serde(default)]
    pub config_version: u32,
    /// Host name.
    pub name: String,
    /// Registry key of the driver.
    pub driver_name: String,
    /// Opaque driver snapshot.
    #[serde(default)]
    pub driver: Value,
    /// Certificate locations.
    #[serde(default)]
    pub auth_options: AuthOptions,
    /// Container-runtime options.
    #[serde(default)]
    pub engine_options: EngineOptions,
    /// Cluster membership.
    #[serde(default)]
    pub swarm_options: SwarmOptions,
}

impl HostRecord {
    /// Decodes a stored record, migrating older layouts to
    /// [`CONFIG_VERSION`].
    ///
    /// # Errors
    ///
    /// Returns [`HostError::Record`] when the bytes are not a record or were
    /// written by a newer release.
    pub fn decode(bytes: &[u8]) -> Result<Self, HostError> {
        let value: Value = serde_json::from_slice(bytes).map_err(|err| HostError::record(&err))?;
        let version = value
            .get("config_version")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        if version > u64::from(CONFIG_VERSION) {
            return Err(HostError::Record {
                message: format!(
                    "record version {version} is newer than the supported version {CONFIG_VERSION}"
                ),
            });
        }
        let mut record: Self = serde_json::from_value(value).map_err(|err| HostError::record(&err))?;
        record.migrate();
        Ok(record)
    }

    /// Encodes the record as pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::Record`] when serialisation fails.
    pub fn encode(&self) -> Result<Vec<u8>, HostError> {
        serde_json::to_vec_pretty(self).map_err(|err| HostError::record(&err))
    }

    fn migrate(&mut self) {
        if self.config_version < 2 {
            // Before version 2 the remote layout was implied, not stored.
            let auth = &mut self.auth_options;
            for (field, file) in [
                (&mut auth.ca_cert_remote_path, "ca.pem"),
                (&mut auth.server_cert_remote_path, "server.pem"),
                (&mut auth.server_key_remote_path, "server-key.pem"),
            ] {
                if field.is_empty() {
                    *field = format!("{REMOTE_DOCKER_DIR}/{file}");
                }
            }
        }
        if self.config_version < 3 {
            let engine = &mut self.engine_options;
            if engine.install_url.is_empty() {
                engine.install_url = DEFAULT_INSTALL_URL.to_owned();
            }
            if engine.tls_port == 0 {
                engine.tls_port = DEFAULT_ENGINE_PORT;
            }
        }
        self.config_version = CONFIG_VERSION;
    }
}
