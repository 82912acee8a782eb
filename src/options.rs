//! Authentication, container-runtime and cluster options carried by every
//! host.

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::cert::CertPaths;
use crate::driver::DEFAULT_ENGINE_PORT;

/// Directory the runtime reads its TLS material from on the remote host.
pub const REMOTE_DOCKER_DIR: &str = "/etc/docker";

/// Drop-in unit written on systemd hosts.
pub const REMOTE_UNIT_PATH: &str = "/etc/systemd/system/docker.service.d/10-machine.conf";

/// Install script used when none is configured.
pub const DEFAULT_INSTALL_URL: &str = "https://get.docker.com";

/// Address a cluster manager listens on unless told otherwise.
pub const DEFAULT_SWARM_HOST: &str = "tcp://0.0.0.0:3376";

/// Cluster agent image.
pub const DEFAULT_SWARM_IMAGE: &str = "swarm:latest";

/// Scheduling strategy of a cluster manager.
pub const DEFAULT_SWARM_STRATEGY: &str = "spread";

/// Locations of the certificate material for one host.
///
/// Local paths point into the installation's `certs/` directory and the
/// host's machine directory; remote paths depend only on the runtime's
/// layout.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthOptions {
    /// Directory holding the host's own certificate files.
    pub store_path: Utf8PathBuf,
    /// CA certificate.
    pub ca_cert_path: Utf8PathBuf,
    /// CA private key.
    pub ca_key_path: Utf8PathBuf,
    /// Operator client certificate.
    pub client_cert_path: Utf8PathBuf,
    /// Operator client key.
    pub client_key_path: Utf8PathBuf,
    /// Server certificate minted for this host.
    pub server_cert_path: Utf8PathBuf,
    /// Server key minted for this host.
    pub server_key_path: Utf8PathBuf,
    /// Remote CA certificate.
    pub ca_cert_remote_path: String,
    /// Remote server certificate.
    pub server_cert_remote_path: String,
    /// Remote server key.
    pub server_key_remote_path: String,
    /// Extra subject alternative names for the server certificate.
    pub server_cert_sans: Vec<String>,
}

impl AuthOptions {
    /// Lays out the options for a host whose files live in `machine_dir`.
    #[must_use]
    pub fn for_machine(certs: &CertPaths, machine_dir: &Utf8Path) -> Self {
        Self {
            store_path: machine_dir.to_path_buf(),
            ca_cert_path: certs.ca_cert.clone(),
            ca_key_path: certs.ca_key.clone(),
            client_cert_path: certs.client_cert.clone(),
            client_key_path: certs.client_key.clone(),
            server_cert_path: machine_dir.join("server.pem"),
            server_key_path: machine_dir.join("server-key.pem"),
            ca_cert_remote_path: format!("{REMOTE_DOCKER_DIR}/ca.pem"),
            server_cert_remote_path: format!("{REMOTE_DOCKER_DIR}/server.pem"),
            server_key_remote_path: format!("{REMOTE_DOCKER_DIR}/server-key.pem"),
            server_cert_sans: Vec::new(),
        }
    }

    /// Returns the installation-wide certificate paths these options use.
    #[must_use]
    pub fn cert_paths(&self) -> CertPaths {
        CertPaths {
            ca_cert: self.ca_cert_path.clone(),
            ca_key: self.ca_key_path.clone(),
            client_cert: self.client_cert_path.clone(),
            client_key: self.client_key_path.clone(),
        }
    }
}

/// Container-runtime configuration.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineOptions {
    /// Script fetched to install the runtime.
    pub install_url: String,
    /// `KEY=value` environment entries for the daemon.
    pub env: Vec<String>,
    /// Daemon labels.
    pub labels: Vec<String>,
    /// Whether clients must present a certificate.
    pub tls_verify: bool,
    /// Registries reachable without TLS.
    pub insecure_registry: Vec<String>,
    /// Registry mirrors.
    pub registry_mirror: Vec<String>,
    /// Storage driver chosen by the user; empty lets the provisioner decide.
    pub storage_driver: String,
    /// Extra daemon flags without their leading dashes.
    pub arbitrary_flags: Vec<String>,
    /// TLS port.
    pub tls_port: u16,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            install_url: String::from(DEFAULT_INSTALL_URL),
            env: Vec::new(),
            labels: Vec::new(),
            tls_verify: true,
            insecure_registry: Vec::new(),
            registry_mirror: Vec::new(),
            storage_driver: String::new(),
            arbitrary_flags: Vec::new(),
            tls_port: DEFAULT_ENGINE_PORT,
        }
    }
}

/// Cluster membership of a host.
///
/// New hosts are created outside any cluster; the settings are recorded
/// so that records written by cluster-aware releases keep their values.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwarmOptions {
    /// Whether the host takes part in a cluster.
    pub is_swarm: bool,
    /// Whether the host manages the cluster.
    pub master: bool,
    /// Discovery URL of the cluster.
    pub discovery: String,
    /// Manager listen address.
    pub host: String,
    /// Agent image.
    pub image: String,
    /// Scheduling strategy.
    pub strategy: String,
    /// `KEY=value` environment entries for the agent.
    pub env: Vec<String>,
}

impl Default for SwarmOptions {
    fn default() -> Self {
        Self {
            is_swarm: false,
            master: false,
            discovery: String::new(),
            host: String::from(DEFAULT_SWARM_HOST),
            image: String::from(DEFAULT_SWARM_IMAGE),
            strategy: String::from(DEFAULT_SWARM_STRATEGY),
            env: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_paths_do_not_depend_on_the_machine() {
        let certs = CertPaths::in_dir(Utf8Path::new("/home/u/.machina/certs"));
        let first = AuthOptions::for_machine(&certs, Utf8Path::new("/m/one"));
        let second = AuthOptions::for_machine(&certs, Utf8Path::new("/m/two"));
        assert_eq!(first.ca_cert_remote_path, second.ca_cert_remote_path);
        assert_eq!(first.server_key_remote_path, "/etc/docker/server-key.pem");
        assert_eq!(first.server_cert_path, Utf8Path::new("/m/one/server.pem"));
        assert_eq!(first.cert_paths(), certs);
    }

    #[test]
    fn engine_defaults_decode_from_empty_objects() {
        let options: EngineOptions =
            serde_json::from_str("{}").unwrap_or_else(|err| panic!("decode: {err}"));
        assert_eq!(options, EngineOptions::default());
        assert!(options.tls_verify);
        assert_eq!(options.tls_port, 2376);
    }

    #[test]
    fn swarm_defaults_fill_partial_objects() {
        let options: SwarmOptions = serde_json::from_str(r#"{"discovery": "token://abc"}"#)
            .unwrap_or_else(|err| panic!("decode: {err}"));
        assert!(!options.is_swarm);
        assert_eq!(options.discovery, "token://abc");
        assert_eq!(options.host, "tcp://0.0.0.0:3376");
        assert_eq!(options.image, "swarm:latest");
        assert_eq!(options.strategy, "spread");
    }
}
