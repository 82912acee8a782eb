//! Installation-wide configuration loaded via `ortho-config`.
//!
//! [`MachinaConfig`] merges defaults, `machina.toml` files and `MACHINA_*`
//! environment variables, then turns into the paths and tuning the
//! controller needs.

use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::cert::CertPaths;
use crate::controller::ControllerSettings;
use crate::error::ErrorKind;
use crate::options::DEFAULT_INSTALL_URL;
use crate::store;

/// Default installation directory before tilde expansion.
pub const DEFAULT_STORAGE_PATH: &str = "~/.machina";

/// Installation settings.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "MACHINA",
    discovery(
        app_name = "machina",
        env_var = "MACHINA_CONFIG_PATH",
        config_file_name = "machina.toml",
        dotfile_name = ".machina.toml",
        project_file_name = "machina.toml"
    )
)]
pub struct MachinaConfig {
    /// Base directory holding `machines/` and `certs/`. Supports a leading
    /// `~/`.
    #[ortho_config(default = DEFAULT_STORAGE_PATH.to_owned())]
    pub storage_path: String,
    /// CA certificate override; defaults to `certs/ca.pem`.
    pub tls_ca_cert: Option<String>,
    /// CA private key override; defaults to `certs/ca-key.pem`.
    pub tls_ca_key: Option<String>,
    /// Client certificate override; defaults to `certs/cert.pem`.
    pub tls_client_cert: Option<String>,
    /// Client key override; defaults to `certs/key.pem`.
    pub tls_client_key: Option<String>,
    /// Script used to install the container runtime on new hosts.
    #[ortho_config(default = DEFAULT_INSTALL_URL.to_owned())]
    pub install_url: String,
    /// Whether to use the in-process SSH client instead of `ssh`.
    #[ortho_config(default = false)]
    pub native_ssh: bool,
    /// Hosts a fan-out works on at once.
    #[ortho_config(default = 8)]
    pub fanout_limit: usize,
    /// Per-host deadline for `ls`, in seconds.
    #[ortho_config(default = 10)]
    pub list_timeout_secs: u64,
    /// Tracing filter directives; `MACHINA_LOG` takes precedence.
    pub log_filter: Option<String>,
}

/// Errors raised while loading or interpreting the configuration.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
    /// Raised when a field holds an unusable value.
    #[error("invalid {field}: {message}; set MACHINA_{env_suffix} or fix {field} in machina.toml", env_suffix = field.to_uppercase())]
    Invalid {
        /// Offending field.
        field: String,
        /// What is wrong with it.
        message: String,
    },
}

impl ConfigError {
    /// Returns the classification of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        ErrorKind::ConfigInvalid
    }

    fn invalid(field: &str, message: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.to_owned(),
            message: message.into(),
        }
    }
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}

impl Default for MachinaConfig {
    fn default() -> Self {
        Self {
            storage_path: DEFAULT_STORAGE_PATH.to_owned(),
            tls_ca_cert: None,
            tls_ca_key: None,
            tls_client_cert: None,
            tls_client_key: None,
            install_url: DEFAULT_INSTALL_URL.to_owned(),
            native_ssh: false,
            fanout_limit: crate::controller::DEFAULT_FANOUT_LIMIT,
            list_timeout_secs: crate::controller::DEFAULT_LIST_TIMEOUT.as_secs(),
            log_filter: None,
        }
    }
}

/// Expands a leading `~/` prefix to the user's home directory.
///
/// The input is returned unchanged when `HOME` is not set.
#[must_use]
pub fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return format!("{}/{rest}", home.to_string_lossy());
    }
    path.to_owned()
}

impl MachinaConfig {
    /// Loads configuration using defaults, configuration files and
    /// environment variables, ignoring the process arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when merging sources fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("machina")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Loads configuration using the default argument iterator.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when merging sources fails.
    pub fn load_from_sources() -> Result<Self, ConfigError> {
        Self::load().map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Rejects values no installation can work with.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.storage_path.trim().is_empty() {
            return Err(ConfigError::invalid("storage_path", "must not be empty"));
        }
        if self.install_url.trim().is_empty() {
            return Err(ConfigError::invalid("install_url", "must not be empty"));
        }
        if self.fanout_limit == 0 {
            return Err(ConfigError::invalid("fanout_limit", "must be at least 1"));
        }
        if self.list_timeout_secs == 0 {
            return Err(ConfigError::invalid("list_timeout_secs", "must be at least 1"));
        }
        let overrides = [
            ("tls_ca_cert", self.tls_ca_cert.as_deref()),
            ("tls_ca_key", self.tls_ca_key.as_deref()),
            ("tls_client_cert", self.tls_client_cert.as_deref()),
            ("tls_client_key", self.tls_client_key.as_deref()),
        ];
        if let Some((field, _)) = overrides
            .iter()
            .find(|(_, value)| value.is_some_and(|path| path.trim().is_empty()))
        {
            return Err(ConfigError::invalid(field, "must not be empty when set"));
        }
        Ok(())
    }

    /// Returns the installation directory with `~/` expanded.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when the path still starts with `~`
    /// because `HOME` is unset.
    pub fn storage_root(&self) -> Result<Utf8PathBuf, ConfigError> {
        let expanded = expand_tilde(self.storage_path.trim());
        if expanded.starts_with('~') {
            return Err(ConfigError::invalid(
                "storage_path",
                "cannot expand ~ because HOME is not set",
            ));
        }
        Ok(Utf8PathBuf::from(expanded))
    }

    /// Returns the certificate locations under `root`, with any configured
    /// overrides applied.
    #[must_use]
    pub fn cert_paths(&self, root: &Utf8Path) -> CertPaths {
        let defaults = CertPaths::in_dir(&store::certs_dir(root));
        let pick = |value: Option<&String>, fallback: Utf8PathBuf| {
            value.map_or(fallback, |path| Utf8PathBuf::from(expand_tilde(path)))
        };
        CertPaths {
            ca_cert: pick(self.tls_ca_cert.as_ref(), defaults.ca_cert),
            ca_key: pick(self.tls_ca_key.as_ref(), defaults.ca_key),
            client_cert: pick(self.tls_client_cert.as_ref(), defaults.client_cert),
            client_key: pick(self.tls_client_key.as_ref(), defaults.client_key),
        }
    }

    /// Builds controller tuning for an installation rooted at `root`.
    #[must_use]
    pub fn controller_settings(&self, root: &Utf8Path) -> ControllerSettings {
        let mut settings = ControllerSettings::new(root);
        settings.fanout_limit = self.fanout_limit.max(1);
        settings.list_timeout = Duration::from_secs(self.list_timeout_secs.max(1));
        settings.install_url.clone_from(&self.install_url);
        settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::EnvGuard;
    use rstest::rstest;

    #[test]
    fn defaults_match_the_documented_values() {
        let config = MachinaConfig::default();
        assert_eq!(config.storage_path, "~/.machina");
        assert_eq!(config.install_url, "https://get.docker.com");
        assert_eq!(config.fanout_limit, 8);
        assert_eq!(config.list_timeout_secs, 10);
        assert!(!config.native_ssh);
        assert!(config.validate().is_ok());
    }

    #[rstest]
    #[case::empty_storage(MachinaConfig { storage_path: String::from("  "), ..MachinaConfig::default() }, "storage_path")]
    #[case::zero_fanout(MachinaConfig { fanout_limit: 0, ..MachinaConfig::default() }, "fanout_limit")]
    #[case::zero_timeout(MachinaConfig { list_timeout_secs: 0, ..MachinaConfig::default() }, "list_timeout_secs")]
    #[case::blank_override(MachinaConfig { tls_client_key: Some(String::new()), ..MachinaConfig::default() }, "tls_client_key")]
    fn validate_names_the_offending_field(#[case] config: MachinaConfig, #[case] field: &str) {
        let Err(err) = config.validate() else {
            panic!("{field} should be rejected");
        };
        assert!(
            matches!(&err, ConfigError::Invalid { field: reported, .. } if reported == field),
            "unexpected error: {err}"
        );
        assert!(
            err.to_string().contains(&format!("MACHINA_{}", field.to_uppercase())),
            "{err}"
        );
        assert_eq!(err.kind(), ErrorKind::ConfigInvalid);
    }

    #[test]
    fn absolute_storage_paths_are_kept() {
        let config = MachinaConfig {
            storage_path: String::from("/srv/machina"),
            ..MachinaConfig::default()
        };
        let root = config
            .storage_root()
            .unwrap_or_else(|err| panic!("storage root: {err}"));
        assert_eq!(root, Utf8PathBuf::from("/srv/machina"));
    }

    #[test]
    fn cert_paths_default_into_the_certs_directory() {
        let config = MachinaConfig::default();
        let paths = config.cert_paths(Utf8Path::new("/srv/machina"));
        assert_eq!(paths, CertPaths::in_dir(Utf8Path::new("/srv/machina/certs")));
    }

    #[test]
    fn cert_overrides_replace_single_paths() {
        let config = MachinaConfig {
            tls_ca_cert: Some(String::from("/etc/pki/ca.pem")),
            ..MachinaConfig::default()
        };
        let paths = config.cert_paths(Utf8Path::new("/srv/machina"));
        assert_eq!(paths.ca_cert, Utf8PathBuf::from("/etc/pki/ca.pem"));
        assert_eq!(paths.ca_key, Utf8PathBuf::from("/srv/machina/certs/ca-key.pem"));
    }

    #[test]
    fn controller_settings_carry_the_tuning() {
        let config = MachinaConfig {
            fanout_limit: 3,
            list_timeout_secs: 4,
            install_url: String::from("https://example.test/install.sh"),
            ..MachinaConfig::default()
        };
        let settings = config.controller_settings(Utf8Path::new("/srv/machina"));
        assert_eq!(settings.fanout_limit, 3);
        assert_eq!(settings.list_timeout, Duration::from_secs(4));
        assert_eq!(settings.install_url, "https://example.test/install.sh");
        assert_eq!(settings.storage_path, Utf8PathBuf::from("/srv/machina"));
    }

    #[test]
    fn expand_tilde_leaves_other_paths_alone() {
        assert_eq!(expand_tilde("/absolute/path"), "/absolute/path");
        assert_eq!(expand_tilde("relative/path"), "relative/path");
    }

    #[tokio::test]
    async fn environment_overrides_defaults() {
        let _guard = EnvGuard::set_vars(&[
            ("MACHINA_FANOUT_LIMIT", "3"),
            ("MACHINA_STORAGE_PATH", "/srv/machina"),
            ("MACHINA_NATIVE_SSH", "true"),
        ])
        .await;

        let config = MachinaConfig::load_without_cli_args()
            .unwrap_or_else(|err| panic!("config should load: {err}"));

        assert_eq!(config.fanout_limit, 3);
        assert_eq!(config.storage_path, "/srv/machina");
        assert!(config.native_ssh);
        assert_eq!(config.install_url, DEFAULT_INSTALL_URL);
    }

    #[tokio::test]
    async fn storage_root_expands_home() {
        let _guard = EnvGuard::set_vars(&[("HOME", "/home/operator")]).await;

        let root = MachinaConfig::default()
            .storage_root()
            .unwrap_or_else(|err| panic!("storage root: {err}"));

        assert_eq!(root, Utf8PathBuf::from("/home/operator/.machina"));
    }
}
