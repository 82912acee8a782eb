//! Coordinates drivers, provisioning and the host store.
//!
//! [`Controller`] is what the command surface talks to. It creates hosts
//! (flag resolution, pre-create check, allocation, provisioning), loads and
//! saves them, fans verbs out across many hosts with a bounded worker pool,
//! and lists hosts with a per-host deadline.

mod drivers;
mod fanout;
mod listing;

use std::collections::BTreeMap;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tracing::{info, warn};

pub use drivers::{DriverFactory, InProcessFactory, PluginFactory};
pub use fanout::{HostFailure, HostVerb, VerbReport};
pub use listing::{HostSummary, natural_cmp};

use crate::cert::{CertAuthority, CertError};
use crate::driver::{
    BaseDriver, Driver, DriverError, DriverOptions, UnavailableDriver, encode_config, none,
};
use crate::error::ErrorKind;
use crate::host::{Host, HostError, HostRecord, HostServices, STATE_WAIT, valid_name};
use crate::options::{AuthOptions, EngineOptions, SwarmOptions};
use crate::provision::{Policies, ProvisionReport, RetryPolicy};
use crate::ssh::SshConnector;
use crate::store::{self, HostStore, StoreError};

/// Default number of hosts a fan-out works on at once.
pub const DEFAULT_FANOUT_LIMIT: usize = 8;

/// Default per-host deadline for listing.
pub const DEFAULT_LIST_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause after a failed create so trailing driver output reaches the log.
pub const DEFAULT_LOG_DRAIN: Duration = Duration::from_secs(2);

/// Errors raised by controller operations.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Raised by host operations.
    #[error(transparent)]
    Host(#[from] HostError),
    /// Raised by the host store.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Raised by the certificate authority.
    #[error(transparent)]
    Cert(#[from] CertError),
    /// Raised by a driver outside a host context.
    #[error(transparent)]
    Driver(#[from] DriverError),
    /// Raised when the host name is taken.
    #[error("host already exists: \"{name}\"")]
    AlreadyExists {
        /// Requested host name.
        name: String,
    },
    /// Raised when the driver's pre-create check fails.
    #[error("{source}")]
    Precreate {
        /// Host being created.
        name: String,
        /// Driver explanation.
        #[source]
        source: DriverError,
    },
    /// Raised when driver creation fails.
    #[error("error creating machine {name}: {source}{}", log_hint(.log_path.as_deref()))]
    Create {
        /// Host being created.
        name: String,
        /// Driver log, when one is kept.
        log_path: Option<Utf8PathBuf>,
        /// Driver explanation.
        #[source]
        source: DriverError,
    },
    /// Raised when one or more hosts of a fan-out fail.
    #[error("{}", join_failures(.failures))]
    Fanout {
        /// One entry per failing host.
        failures: Vec<HostFailure>,
    },
}

fn log_hint(path: Option<&Utf8Path>) -> String {
    path.map(|log| format!("\nsee {log} for driver output"))
        .unwrap_or_default()
}

fn join_failures(failures: &[HostFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

impl ControllerError {
    /// Returns the classification of this error.
    ///
    /// A fan-out whose failures all share a kind reports that kind.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Host(err) => err.kind(),
            Self::Store(err) => err.kind(),
            Self::Cert(err) => err.kind(),
            Self::Driver(err) | Self::Create { source: err, .. } => err.kind(),
            Self::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            Self::Precreate { .. } => ErrorKind::PrecreateFailed,
            Self::Fanout { failures } => {
                let mut kinds = failures.iter().map(|failure| failure.error.kind());
                let first = kinds.next().unwrap_or(ErrorKind::Other);
                if kinds.all(|kind| kind == first) {
                    first
                } else {
                    ErrorKind::Other
                }
            }
        }
    }
}

/// Tuning shared by every controller operation.
#[derive(Clone, Debug)]
pub struct ControllerSettings {
    /// Installation directory.
    pub storage_path: Utf8PathBuf,
    /// Hosts a fan-out works on at once.
    pub fanout_limit: usize,
    /// Per-host deadline for listing.
    pub list_timeout: Duration,
    /// Pause after a failed create.
    pub log_drain: Duration,
    /// Provisioning retry policies.
    pub policies: Policies,
    /// Polling after lifecycle verbs.
    pub state_wait: RetryPolicy,
    /// Default runtime install script.
    pub install_url: String,
}

impl ControllerSettings {
    /// Defaults for an installation rooted at `storage_path`.
    #[must_use]
    pub fn new(storage_path: impl Into<Utf8PathBuf>) -> Self {
        Self {
            storage_path: storage_path.into(),
            fanout_limit: DEFAULT_FANOUT_LIMIT,
            list_timeout: DEFAULT_LIST_TIMEOUT,
            log_drain: DEFAULT_LOG_DRAIN,
            policies: Policies::default(),
            state_wait: STATE_WAIT,
            install_url: String::from(crate::options::DEFAULT_INSTALL_URL),
        }
    }
}

/// What `create` needs to know about the new host.
#[derive(Clone, Debug, Default)]
pub struct CreateRequest {
    /// Host name.
    pub name: String,
    /// Registry name of the driver.
    pub driver_name: String,
    /// Raw driver flag values keyed by flag name.
    pub flags: BTreeMap<String, Vec<String>>,
    /// Runtime options; an empty install URL takes the installation default.
    pub engine: EngineOptions,
    /// Cluster membership.
    pub swarm: SwarmOptions,
    /// Extra subject alternative names for the server certificate.
    pub extra_sans: Vec<String>,
}

/// Result of a successful create.
#[derive(Debug)]
pub struct Created {
    /// The persisted host.
    pub host: Host,
    /// Provisioning outcome; absent for hosts without a driver.
    pub report: Option<ProvisionReport>,
}

/// Front door for every host operation.
pub struct Controller<'a> {
    store: &'a dyn HostStore,
    drivers: &'a dyn DriverFactory,
    connector: &'a dyn SshConnector,
    authority: &'a CertAuthority,
    settings: ControllerSettings,
}

impl<'a> Controller<'a> {
    /// Wires a controller from its collaborators.
    #[must_use]
    pub const fn new(
        store: &'a dyn HostStore,
        drivers: &'a dyn DriverFactory,
        connector: &'a dyn SshConnector,
        authority: &'a CertAuthority,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            store,
            drivers,
            connector,
            authority,
            settings,
        }
    }

    /// Returns the controller's tuning.
    #[must_use]
    pub const fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    const fn services(&self) -> HostServices<'a> {
        HostServices {
            connector: self.connector,
            authority: self.authority,
            policies: self.settings.policies,
        }
    }

    /// Creates, allocates, provisions and persists a new host.
    ///
    /// The record is saved before the driver allocates anything, again
    /// after allocation, and once more after provisioning, so a host whose
    /// provisioning fails is still on disk and can be re-provisioned or
    /// removed.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::Precreate`] when the pre-create check
    /// fails, [`ControllerError::Create`] when allocation fails and the
    /// provisioning error when provisioning fails.
    pub async fn create(&self, request: CreateRequest) -> Result<Created, ControllerError> {
        let CreateRequest {
            name,
            driver_name,
            flags,
            mut engine,
            swarm,
            extra_sans,
        } = request;
        if !valid_name(&name) {
            return Err(HostError::InvalidName { name }.into());
        }
        if self.store.exists(&name)? {
            return Err(ControllerError::AlreadyExists { name });
        }
        if engine.install_url.is_empty() {
            engine.install_url.clone_from(&self.settings.install_url);
        }

        self.authority.ensure()?;

        let mut driver = self.drivers.open(&driver_name, &name).await?;
        if let Err(err) = self.configure_driver(driver.as_mut(), &name, &flags).await {
            close_driver(driver.as_mut(), &name).await;
            return Err(err);
        }

        let mut auth = AuthOptions::for_machine(
            self.authority.paths(),
            &store::machine_dir(&self.settings.storage_path, &name),
        );
        auth.server_cert_sans = extra_sans;
        let mut host = Host::new(&name, &driver_name, driver, auth, engine)?
            .with_swarm_options(swarm)
            .with_state_wait(self.settings.state_wait);

        info!(machine = %name, driver = %driver_name, "running pre-create checks");
        if let Err(source) = host.driver.pre_create_check().await {
            close(&mut host).await;
            return Err(ControllerError::Precreate { name, source });
        }

        self.save(&mut host).await?;
        info!(machine = %name, "creating machine");
        if let Err(source) = host.driver.create().await {
            return Err(self.abandon(host, source).await);
        }
        self.save(&mut host).await?;

        if driver_name == none::DRIVER_NAME {
            info!(machine = %name, "no driver selected; skipping provisioning");
            return Ok(Created { host, report: None });
        }
        info!(machine = %name, "provisioning machine");
        let provisioned = host.provision(self.services()).await;
        self.save(&mut host).await?;
        let report = provisioned?;
        info!(machine = %name, variant = %report.variant, "machine is ready");
        Ok(Created {
            host,
            report: Some(report),
        })
    }

    /// Seeds a freshly opened driver with bare state and applies the
    /// user's flag values.
    async fn configure_driver(
        &self,
        driver: &mut dyn Driver,
        name: &str,
        flags: &BTreeMap<String, Vec<String>>,
    ) -> Result<(), ControllerError> {
        let bare = BaseDriver::new(name, &self.settings.storage_path);
        driver.set_config_raw(&encode_config(&bare)?).await?;
        let descriptors = driver.create_flags().await?;
        let options = DriverOptions::resolve(&descriptors, flags, |var| std::env::var(var).ok())?;
        driver.configure(&options).await?;
        Ok(())
    }

    /// Cleans up after a failed create.
    ///
    /// The driver is asked to release whatever it allocated; when that
    /// succeeds the record goes too, otherwise the record stays so the
    /// host can be removed later.
    async fn abandon(&self, mut host: Host, source: DriverError) -> ControllerError {
        tokio::time::sleep(self.settings.log_drain).await;
        let name = host.name.clone();
        match host.driver.remove().await {
            Ok(()) => {
                if let Err(err) = self.store.remove(&name) {
                    warn!(machine = %name, error = %err, "failed to forget abandoned host");
                }
            }
            Err(err) => {
                warn!(machine = %name, error = %err, "could not release resources of failed create");
                self.save(&mut host).await.ok();
            }
        }
        close(&mut host).await;
        ControllerError::Create {
            log_path: self.drivers.log_path(&name),
            name,
            source,
        }
    }

    /// Loads host `name` and reconnects its driver.
    ///
    /// A driver that cannot be opened is replaced by a placeholder that
    /// keeps the raw state, so the host can still be listed and removed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for unknown hosts.
    pub async fn load(&self, name: &str) -> Result<Host, ControllerError> {
        let record = self.store.load(name)?;
        let driver = match self.drivers.open(&record.driver_name, name).await {
            Ok(driver) => driver,
            Err(err) => {
                warn!(machine = name, driver = %record.driver_name, error = %err, "driver unavailable");
                let placeholder: Box<dyn Driver> = Box::new(UnavailableDriver::new(
                    &record.driver_name,
                    name,
                    err.message(),
                ));
                placeholder
            }
        };
        Ok(Host::from_record(record, driver)
            .await?
            .with_state_wait(self.settings.state_wait))
    }

    /// Persists the current state of `host`.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError`] when the driver snapshot or the write
    /// fails.
    pub async fn save(&self, host: &mut Host) -> Result<(), ControllerError> {
        let record = host.to_record().await?;
        self.store.save(&record)?;
        Ok(())
    }

    /// Returns the stored record of host `name`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the record cannot be read.
    pub fn inspect(&self, name: &str) -> Result<HostRecord, ControllerError> {
        Ok(self.store.load(name)?)
    }

    /// Removes host `name`: the driver releases its resources first, then
    /// local state is deleted. With `force`, a driver failure is logged and
    /// local state is deleted anyway.
    ///
    /// # Errors
    ///
    /// Returns the driver's failure unless `force` is set.
    pub async fn remove(&self, name: &str, force: bool) -> Result<(), ControllerError> {
        let mut host = self.load(name).await?;
        info!(machine = name, "removing machine");
        let removed = host.driver.remove().await;
        close(&mut host).await;
        match removed {
            Ok(()) => {}
            Err(err) if force => {
                warn!(machine = name, error = %err, "driver remove failed; forgetting the host anyway");
            }
            Err(err) => return Err(HostError::from(err).into()),
        }
        self.store.remove(name)?;
        info!(machine = name, "machine removed");
        Ok(())
    }

    /// Returns the runtime endpoint of host `name`.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::NotRunning`] unless the machine runs.
    pub async fn url(&self, name: &str) -> Result<String, ControllerError> {
        let mut host = self.load(name).await?;
        let url = host.url().await;
        close(&mut host).await;
        Ok(url?)
    }

    /// Opens an SSH session to host `name`, optionally running `args`.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError`] when the host cannot be loaded or the
    /// session fails.
    pub async fn ssh(&self, name: &str, args: &[String]) -> Result<Option<i32>, ControllerError> {
        let mut host = self.load(name).await?;
        let code = host.ssh_command(self.connector, args).await;
        close(&mut host).await;
        Ok(code?)
    }
}

/// Closes the driver connection, logging failures.
async fn close(host: &mut Host) {
    close_driver(host.driver.as_mut(), &host.name).await;
}

async fn close_driver(driver: &mut dyn Driver, name: &str) {
    if let Err(err) = driver.close().await {
        warn!(machine = name, error = %err, "failed to close driver");
    }
}

#[cfg(test)]
mod tests;
