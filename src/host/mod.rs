//! Host aggregate: a driver paired with its certificate and runtime
//! options.
//!
//! [`Host`] owns the live driver handle and the serialised snapshot the
//! driver produced last; [`HostRecord`] is what reaches disk. Lifecycle verbs
//! follow one shape: ask the driver to act, then poll its state until the
//! machine reaches the expected state.

mod record;

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;
use tracing::info;

pub use record::{CONFIG_VERSION, HostRecord};

use crate::cert::{CertAuthority, CertError};
use crate::driver::{Driver, DriverError, MachineState};
use crate::error::ErrorKind;
use crate::options::{AuthOptions, EngineOptions, SwarmOptions};
use crate::provision::{
    Attempt, MachineFacts, Policies, ProvisionError, ProvisionReport, Provisioner, RetryPolicy,
    retry,
};
use crate::ssh::{SshClient, SshConnector, SshError, SshTarget};

static NAME_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]*$").ok());

/// Polling applied after lifecycle verbs: every second, sixty times.
pub const STATE_WAIT: RetryPolicy = RetryPolicy::fixed(60, std::time::Duration::from_secs(1));

/// Returns whether `name` is a valid host name.
#[must_use]
pub fn valid_name(name: &str) -> bool {
    NAME_PATTERN
        .as_ref()
        .is_some_and(|pattern| pattern.is_match(name))
}

/// Errors raised by host operations.
#[derive(Debug, Error)]
pub enum HostError {
    /// Raised when the driver reports a failure.
    #[error(transparent)]
    Driver(#[from] DriverError),
    /// Raised when provisioning fails.
    #[error(transparent)]
    Provision(#[from] ProvisionError),
    /// Raised when certificate handling fails.
    #[error(transparent)]
    Cert(#[from] CertError),
    /// Raised when an interactive session fails.
    #[error(transparent)]
    Ssh(#[from] SshError),
    /// Raised when the machine already is in the requested state.
    #[error("machine {name} is already {state}")]
    AlreadyInState {
        /// Host name.
        name: String,
        /// Observed state.
        state: MachineState,
    },
    /// Raised when an operation needs a running machine.
    #[error("machine {name} is not running (state: {state})")]
    NotRunning {
        /// Host name.
        name: String,
        /// Observed state.
        state: MachineState,
    },
    /// Raised when the machine does not reach the expected state in time.
    #[error("machine {name} did not become {expected} (last state: {last})")]
    StateTimeout {
        /// Host name.
        name: String,
        /// Expected state.
        expected: MachineState,
        /// Last observed state.
        last: MachineState,
    },
    /// Raised when a host name does not match the allowed pattern.
    #[error("invalid host name `{name}`: use letters, digits, `.`, `_` and `-`, starting with a letter or digit")]
    InvalidName {
        /// Rejected name.
        name: String,
    },
    /// Raised when a stored record cannot be read or written.
    #[error("invalid host record: {message}")]
    Record {
        /// Description of the problem.
        message: String,
    },
}

impl HostError {
    /// Returns the classification of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Driver(err) => err.kind(),
            Self::Provision(err) => err.kind(),
            Self::Cert(err) => err.kind(),
            Self::Ssh(err) => err.kind(),
            Self::AlreadyInState { .. } => ErrorKind::AlreadyInState,
            Self::NotRunning { .. } => ErrorKind::NotRunning,
            Self::StateTimeout { .. } => ErrorKind::Other,
            Self::InvalidName { .. } | Self::Record { .. } => ErrorKind::ConfigInvalid,
        }
    }

    pub(crate) fn record(err: &serde_json::Error) -> Self {
        Self::Record {
            message: err.to_string(),
        }
    }
}

/// Collaborators needed by the provisioning verbs.
#[derive(Clone, Copy)]
pub struct HostServices<'a> {
    /// Builds SSH clients from the driver's reachability facts.
    pub connector: &'a dyn SshConnector,
    /// Installation certificate authority.
    pub authority: &'a CertAuthority,
    /// Retry policies for provisioning steps.
    pub policies: Policies,
}

/// A machine under management.
pub struct Host {
    /// Host name.
    pub name: String,
    /// Registry key of the driver.
    pub driver_name: String,
    /// Last snapshot produced by the driver.
    pub raw_driver: Vec<u8>,
    /// Live driver handle.
    pub driver: Box<dyn Driver>,
    /// Certificate locations.
    pub auth_options: AuthOptions,
    /// Container-runtime options.
    pub engine_options: EngineOptions,
    /// Cluster membership.
    pub swarm_options: SwarmOptions,
    /// Record layout version.
    pub config_version: u32,
    state_wait: RetryPolicy,
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host")
            .field("name", &self.name)
            .field("driver_name", &self.driver_name)
            .field("config_version", &self.config_version)
            .finish_non_exhaustive()
    }
}

impl Host {
    /// Builds a new host around a configured driver.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::InvalidName`] when `name` is not allowed.
    pub fn new(
        name: &str,
        driver_name: &str,
        driver: Box<dyn Driver>,
        auth_options: AuthOptions,
        engine_options: EngineOptions,
    ) -> Result<Self, HostError> {
        if !valid_name(name) {
            return Err(HostError::InvalidName {
                name: name.to_owned(),
            });
        }
        Ok(Self {
            name: name.to_owned(),
            driver_name: driver_name.to_owned(),
            raw_driver: Vec::new(),
            driver,
            auth_options,
            engine_options,
            swarm_options: SwarmOptions::default(),
            config_version: CONFIG_VERSION,
            state_wait: STATE_WAIT,
        })
    }

    /// Rebuilds a host from its record, pushing the stored snapshot into
    /// `driver`.
    ///
    /// # Errors
    ///
    /// Returns [`HostError`] when the snapshot cannot be applied.
    pub async fn from_record(
        record: HostRecord,
        mut driver: Box<dyn Driver>,
    ) -> Result<Self, HostError> {
        let raw_driver = serde_json::to_vec(&record.driver).map_err(|err| HostError::record(&err))?;
        driver.set_config_raw(&raw_driver).await?;
        Ok(Self {
            name: record.name,
            driver_name: record.driver_name,
            raw_driver,
            driver,
            auth_options: record.auth_options,
            engine_options: record.engine_options,
            swarm_options: record.swarm_options,
            config_version: record.config_version,
            state_wait: STATE_WAIT,
        })
    }

    /// Captures the driver's current snapshot and returns the record to
    /// persist.
    ///
    /// # Errors
    ///
    /// Returns [`HostError`] when the driver cannot produce a snapshot or
    /// the snapshot is not JSON.
    pub async fn to_record(&mut self) -> Result<HostRecord, HostError> {
        self.raw_driver = self.driver.config_raw().await?;
        let driver =
            serde_json::from_slice(&self.raw_driver).map_err(|err| HostError::record(&err))?;
        Ok(HostRecord {
            config_version: self.config_version,
            name: self.name.clone(),
            driver_name: self.driver_name.clone(),
            driver,
            auth_options: self.auth_options.clone(),
            engine_options: self.engine_options.clone(),
            swarm_options: self.swarm_options.clone(),
        })
    }

    /// Replaces the cluster settings of a new host.
    #[must_use]
    pub fn with_swarm_options(mut self, options: SwarmOptions) -> Self {
        self.swarm_options = options;
        self
    }

    /// Replaces the polling applied after lifecycle verbs.
    #[must_use]
    pub const fn with_state_wait(mut self, policy: RetryPolicy) -> Self {
        self.state_wait = policy;
        self
    }

    /// Returns the driver-reported state.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::Driver`] when the query fails.
    pub async fn state(&self) -> Result<MachineState, HostError> {
        Ok(self.driver.state().await?)
    }

    /// Powers the machine on.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::AlreadyInState`] when it already runs, or the
    /// driver's failure.
    pub async fn start(&mut self) -> Result<(), HostError> {
        info!(machine = %self.name, "starting");
        self.ensure_not_in(MachineState::Running).await?;
        self.driver.start().await?;
        self.wait_for(MachineState::Running).await?;
        info!(machine = %self.name, "started");
        Ok(())
    }

    /// Powers the machine off gracefully.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::AlreadyInState`] when it already is stopped, or
    /// the driver's failure.
    pub async fn stop(&mut self) -> Result<(), HostError> {
        info!(machine = %self.name, "stopping");
        self.ensure_not_in(MachineState::Stopped).await?;
        self.driver.stop().await?;
        self.wait_for(MachineState::Stopped).await?;
        info!(machine = %self.name, "stopped");
        Ok(())
    }

    /// Powers the machine off immediately.
    ///
    /// # Errors
    ///
    /// Returns the driver's failure or [`HostError::StateTimeout`].
    pub async fn kill(&mut self) -> Result<(), HostError> {
        info!(machine = %self.name, "killing");
        self.driver.kill().await?;
        self.wait_for(MachineState::Stopped).await?;
        info!(machine = %self.name, "killed");
        Ok(())
    }

    /// Restarts the machine; a stopped machine is simply started.
    ///
    /// # Errors
    ///
    /// Returns the driver's failure or [`HostError::StateTimeout`].
    pub async fn restart(&mut self) -> Result<(), HostError> {
        info!(machine = %self.name, "restarting");
        if self.state().await? == MachineState::Stopped {
            self.driver.start().await?;
        } else {
            self.driver.restart().await?;
        }
        self.wait_for(MachineState::Running).await?;
        info!(machine = %self.name, "restarted");
        Ok(())
    }

    /// Returns the runtime endpoint of a running machine.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::NotRunning`] unless the machine runs.
    pub async fn url(&self) -> Result<String, HostError> {
        self.require_running().await?;
        Ok(self.driver.url().await?)
    }

    /// Returns the machine's IP address.
    ///
    /// # Errors
    ///
    /// Returns the driver's failure.
    pub async fn ip(&self) -> Result<String, HostError> {
        Ok(self.driver.ip().await?)
    }

    /// Returns the SSH connection facts reported by the driver.
    ///
    /// # Errors
    ///
    /// Returns the driver's failure.
    pub async fn ssh_target(&self) -> Result<SshTarget, HostError> {
        let key = self.driver.ssh_key_path().await?;
        Ok(SshTarget {
            host: self.driver.ssh_hostname().await?,
            port: self.driver.ssh_port().await?,
            user: self.driver.ssh_username().await?,
            key_path: (!key.is_empty()).then(|| key.into()),
        })
    }

    /// Opens an SSH session, optionally running `args`, and returns the
    /// remote exit code.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::NotRunning`] unless the machine runs.
    pub async fn ssh_command(
        &self,
        connector: &dyn SshConnector,
        args: &[String],
    ) -> Result<Option<i32>, HostError> {
        self.require_running().await?;
        let client = connector.connect(self.ssh_target().await?);
        Ok(client.shell(args).await?)
    }

    /// Runs the full provisioning sequence.
    ///
    /// # Errors
    ///
    /// Returns [`HostError`] when fact gathering or provisioning fails.
    pub async fn provision(
        &mut self,
        services: HostServices<'_>,
    ) -> Result<ProvisionReport, HostError> {
        let facts = self.facts().await?;
        let client = services.connector.connect(self.ssh_target().await?);
        let report = provisioner(client.as_ref(), services)
            .provision(&facts, &self.auth_options, &mut self.engine_options)
            .await?;
        Ok(report)
    }

    /// Places current TLS material, reusing the server certificate while it
    /// stays valid.
    ///
    /// # Errors
    ///
    /// Returns [`HostError`] when the machine cannot be reached or issuing
    /// fails.
    pub async fn configure_auth(&self, services: HostServices<'_>) -> Result<bool, HostError> {
        self.refresh_auth(services, false).await
    }

    /// Mints a new server certificate, and a new CA pair with `also_ca`,
    /// then places it and restarts the runtime.
    ///
    /// # Errors
    ///
    /// Returns [`HostError`] when the machine cannot be reached or issuing
    /// fails.
    pub async fn regenerate_certs(
        &self,
        services: HostServices<'_>,
        also_ca: bool,
    ) -> Result<(), HostError> {
        if also_ca {
            services.authority.regenerate()?;
        }
        info!(machine = %self.name, also_ca, "regenerating certificates");
        self.refresh_auth(services, true).await.map(drop)
    }

    /// Reinstalls the runtime, starting the machine first when needed.
    ///
    /// # Errors
    ///
    /// Returns [`HostError`] when starting or reinstalling fails.
    pub async fn upgrade(&mut self, services: HostServices<'_>) -> Result<String, HostError> {
        if self.state().await? != MachineState::Running {
            info!(machine = %self.name, "starting machine so it can be upgraded");
            self.start().await?;
        }
        let facts = self.facts().await?;
        let client = services.connector.connect(self.ssh_target().await?);
        let version = provisioner(client.as_ref(), services)
            .upgrade(&facts, &self.engine_options)
            .await?;
        info!(machine = %self.name, %version, "runtime upgraded");
        Ok(version)
    }

    async fn refresh_auth(
        &self,
        services: HostServices<'_>,
        force: bool,
    ) -> Result<bool, HostError> {
        self.require_running().await?;
        let facts = self.facts().await?;
        let client = services.connector.connect(self.ssh_target().await?);
        Ok(provisioner(client.as_ref(), services)
            .configure_auth(&facts, &self.auth_options, &self.engine_options, force)
            .await?)
    }

    async fn facts(&self) -> Result<MachineFacts, HostError> {
        Ok(MachineFacts {
            name: self.name.clone(),
            driver_name: self.driver_name.clone(),
            ip: self.driver.ip().await?,
            ssh_hostname: self.driver.ssh_hostname().await?,
        })
    }

    async fn require_running(&self) -> Result<(), HostError> {
        let state = self.state().await?;
        if state == MachineState::Running {
            Ok(())
        } else {
            Err(HostError::NotRunning {
                name: self.name.clone(),
                state,
            })
        }
    }

    /// Fails with [`HostError::AlreadyInState`] when the machine already is
    /// in `target`; the driver is never asked to act in that case.
    async fn ensure_not_in(&self, target: MachineState) -> Result<(), HostError> {
        if self.state().await? == target {
            return Err(HostError::AlreadyInState {
                name: self.name.clone(),
                state: target,
            });
        }
        Ok(())
    }

    async fn wait_for(&self, expected: MachineState) -> Result<(), HostError> {
        let driver = self.driver.as_ref();
        retry(self.state_wait, || async move {
            match driver.state().await {
                Ok(state) if state == expected => Ok(()),
                Ok(state) => Err(Attempt::Transient(Ok(state))),
                Err(err) => Err(Attempt::Fatal(Err(err))),
            }
        })
        .await
        .map_err(|exhausted| match exhausted.into_last() {
            Ok(last) => HostError::StateTimeout {
                name: self.name.clone(),
                expected,
                last,
            },
            Err(err) => HostError::Driver(err),
        })
    }
}

fn provisioner<'a>(client: &'a dyn SshClient, services: HostServices<'a>) -> Provisioner<'a> {
    Provisioner::new(client, services.authority).with_policies(services.policies)
}

#[cfg(test)]
mod tests;
