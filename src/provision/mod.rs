//! Turns a freshly created machine into a reachable container-runtime
//! endpoint.
//!
//! The [`Provisioner`] walks a fixed sequence of [`Step`]s over SSH: wait for
//! the session, identify the OS, set the hostname, install prerequisites,
//! place TLS material, install the runtime, configure it through a systemd
//! drop-in and wait for the TLS port. Every step is idempotent, and files are
//! only replaced when their content differs, so re-provisioning an unchanged
//! machine neither rewrites files nor restarts the runtime.

mod os_release;
mod remote;
mod retry;
mod unit;
mod variant;

use std::fmt;

use thiserror::Error;
use tracing::{info, warn};

pub use os_release::OsRelease;
pub use remote::Placement;
pub use retry::{Attempt, Exhausted, Policies, RetryPolicy, retry};
pub use unit::{UnitContext, escape_environment, render as render_unit};
pub use variant::{CONTAINER_MARKER, PackageManager, REGISTRY, Variant};

use crate::cert::{self, CertAuthority, CertError, ServerRequest, Validation};
use crate::error::ErrorKind;
use crate::files;
use crate::options::{AuthOptions, EngineOptions, REMOTE_UNIT_PATH};
use crate::ssh::{SshClient, SshError};

const CERT_MODE: &str = "0644";
const KEY_MODE: &str = "0640";
const UNIT_MODE: &str = "0644";

/// One stage of provisioning.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Step {
    /// Poll SSH until a trivial command succeeds.
    AwaitSsh,
    /// Read `/etc/os-release` and pick a variant.
    DetectOs,
    /// Set the hostname and the loopback alias.
    SetHostname,
    /// Install prerequisites through the package manager.
    InstallPackages,
    /// Mint and place TLS material.
    ConfigureAuth,
    /// Install the runtime when missing.
    InstallRuntime,
    /// Render and place the systemd drop-in.
    ConfigureRuntime,
    /// Poll for the runtime's TLS port.
    AwaitRuntime,
}

impl Step {
    /// Returns the step's name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AwaitSsh => "await-ssh",
            Self::DetectOs => "detect-os",
            Self::SetHostname => "set-hostname",
            Self::InstallPackages => "install-packages",
            Self::ConfigureAuth => "configure-auth",
            Self::InstallRuntime => "install-runtime",
            Self::ConfigureRuntime => "configure-runtime",
            Self::AwaitRuntime => "await-runtime",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised while provisioning.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// Raised when no variant recognises the remote OS.
    #[error("no provisioner recognises the operating system `{id}`")]
    OsUnrecognized {
        /// `ID` reported by `/etc/os-release`.
        id: String,
    },
    /// Raised when SSH never accepts a command.
    #[error("ssh did not become available after {attempts} attempts: {last}")]
    SshTimeout {
        /// Attempts made.
        attempts: u32,
        /// Failure of the final attempt.
        last: String,
    },
    /// Raised when the runtime never listens on its TLS port.
    #[error("container runtime not listening on port {port} after {attempts} attempts: {last}")]
    RuntimeTimeout {
        /// TLS port that was polled.
        port: u16,
        /// Attempts made.
        attempts: u32,
        /// Outcome of the final probe.
        last: String,
    },
    /// Raised when a remote command fails.
    #[error("{step} failed: {source}")]
    Remote {
        /// Step that issued the command.
        step: Step,
        /// Underlying SSH failure.
        #[source]
        source: SshError,
    },
    /// Raised when the variant cannot perform the operation.
    #[error("{operation} is not supported on {variant}")]
    Unsupported {
        /// Requested operation.
        operation: String,
        /// Selected variant.
        variant: Variant,
    },
    /// Raised when certificate material cannot be produced.
    #[error(transparent)]
    Cert(#[from] CertError),
}

impl ProvisionError {
    /// Returns the classification of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::OsUnrecognized { .. } => ErrorKind::OsUnrecognized,
            Self::SshTimeout { .. } => ErrorKind::SshTimeout,
            Self::RuntimeTimeout { .. } => ErrorKind::RuntimeTimeout,
            Self::Unsupported { .. } => ErrorKind::UnsupportedForDriver,
            Self::Remote { source, .. } => source.kind(),
            Self::Cert(err) => err.kind(),
        }
    }

    const fn at(step: Step, source: SshError) -> Self {
        Self::Remote { step, source }
    }
}

/// Identity and reachability of the machine being provisioned.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MachineFacts {
    /// Machine name, also used as hostname.
    pub name: String,
    /// Driver name, recorded as the `provider` label.
    pub driver_name: String,
    /// Public IP address.
    pub ip: String,
    /// Hostname used for SSH.
    pub ssh_hostname: String,
}

/// What a provisioning run did.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProvisionReport {
    /// Variant selected for the host.
    pub variant: Variant,
    /// Storage driver written into the unit.
    pub storage_driver: String,
    /// Whether the runtime was restarted.
    pub restarted: bool,
    /// Steps executed, in order.
    pub steps: Vec<Step>,
}

/// Runs provisioning steps against one machine.
pub struct Provisioner<'a> {
    ssh: &'a dyn SshClient,
    authority: &'a CertAuthority,
    policies: Policies,
}

impl<'a> Provisioner<'a> {
    /// Creates a provisioner with the default retry policies.
    #[must_use]
    pub fn new(ssh: &'a dyn SshClient, authority: &'a CertAuthority) -> Self {
        Self {
            ssh,
            authority,
            policies: Policies::default(),
        }
    }

    /// Replaces the retry policies.
    #[must_use]
    pub const fn with_policies(mut self, policies: Policies) -> Self {
        self.policies = policies;
        self
    }

    /// Provisions the machine from scratch or brings it back in line.
    ///
    /// `engine` receives the storage-driver decision so it is persisted with
    /// the host.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError`] naming the step that failed.
    pub async fn provision(
        &self,
        facts: &MachineFacts,
        auth: &AuthOptions,
        engine: &mut EngineOptions,
    ) -> Result<ProvisionReport, ProvisionError> {
        let mut steps = Vec::new();

        enter(facts, Step::AwaitSsh, &mut steps);
        self.await_ssh().await?;

        enter(facts, Step::DetectOs, &mut steps);
        let (release, variant) = self.detect().await?;
        info!(machine = %facts.name, os = release.label(), %variant, "selected provisioner");

        if variant != Variant::Container {
            enter(facts, Step::SetHostname, &mut steps);
            self.exec(Step::SetHostname, &remote::set_hostname(&facts.name))
                .await?;
        }

        if let Some(manager) = variant.package_manager() {
            enter(facts, Step::InstallPackages, &mut steps);
            self.install_packages(manager).await?;
        }

        enter(facts, Step::ConfigureAuth, &mut steps);
        let mut changed = self.place_auth(facts, auth, false).await?;

        if !variant.runtime_prebaked() {
            enter(facts, Step::InstallRuntime, &mut steps);
            self.exec(Step::InstallRuntime, &remote::install_runtime(&engine.install_url))
                .await?;
        }

        if engine.storage_driver.is_empty() {
            engine.storage_driver = self.storage_driver(variant, &release).await?;
        }

        if variant.uses_systemd() {
            enter(facts, Step::ConfigureRuntime, &mut steps);
            changed |= self.configure_runtime(facts, auth, engine).await?;
        }

        let restarted = changed && variant.uses_systemd();
        if restarted {
            info!(machine = %facts.name, "restarting container runtime");
            self.exec(Step::ConfigureRuntime, remote::RESTART_RUNTIME)
                .await?;
        }

        enter(facts, Step::AwaitRuntime, &mut steps);
        self.await_runtime(engine.tls_port).await?;

        Ok(ProvisionReport {
            variant,
            storage_driver: engine.storage_driver.clone(),
            restarted,
            steps,
        })
    }

    /// Re-issues TLS material and restarts the runtime when it changed.
    ///
    /// With `force`, a new server certificate is minted even when the stored
    /// one is still valid.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError`] when detection, issuing or placement fails.
    pub async fn configure_auth(
        &self,
        facts: &MachineFacts,
        auth: &AuthOptions,
        engine: &EngineOptions,
        force: bool,
    ) -> Result<bool, ProvisionError> {
        let (_, variant) = self.detect().await?;
        let changed = self.place_auth(facts, auth, force).await?;
        if changed && variant.uses_systemd() {
            info!(machine = %facts.name, "restarting container runtime for new certificates");
            self.exec(Step::ConfigureAuth, remote::RESTART_RUNTIME)
                .await?;
            self.await_runtime(engine.tls_port).await?;
        }
        Ok(changed)
    }

    /// Returns the runtime's server version.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::Remote`] when the query fails.
    pub async fn runtime_version(&self) -> Result<String, ProvisionError> {
        let output = self
            .ssh
            .run(remote::RUNTIME_VERSION)
            .await
            .map_err(|err| ProvisionError::at(Step::AwaitRuntime, err))?;
        Ok(output.trim().to_owned())
    }

    /// Reinstalls the runtime through the install URL and restarts it.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::Unsupported`] for variants without package
    /// management, or the failure of the reinstall.
    pub async fn upgrade(
        &self,
        facts: &MachineFacts,
        engine: &EngineOptions,
    ) -> Result<String, ProvisionError> {
        let (_, variant) = self.detect().await?;
        if variant.package_manager().is_none() {
            return Err(ProvisionError::Unsupported {
                operation: String::from("upgrade"),
                variant,
            });
        }
        info!(machine = %facts.name, url = %engine.install_url, "upgrading container runtime");
        self.exec(Step::InstallRuntime, &remote::upgrade_runtime(&engine.install_url))
            .await?;
        self.await_runtime(engine.tls_port).await?;
        self.runtime_version().await
    }

    async fn await_ssh(&self) -> Result<(), ProvisionError> {
        let policy = self.policies.ssh;
        retry(policy, || async move {
            self.ssh
                .run(remote::PING)
                .await
                .map(drop)
                .map_err(Attempt::Transient)
        })
        .await
        .map_err(|exhausted| ProvisionError::SshTimeout {
            attempts: policy.attempts,
            last: exhausted.into_last().to_string(),
        })
    }

    async fn detect(&self) -> Result<(OsRelease, Variant), ProvisionError> {
        let text = self
            .ssh
            .run(remote::OS_RELEASE)
            .await
            .map_err(|err| ProvisionError::at(Step::DetectOs, err))?;
        let release = OsRelease::parse(&text);
        let variant = Variant::select(&release).ok_or_else(|| ProvisionError::OsUnrecognized {
            id: release.id.clone(),
        })?;
        Ok((release, variant))
    }

    async fn install_packages(&self, manager: PackageManager) -> Result<(), ProvisionError> {
        let command = match manager {
            PackageManager::Apt => remote::APT_INSTALL,
            PackageManager::Yum => remote::YUM_INSTALL,
        };
        retry(self.policies.package_lock, || async move {
            let output = self
                .ssh
                .output(command)
                .await
                .map_err(Attempt::Fatal)?;
            if output.is_success() {
                return Ok(());
            }
            let failure = SshError::CommandFailed {
                command: command.to_owned(),
                status: output.status_text(),
                stderr: output.stderr.trim().to_owned(),
            };
            if output.stderr.contains(remote::LOCK_BUSY) || output.stdout.contains(remote::LOCK_BUSY)
            {
                warn!("package manager lock held; waiting");
                Err(Attempt::Transient(failure))
            } else {
                Err(Attempt::Fatal(failure))
            }
        })
        .await
        .map_err(|exhausted| ProvisionError::at(Step::InstallPackages, exhausted.into_last()))
    }

    async fn place_auth(
        &self,
        facts: &MachineFacts,
        auth: &AuthOptions,
        force: bool,
    ) -> Result<bool, ProvisionError> {
        let request = ServerRequest::for_machine(
            &cert::local_user(),
            &facts.name,
            &facts.ip,
            &facts.ssh_hostname,
            &auth.server_cert_sans,
        );
        self.authority.ensure()?;
        if force || !self.server_cert_reusable(auth, &request)? {
            info!(machine = %facts.name, sans = ?request.sans, "issuing server certificate");
            self.authority
                .write_server(&request, &auth.server_cert_path, &auth.server_key_path)?;
        }

        let files = [
            (&auth.ca_cert_path, &auth.ca_cert_remote_path, CERT_MODE),
            (&auth.server_cert_path, &auth.server_cert_remote_path, CERT_MODE),
            (&auth.server_key_path, &auth.server_key_remote_path, KEY_MODE),
        ];
        let mut changed = false;
        for (local, target, mode) in files {
            let contents = cert::read(local)?;
            let placement = self.place(Step::ConfigureAuth, target, &contents, mode).await?;
            changed |= placement == Placement::Changed;
        }
        Ok(changed)
    }

    fn server_cert_reusable(
        &self,
        auth: &AuthOptions,
        request: &ServerRequest,
    ) -> Result<bool, ProvisionError> {
        let present = files::exists(&auth.server_cert_path).unwrap_or(false)
            && files::exists(&auth.server_key_path).unwrap_or(false);
        if !present {
            return Ok(false);
        }
        match self
            .authority
            .validate_server(&auth.server_cert_path, &request.sans)?
        {
            Validation::Valid => Ok(true),
            Validation::Invalid { reason } => {
                info!(path = %auth.server_cert_path, %reason, "server certificate needs replacing");
                Ok(false)
            }
        }
    }

    async fn storage_driver(
        &self,
        variant: Variant,
        release: &OsRelease,
    ) -> Result<String, ProvisionError> {
        let default = variant.default_storage_driver(release);
        if default != "aufs" {
            return Ok(default.to_owned());
        }
        let filesystem = self
            .ssh
            .run(remote::VAR_LIB_FILESYSTEM)
            .await
            .map_err(|err| ProvisionError::at(Step::ConfigureRuntime, err))?;
        if filesystem.trim() == "btrfs" {
            info!("/var/lib is on btrfs; using the btrfs storage driver");
            return Ok(String::from("btrfs"));
        }
        Ok(default.to_owned())
    }

    async fn configure_runtime(
        &self,
        facts: &MachineFacts,
        auth: &AuthOptions,
        engine: &EngineOptions,
    ) -> Result<bool, ProvisionError> {
        let root = self
            .ssh
            .run(remote::ROOT_FILESYSTEM)
            .await
            .map_err(|err| ProvisionError::at(Step::ConfigureRuntime, err))?;
        let no_pivot = root.trim() == "rootfs";
        if no_pivot {
            warn!(
                machine = %facts.name,
                "root filesystem is rootfs; disabling pivot_root for the runtime, which weakens container isolation"
            );
        }
        let rendered = unit::render(&UnitContext {
            engine,
            auth,
            driver_name: &facts.driver_name,
            storage_driver: &engine.storage_driver,
            no_pivot,
        });
        let placement = self
            .place(Step::ConfigureRuntime, REMOTE_UNIT_PATH, &rendered, UNIT_MODE)
            .await?;
        Ok(placement == Placement::Changed)
    }

    async fn await_runtime(&self, port: u16) -> Result<(), ProvisionError> {
        let policy = self.policies.runtime;
        let needle = &format!(":{port}");
        retry(policy, || async move {
            let sockets = self
                .ssh
                .output(remote::LISTENING_SOCKETS)
                .await
                .map_err(|err| Attempt::Transient(err.to_string()))?;
            let listening = sockets.stdout.lines().any(|line| {
                line.split_whitespace()
                    .any(|field| field.ends_with(needle.as_str()))
            });
            if listening {
                Ok(())
            } else {
                Err(Attempt::Transient(format!("nothing listening on {needle}")))
            }
        })
        .await
        .map_err(|exhausted| ProvisionError::RuntimeTimeout {
            port,
            attempts: policy.attempts,
            last: exhausted.into_last(),
        })
    }

    async fn place(
        &self,
        step: Step,
        target: &str,
        contents: &str,
        mode: &str,
    ) -> Result<Placement, ProvisionError> {
        let stdout = self
            .ssh
            .run(&remote::place_file(target, contents, mode))
            .await
            .map_err(|err| ProvisionError::at(step, err))?;
        let placement = Placement::from_output(&stdout);
        info!(path = target, ?placement, "placed remote file");
        Ok(placement)
    }

    async fn exec(&self, step: Step, command: &str) -> Result<(), ProvisionError> {
        self.ssh
            .run(command)
            .await
            .map(drop)
            .map_err(|err| ProvisionError::at(step, err))
    }
}

fn enter(facts: &MachineFacts, step: Step, steps: &mut Vec<Step>) {
    info!(machine = %facts.name, %step, "provisioning");
    steps.push(step);
}
