//! SSH access to provisioned machines.
//!
//! Clients are derived from a driver's reachability facts ([`SshTarget`]).
//! Two flavours implement [`SshClient`]: [`ExternalSshClient`] shells out to
//! the system `ssh` binary, while the `native-ssh` feature adds an
//! in-process client. [`SshClientKind`] selects between them for the whole
//! process.

mod external;
mod keygen;
#[cfg(feature = "native-ssh")]
mod native;

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::command::{CommandError, CommandOutput, ProcessCommandRunner};
use crate::error::ErrorKind;

pub use external::ExternalSshClient;
pub use keygen::{generate_key_pair, public_key_path};
#[cfg(feature = "native-ssh")]
pub use native::NativeSshClient;

/// Boxed future returned by [`SshClient`] operations.
pub type SshFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, SshError>> + Send + 'a>>;

/// Connection facts for one machine.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SshTarget {
    /// Hostname or IP address.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Remote user.
    pub user: String,
    /// Private key, when the machine has a dedicated one.
    pub key_path: Option<Utf8PathBuf>,
}

/// Errors raised by SSH clients.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SshError {
    /// Raised when the local client cannot be started.
    #[error(transparent)]
    Command(#[from] CommandError),
    /// Raised when a remote command exits unsuccessfully.
    #[error("remote command `{command}` exited with {status}: {stderr}")]
    CommandFailed {
        /// The command as sent to the remote shell.
        command: String,
        /// Exit status text.
        status: String,
        /// Captured standard error.
        stderr: String,
    },
    /// Raised when the session cannot be established.
    #[error("ssh connection to {host} failed: {message}")]
    Connect {
        /// Target host.
        host: String,
        /// Failure description.
        message: String,
    },
    /// Raised when key generation fails.
    #[error("failed to generate SSH key {path}: {message}")]
    KeyGeneration {
        /// Requested private key path.
        path: Utf8PathBuf,
        /// Failure description.
        message: String,
    },
}

impl SshError {
    /// Returns the classification of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Command(_) | Self::KeyGeneration { .. } => ErrorKind::Io,
            Self::CommandFailed { .. } | Self::Connect { .. } => {
                ErrorKind::Other
            }
        }
    }
}

/// Remote shell, exec, and file-transfer capabilities.
pub trait SshClient: Send + Sync {
    /// Runs `command` and captures its output regardless of exit status.
    fn output<'a>(&'a self, command: &'a str) -> SshFuture<'a, CommandOutput>;

    /// Opens an interactive session, optionally running `args`, and returns
    /// the remote exit code.
    fn shell<'a>(&'a self, args: &'a [String]) -> SshFuture<'a, Option<i32>>;

    /// Runs `command` and returns its standard output.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::CommandFailed`] when the command exits non-zero.
    fn run<'a>(&'a self, command: &'a str) -> SshFuture<'a, String> {
        Box::pin(async move {
            let output = self.output(command).await?;
            if output.is_success() {
                return Ok(output.stdout);
            }
            Err(SshError::CommandFailed {
                command: command.to_owned(),
                status: output.status_text(),
                stderr: output.stderr.trim().to_owned(),
            })
        })
    }
}

/// Builds clients for targets.
pub trait SshConnector: Send + Sync {
    /// Returns a client for `target`.
    fn connect(&self, target: SshTarget) -> Box<dyn SshClient>;
}

/// Selects the client implementation.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum SshClientKind {
    /// System `ssh` binary.
    #[default]
    External,
    /// In-process client; requires the `native-ssh` feature.
    Native,
}

static USE_NATIVE: AtomicBool = AtomicBool::new(false);

/// Sets the process-wide client flavour.
///
/// Requesting [`SshClientKind::Native`] without the `native-ssh` feature
/// keeps the external client.
pub fn set_client_kind(kind: SshClientKind) {
    let native = kind == SshClientKind::Native && cfg!(feature = "native-ssh");
    if kind == SshClientKind::Native && !native {
        tracing::warn!("native SSH client not compiled in; using the external ssh binary");
    }
    USE_NATIVE.store(native, Ordering::Relaxed);
}

/// Returns the process-wide client flavour.
#[must_use]
pub fn client_kind() -> SshClientKind {
    if USE_NATIVE.load(Ordering::Relaxed) {
        SshClientKind::Native
    } else {
        SshClientKind::External
    }
}

/// Connector honouring the process-wide client flavour.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultConnector;

impl SshConnector for DefaultConnector {
    fn connect(&self, target: SshTarget) -> Box<dyn SshClient> {
        #[cfg(feature = "native-ssh")]
        if client_kind() == SshClientKind::Native {
            return Box::new(NativeSshClient::new(target));
        }
        Box::new(ExternalSshClient::with_runner(target, ProcessCommandRunner))
    }
}
