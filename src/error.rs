//! Error classification shared by every component.
//!
//! Each component owns its own `thiserror` enum; all of them can be reduced
//! to an [`ErrorKind`] so the command surface can pick an exit code and so
//! driver errors keep their meaning when they cross the plugin boundary.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Exit code reported for general failures.
pub const EXIT_FAILURE: i32 = 1;

/// Exit code reported when a driver's pre-create check fails.
pub const EXIT_PRECREATE_FAILED: i32 = 3;

/// Classification of failures surfaced by the engine.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// User input rejected by a driver's configure step.
    ConfigInvalid,
    /// The driver cannot authenticate against its infrastructure.
    CredentialsMissing,
    /// Infrastructure pre-flight validation failed.
    PrecreateFailed,
    /// Allocation failed after resources may have been created.
    CreateFailed,
    /// The plugin could not be reached or stopped answering heartbeats.
    PluginUnreachable,
    /// The plugin speaks an unsupported protocol version.
    IncompatibleDriver,
    /// No provisioner variant recognised the remote operating system.
    OsUnrecognized,
    /// SSH never became reachable within the retry budget.
    SshTimeout,
    /// The container runtime never started listening within the retry budget.
    RuntimeTimeout,
    /// A host with the requested name already exists.
    AlreadyExists,
    /// The operation requires a running machine.
    NotRunning,
    /// The driver does not support the requested operation.
    UnsupportedForDriver,
    /// The machine already is in the requested state.
    AlreadyInState,
    /// The requested host does not exist in the store.
    NotFound,
    /// A driver operation panicked inside the plugin.
    DriverPanic,
    /// The infrastructure provider reported a failure.
    Provider,
    /// Local file or process IO failed.
    Io,
    /// Any failure without a more precise classification.
    Other,
}

impl ErrorKind {
    /// Returns the stable, kebab-case identifier for this kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ConfigInvalid => "config-invalid",
            Self::CredentialsMissing => "credentials-missing",
            Self::PrecreateFailed => "precreate-failed",
            Self::CreateFailed => "create-failed",
            Self::PluginUnreachable => "plugin-unreachable",
            Self::IncompatibleDriver => "incompatible-driver",
            Self::OsUnrecognized => "os-unrecognized",
            Self::SshTimeout => "ssh-timeout",
            Self::RuntimeTimeout => "runtime-timeout",
            Self::AlreadyExists => "already-exists",
            Self::NotRunning => "not-running",
            Self::UnsupportedForDriver => "unsupported-for-driver",
            Self::AlreadyInState => "already-in-state",
            Self::NotFound => "not-found",
            Self::DriverPanic => "driver-panic",
            Self::Provider => "provider",
            Self::Io => "io",
            Self::Other => "other",
        }
    }

    /// Maps the kind to the process exit code used by the command surface.
    #[must_use]
    pub const fn exit_code(self) -> i32 {
        match self {
            Self::PrecreateFailed => EXIT_PRECREATE_FAILED,
            _ => EXIT_FAILURE,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
