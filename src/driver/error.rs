//! Errors raised by driver operations.

use thiserror::Error;

use crate::error::ErrorKind;

/// Errors raised by [`super::Driver`] operations.
///
/// Every variant carries a plain message so the error can be rebuilt
/// verbatim on the far side of the plugin transport.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum DriverError {
    /// Raised when configuration values are absent or inconsistent.
    #[error("invalid driver configuration: {message}")]
    ConfigInvalid {
        /// Description of the rejected input.
        message: String,
    },
    /// Raised when an auth-bearing driver has no usable credentials.
    #[error("missing credentials: {message}")]
    CredentialsMissing {
        /// Description of the missing credential.
        message: String,
    },
    /// Raised by the read-only pre-create validation.
    #[error("error with pre-create check: {message}")]
    PrecreateFailed {
        /// Provider explanation.
        message: String,
    },
    /// Raised when allocation fails after infrastructure may exist.
    #[error("create failed: {message}")]
    CreateFailed {
        /// Provider explanation, including residual resources when any
        /// remain.
        message: String,
    },
    /// Raised when an operation requires a running machine.
    #[error("machine is not running: {message}")]
    NotRunning {
        /// Machine and observed state.
        message: String,
    },
    /// Raised when the driver has no implementation for an operation.
    #[error("not supported: {message}")]
    Unsupported {
        /// Operation and driver name.
        message: String,
    },
    /// Raised when the plugin cannot be reached or stopped answering.
    #[error("driver plugin unreachable: {message}")]
    PluginUnreachable {
        /// Transport failure description.
        message: String,
    },
    /// Raised when the plugin speaks an incompatible protocol.
    #[error("incompatible driver plugin: {message}")]
    IncompatibleDriver {
        /// Negotiation failure description.
        message: String,
    },
    /// Raised when a driver operation panicked inside the plugin.
    #[error("{message}")]
    Panicked {
        /// Panic payload followed by the captured backtrace.
        message: String,
    },
    /// Wrapper for provider level failures.
    #[error("provider error: {message}")]
    Provider {
        /// Message returned by the provider.
        message: String,
    },
}

impl DriverError {
    /// Builds an [`DriverError::Unsupported`] for `operation` on `driver`.
    #[must_use]
    pub fn unsupported(driver: &str, operation: &str) -> Self {
        Self::Unsupported {
            message: format!("\"{operation}\" is not supported by the {driver} driver"),
        }
    }

    /// Builds a [`DriverError::ConfigInvalid`] from a message.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigInvalid {
            message: message.into(),
        }
    }

    /// Builds a [`DriverError::Provider`] from a message.
    #[must_use]
    pub fn provider(message: impl Into<String>) -> Self {
        Self::Provider {
            message: message.into(),
        }
    }

    /// Returns the classification of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::ConfigInvalid { .. } => ErrorKind::ConfigInvalid,
            Self::CredentialsMissing { .. } => ErrorKind::CredentialsMissing,
            Self::PrecreateFailed { .. } => ErrorKind::PrecreateFailed,
            Self::CreateFailed { .. } => ErrorKind::CreateFailed,
            Self::NotRunning { .. } => ErrorKind::NotRunning,
            Self::Unsupported { .. } => ErrorKind::UnsupportedForDriver,
            Self::PluginUnreachable { .. } => ErrorKind::PluginUnreachable,
            Self::IncompatibleDriver { .. } => ErrorKind::IncompatibleDriver,
            Self::Panicked { .. } => ErrorKind::DriverPanic,
            Self::Provider { .. } => ErrorKind::Provider,
        }
    }

    /// Returns the bare message, without the variant prefix.
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::ConfigInvalid { message }
            | Self::CredentialsMissing { message }
            | Self::PrecreateFailed { message }
            | Self::CreateFailed { message }
            | Self::NotRunning { message }
            | Self::Unsupported { message }
            | Self::PluginUnreachable { message }
            | Self::IncompatibleDriver { message }
            | Self::Panicked { message }
            | Self::Provider { message } => message,
        }
    }

    /// Rebuilds an error from its kind and bare message.
    ///
    /// Kinds that drivers never raise collapse to [`DriverError::Provider`].
    #[must_use]
    pub fn from_kind(kind: ErrorKind, message: String) -> Self {
        match kind {
            ErrorKind::ConfigInvalid => Self::ConfigInvalid { message },
            ErrorKind::CredentialsMissing => Self::CredentialsMissing { message },
            ErrorKind::PrecreateFailed => Self::PrecreateFailed { message },
            ErrorKind::CreateFailed => Self::CreateFailed { message },
            ErrorKind::NotRunning => Self::NotRunning { message },
            ErrorKind::UnsupportedForDriver => Self::Unsupported { message },
            ErrorKind::PluginUnreachable => Self::PluginUnreachable { message },
            ErrorKind::IncompatibleDriver => Self::IncompatibleDriver { message },
            ErrorKind::DriverPanic => Self::Panicked { message },
            _ => Self::Provider { message },
        }
    }
}
