//! Out-of-process driver transport.
//!
//! The controller never links driver code directly. It launches the current
//! executable with [`MAGIC_COOKIE_VAR`] and [`DRIVER_NAME_VAR`] set; the child
//! binds a loopback socket, prints its address as the first line of standard
//! output and serves the driver contract over [`wire`] frames until asked to
//! close. [`RpcClientDriver`] is the controller side: it negotiates the
//! protocol version, multiplexes calls, and keeps a heartbeat running for as
//! long as the connection is open.

mod client;
mod launcher;
mod panic_trap;
mod server;
pub mod wire;

use std::io::Write;

use camino::Utf8PathBuf;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::info;

pub use client::{ClientOptions, DEFAULT_HEARTBEAT_INTERVAL, RpcClientDriver};
pub use launcher::{ADDRESS_TIMEOUT, PluginLauncher, PluginProcess};
pub use server::{Protocol, serve, serve_with};

use crate::driver::{DriverError, builtin_driver};
use crate::error::ErrorKind;

/// Environment variable that switches the binary into plugin mode.
pub const MAGIC_COOKIE_VAR: &str = "MACHINA_PLUGIN_MAGIC_COOKIE";

/// Value [`MAGIC_COOKIE_VAR`] must carry.
pub const MAGIC_COOKIE: &str = "8d3c1b7e5f0a4c2e9b6d";

/// Environment variable naming the driver a plugin serves.
pub const DRIVER_NAME_VAR: &str = "MACHINA_PLUGIN_DRIVER_NAME";

/// Protocol version spoken by this build.
pub const PROTOCOL_VERSION: u32 = 1;

/// Returns the service name for a protocol version.
#[must_use]
pub fn service_name(version: u32) -> String {
    format!("machina.driver.v{version}")
}

/// Returns the driver name when the process was launched as a plugin.
#[must_use]
pub fn plugin_request() -> Option<String> {
    let cookie = std::env::var(MAGIC_COOKIE_VAR).ok()?;
    if cookie != MAGIC_COOKIE {
        return None;
    }
    std::env::var(DRIVER_NAME_VAR).ok()
}

/// Errors raised by the plugin transport itself.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TransportError {
    /// Raised when a socket or pipe operation fails.
    #[error("plugin transport IO failed: {message}")]
    Io {
        /// Operating system error text.
        message: String,
    },
    /// Raised when a frame cannot be encoded or decoded.
    #[error("malformed plugin message: {message}")]
    Codec {
        /// Serialisation error text.
        message: String,
    },
    /// Raised when the plugin binary cannot be started or never reports an
    /// address.
    #[error("failed to launch the {driver} driver plugin: {message}")]
    Launch {
        /// Driver being launched.
        driver: String,
        /// Failure description.
        message: String,
    },
    /// Raised when a plugin is asked to serve a driver it does not have.
    #[error("unknown driver \"{driver}\"")]
    UnknownDriver {
        /// Requested driver name.
        driver: String,
    },
}

impl TransportError {
    /// Returns the classification of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Io { .. } | Self::Launch { .. } => ErrorKind::PluginUnreachable,
            Self::Codec { .. } => ErrorKind::IncompatibleDriver,
            Self::UnknownDriver { .. } => ErrorKind::NotFound,
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}

impl From<TransportError> for DriverError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Codec { .. } => Self::IncompatibleDriver {
                message: err.to_string(),
            },
            _ => Self::PluginUnreachable {
                message: err.to_string(),
            },
        }
    }
}

/// Serves `driver_name` on a loopback socket until the controller closes
/// the connection.
///
/// The listening address is written to standard output as the first line.
///
/// # Errors
///
/// Returns [`TransportError::UnknownDriver`] for names outside the built-in
/// registry and [`TransportError::Io`] when the socket cannot be bound.
pub async fn run_plugin(driver_name: &str) -> Result<(), TransportError> {
    panic_trap::install();
    let driver = builtin_driver(driver_name, "", &Utf8PathBuf::new()).ok_or_else(|| {
        TransportError::UnknownDriver {
            driver: driver_name.to_owned(),
        }
    })?;

    let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
    let address = listener.local_addr()?;
    {
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{address}")?;
        stdout.flush()?;
    }
    info!(driver = driver_name, %address, "plugin serving");
    serve(listener, driver).await
}

#[cfg(test)]
mod tests;
