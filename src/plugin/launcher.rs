//! Spawns plugin child processes and relays their output.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::{DRIVER_NAME_VAR, MAGIC_COOKIE, MAGIC_COOKIE_VAR, TransportError};

/// How long a plugin has to print its listening address.
pub const ADDRESS_TIMEOUT: Duration = Duration::from_secs(10);

const EXIT_GRACE: Duration = Duration::from_secs(2);

/// Starts plugin processes from one executable.
#[derive(Clone, Debug)]
pub struct PluginLauncher {
    program: PathBuf,
    address_timeout: Duration,
}

impl PluginLauncher {
    /// Launches plugins from the running executable.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Io`] when the executable path is unknown.
    pub fn current_exe() -> Result<Self, TransportError> {
        Ok(Self::new(std::env::current_exe()?))
    }

    /// Launches plugins from `program`.
    #[must_use]
    pub const fn new(program: PathBuf) -> Self {
        Self {
            program,
            address_timeout: ADDRESS_TIMEOUT,
        }
    }

    /// Overrides how long to wait for the address line.
    #[must_use]
    pub const fn with_address_timeout(mut self, limit: Duration) -> Self {
        self.address_timeout = limit;
        self
    }

    /// Spawns a plugin serving `driver_name` and waits for its address.
    ///
    /// Output after the address line, and everything on standard error, is
    /// re-emitted as tracing events and appended to `log_path` once its
    /// directory exists.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Launch`] when the process cannot be spawned
    /// or does not print a socket address in time.
    pub async fn launch(
        &self,
        driver_name: &str,
        machine_name: &str,
        log_path: Option<Utf8PathBuf>,
    ) -> Result<(SocketAddr, PluginProcess), TransportError> {
        let launch_error = |message: String| TransportError::Launch {
            driver: driver_name.to_owned(),
            message,
        };

        let mut child = Command::new(&self.program)
            .env(MAGIC_COOKIE_VAR, MAGIC_COOKIE)
            .env(DRIVER_NAME_VAR, driver_name)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| launch_error(format!("{}: {err}", self.program.display())))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| launch_error(String::from("plugin stdout was not captured")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| launch_error(String::from("plugin stderr was not captured")))?;

        let relay = LogRelay {
            machine_name: machine_name.to_owned(),
            driver_name: driver_name.to_owned(),
            log_path,
        };
        let stderr_task = tokio::spawn(relay.clone().forward(BufReader::new(stderr).lines()));

        let mut stdout_lines = BufReader::new(stdout).lines();
        let first = match timeout(self.address_timeout, stdout_lines.next_line()).await {
            Ok(Ok(Some(line))) => line,
            Ok(Ok(None)) => {
                return Err(launch_error(String::from(
                    "plugin exited before reporting its address",
                )));
            }
            Ok(Err(err)) => return Err(launch_error(err.to_string())),
            Err(_) => {
                return Err(launch_error(format!(
                    "no address reported within {}s",
                    self.address_timeout.as_secs()
                )));
            }
        };
        let address: SocketAddr = first
            .trim()
            .parse()
            .map_err(|err| launch_error(format!("invalid address line {first:?}: {err}")))?;
        debug!(driver = driver_name, %address, "plugin reported address");

        let stdout_task = tokio::spawn(relay.forward(stdout_lines));
        Ok((
            address,
            PluginProcess {
                child,
                relays: vec![stdout_task, stderr_task],
            },
        ))
    }
}

#[derive(Clone, Debug)]
struct LogRelay {
    machine_name: String,
    driver_name: String,
    log_path: Option<Utf8PathBuf>,
}

impl LogRelay {
    async fn forward<R>(self, mut lines: Lines<BufReader<R>>)
    where
        R: AsyncRead + Unpin,
    {
        while let Ok(Some(line)) = lines.next_line().await {
            info!(
                target: "machina::plugin",
                machine = %self.machine_name,
                driver = %self.driver_name,
                "{line}"
            );
            if let Some(path) = &self.log_path {
                append_line(path, &line).await;
            }
        }
    }
}

async fn append_line(path: &Utf8Path, line: &str) {
    let Some(dir) = path.parent() else {
        return;
    };
    if !tokio::fs::try_exists(dir).await.unwrap_or(false) {
        return;
    }
    let file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await;
    match file {
        Ok(mut file) => {
            if let Err(err) = file.write_all(format!("{line}\n").as_bytes()).await {
                warn!(path = %path, error = %err, "failed to append driver log");
            }
        }
        Err(err) => warn!(path = %path, error = %err, "failed to open driver log"),
    }
}

/// A running plugin child.
#[derive(Debug)]
pub struct PluginProcess {
    child: Child,
    relays: Vec<JoinHandle<()>>,
}

impl PluginProcess {
    /// Waits briefly for the child to exit after `close`, then kills it.
    pub async fn shutdown(mut self) {
        match timeout(EXIT_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => debug!(%status, "plugin exited"),
            Ok(Err(err)) => warn!(error = %err, "failed to wait for plugin"),
            Err(_) => {
                warn!("plugin did not exit after close; killing it");
                self.child.kill().await.ok();
            }
        }
        for relay in self.relays.drain(..) {
            if timeout(EXIT_GRACE, relay).await.is_err() {
                debug!("plugin log relay still running after exit");
            }
        }
    }
}
