//! SSH client that shells out to the system `ssh` binary.

use std::ffi::OsString;

use super::{SshClient, SshFuture, SshTarget};
use crate::command::{CommandOutput, CommandRunner, ProcessCommandRunner};

const SSH_BIN: &str = "ssh";

/// Options shared by every invocation. Machines are ephemeral, so host keys
/// are neither checked nor recorded.
const BASE_OPTIONS: [&str; 10] = [
    "-o",
    "BatchMode=yes",
    "-o",
    "StrictHostKeyChecking=no",
    "-o",
    "UserKnownHostsFile=/dev/null",
    "-o",
    "LogLevel=quiet",
    "-o",
    "ConnectTimeout=10",
];

/// Client backed by external OpenSSH processes.
#[derive(Clone, Debug)]
pub struct ExternalSshClient<R: CommandRunner = ProcessCommandRunner> {
    target: SshTarget,
    runner: R,
}

impl ExternalSshClient<ProcessCommandRunner> {
    /// Creates a client that spawns real processes.
    #[must_use]
    pub const fn new(target: SshTarget) -> Self {
        Self::with_runner(target, ProcessCommandRunner)
    }
}

impl<R: CommandRunner> ExternalSshClient<R> {
    /// Creates a client using the provided runner.
    #[must_use]
    pub const fn with_runner(target: SshTarget, runner: R) -> Self {
        Self { target, runner }
    }

    /// Returns the target this client connects to.
    #[must_use]
    pub const fn target(&self) -> &SshTarget {
        &self.target
    }

    fn identity_options(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = BASE_OPTIONS.iter().map(OsString::from).collect();
        if let Some(key) = &self.target.key_path {
            args.push(OsString::from("-o"));
            args.push(OsString::from("IdentitiesOnly=yes"));
            args.push(OsString::from("-i"));
            args.push(OsString::from(key.as_str()));
        }
        args
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.target.user, self.target.host)
    }

    fn exec_args(&self, remote_command: Option<&str>, tty: bool) -> Vec<OsString> {
        let mut args = self.identity_options();
        args.push(OsString::from("-p"));
        args.push(OsString::from(self.target.port.to_string()));
        if tty {
            args.push(OsString::from("-t"));
        }
        args.push(OsString::from(self.destination()));
        if let Some(command) = remote_command {
            args.push(OsString::from(command));
        }
        args
    }
}

impl<R: CommandRunner> SshClient for ExternalSshClient<R> {
    fn output<'a>(&'a self, command: &'a str) -> SshFuture<'a, CommandOutput> {
        Box::pin(async move {
            let args = self.exec_args(Some(command), false);
            Ok(self.runner.run(SSH_BIN, &args).await?)
        })
    }

    fn shell<'a>(&'a self, args: &'a [String]) -> SshFuture<'a, Option<i32>> {
        Box::pin(async move {
            let joined = args.join(" ");
            let remote = (!joined.is_empty()).then_some(joined.as_str());
            let ssh_args = self.exec_args(remote, remote.is_none());
            Ok(self.runner.run_attached(SSH_BIN, &ssh_args).await?)
        })
    }
}
