//! Command-line interface definitions for the `machina` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::{Args, Parser, Subcommand, ValueEnum};

/// Top-level CLI for the `machina` binary.
#[derive(Debug, Parser)]
#[command(
    name = "machina",
    about = "Create and manage container hosts on local and cloud infrastructure",
    version,
    arg_required_else_help = true
)]
pub(crate) struct Cli {
    /// Installation directory; overrides `storage_path` from configuration.
    #[arg(long, short = 's', global = true, value_name = "PATH")]
    pub(crate) storage_path: Option<String>,
    /// Use the in-process SSH client instead of the system `ssh` binary.
    #[arg(long, global = true)]
    pub(crate) native_ssh: bool,
    /// Subcommand to run.
    #[command(subcommand)]
    pub(crate) command: Command,
}

/// Subcommands of `machina`.
#[derive(Debug, Subcommand)]
pub(crate) enum Command {
    /// Create and provision a host.
    Create(CreateCommand),
    /// List hosts with their state and URL.
    #[command(name = "ls")]
    List(ListCommand),
    /// Print the stored record of a host as JSON.
    Inspect(NameArg),
    /// Remove hosts and release their infrastructure.
    #[command(name = "rm")]
    Remove(RemoveCommand),
    /// Start hosts.
    Start(NamesArg),
    /// Stop hosts gracefully.
    Stop(NamesArg),
    /// Restart hosts.
    Restart(NamesArg),
    /// Power hosts off immediately.
    Kill(NamesArg),
    /// Print the state of hosts.
    Status(NamesArg),
    /// Print the IP address of hosts.
    Ip(NamesArg),
    /// Print the runtime URL of a host.
    Url(NameArg),
    /// Re-run provisioning on hosts.
    Provision(NamesArg),
    /// Mint and install new server certificates.
    RegenerateCerts(RegenerateCertsCommand),
    /// Reinstall the container runtime on hosts.
    Upgrade(NamesArg),
    /// Open a shell on a host or run a command there.
    Ssh(SshCommand),
}

/// A single host name.
#[derive(Debug, Args)]
pub(crate) struct NameArg {
    /// Host name.
    pub(crate) name: String,
}

/// One or more host names.
#[derive(Debug, Args)]
pub(crate) struct NamesArg {
    /// Host names.
    #[arg(required = true)]
    pub(crate) names: Vec<String>,
}

/// Arguments for `machina create`.
#[derive(Debug, Args)]
pub(crate) struct CreateCommand {
    /// Driver that allocates the host.
    #[arg(long, short = 'd', default_value = "none", env = "MACHINA_DRIVER")]
    pub(crate) driver: String,
    /// Script used to install the container runtime.
    #[arg(long, value_name = "URL")]
    pub(crate) engine_install_url: Option<String>,
    /// `KEY=value` environment entry for the runtime daemon.
    #[arg(long, value_name = "KEY=VALUE")]
    pub(crate) engine_env: Vec<String>,
    /// Label for the runtime daemon.
    #[arg(long, value_name = "LABEL")]
    pub(crate) engine_label: Vec<String>,
    /// Registry the runtime may reach without TLS.
    #[arg(long, value_name = "REGISTRY")]
    pub(crate) engine_insecure_registry: Vec<String>,
    /// Registry mirror for the runtime.
    #[arg(long, value_name = "URL")]
    pub(crate) engine_registry_mirror: Vec<String>,
    /// Storage driver for the runtime.
    #[arg(long, value_name = "DRIVER")]
    pub(crate) engine_storage_driver: Option<String>,
    /// Extra runtime daemon flag, without leading dashes.
    #[arg(long, value_name = "FLAG")]
    pub(crate) engine_opt: Vec<String>,
    /// TLS port of the runtime.
    #[arg(long, value_name = "PORT")]
    pub(crate) engine_port: Option<u16>,
    /// Extra subject alternative name for the server certificate.
    #[arg(long, value_name = "SAN")]
    pub(crate) tls_san: Vec<String>,
    /// Name of the new host.
    pub(crate) name: String,
    /// Driver flags, such as `--url tcp://1.2.3.4:2376`.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "DRIVER FLAGS")]
    pub(crate) driver_flags: Vec<String>,
}

/// Output layouts of `machina ls`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, ValueEnum)]
pub(crate) enum ListFormat {
    /// Aligned columns.
    #[default]
    Table,
    /// One JSON array.
    Json,
}

/// Arguments for `machina ls`.
#[derive(Debug, Args)]
pub(crate) struct ListCommand {
    /// Print host names only.
    #[arg(long, short = 'q', conflicts_with = "format")]
    pub(crate) quiet: bool,
    /// Output layout.
    #[arg(long, value_enum, default_value_t = ListFormat::Table)]
    pub(crate) format: ListFormat,
}

/// Arguments for `machina rm`.
#[derive(Debug, Args)]
pub(crate) struct RemoveCommand {
    /// Forget hosts even when their infrastructure cannot be released.
    #[arg(long, short = 'f')]
    pub(crate) force: bool,
    /// Host names.
    #[arg(required = true)]
    pub(crate) names: Vec<String>,
}

/// Arguments for `machina regenerate-certs`.
#[derive(Debug, Args)]
pub(crate) struct RegenerateCertsCommand {
    /// Replace the CA and client certificates as well.
    #[arg(long)]
    pub(crate) client_certs: bool,
    /// Host names.
    #[arg(required = true)]
    pub(crate) names: Vec<String>,
}

/// Arguments for `machina ssh`.
#[derive(Debug, Args)]
pub(crate) struct SshCommand {
    /// Host name.
    pub(crate) name: String,
    /// Command to run remotely; an interactive shell when omitted.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub(crate) command: Vec<String>,
}
