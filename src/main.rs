//! Binary entry point for the Machina CLI.
//!
//! The same executable serves as a driver plugin when launched with the
//! plugin-mode environment variables.

mod cli;

use std::io::{self, Write};
use std::process;

use clap::Parser;
use thiserror::Error;
use tracing::{error, info};

use machina::cert::local_user;
use machina::driver::group_flag_args;
use machina::error::EXIT_FAILURE;
use machina::logging;
use machina::ssh::set_client_kind;
use machina::{
    CertAuthority, ConfigError, Controller, ControllerError, CreateRequest, DefaultConnector,
    DriverError, EngineOptions, ErrorKind, FileStore, HostSummary, HostVerb, MachinaConfig,
    PluginFactory, PluginLauncher, SshClientKind, SwarmOptions, TransportError, VerbReport,
    plugin_request, run_plugin,
};

use cli::{Cli, Command, CreateCommand, ListCommand, ListFormat};

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Controller(#[from] ControllerError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error("failed to encode output: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to write output: {0}")]
    Output(#[from] io::Error),
    #[error("remote command terminated without an exit status")]
    MissingExitCode,
}

impl CliError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(err) => err.kind(),
            Self::Controller(err) => err.kind(),
            Self::Transport(err) => err.kind(),
            Self::Driver(err) => err.kind(),
            Self::Output(_) => ErrorKind::Io,
            Self::Encode(_) | Self::MissingExitCode => ErrorKind::Other,
        }
    }
}

#[tokio::main]
async fn main() {
    if let Some(driver_name) = plugin_request() {
        logging::init(None, false);
        let code = match run_plugin(&driver_name).await {
            Ok(()) => 0,
            Err(err) => {
                error!(driver = %driver_name, error = %err, "plugin failed");
                EXIT_FAILURE
            }
        };
        process::exit(code);
    }

    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            write_error(io::stderr(), &err);
            err.kind().exit_code()
        }
    };
    process::exit(exit_code);
}

async fn dispatch(cli: Cli) -> Result<i32, CliError> {
    let mut config = MachinaConfig::load_without_cli_args()?;
    if let Some(path) = cli.storage_path {
        config.storage_path = path;
    }
    config.native_ssh |= cli.native_ssh;
    config.validate()?;
    logging::init(config.log_filter.as_deref(), true);
    set_client_kind(if config.native_ssh {
        SshClientKind::Native
    } else {
        SshClientKind::External
    });

    let root = config.storage_root()?;
    let store = FileStore::new(root.clone());
    let drivers = PluginFactory::new(PluginLauncher::current_exe()?, root.clone());
    let authority = CertAuthority::new(config.cert_paths(&root), local_user());
    let controller = Controller::new(
        &store,
        &drivers,
        &DefaultConnector,
        &authority,
        config.controller_settings(&root),
    );
    run(&controller, cli.command).await
}

async fn run(controller: &Controller<'_>, command: Command) -> Result<i32, CliError> {
    let mut out = io::stdout().lock();
    match command {
        Command::Create(args) => {
            let request = create_request(args)?;
            let created = controller.create(request).await?;
            info!(machine = %created.host.name, "machine created");
            writeln!(out, "{}", created.host.name)?;
        }
        Command::List(args) => {
            let summaries = controller.list().await?;
            write_list(&mut out, &summaries, &args)?;
        }
        Command::Inspect(args) => {
            let record = controller.inspect(&args.name)?;
            writeln!(out, "{}", serde_json::to_string_pretty(&record)?)?;
        }
        Command::Remove(args) => {
            for name in &args.names {
                controller.remove(name, args.force).await?;
                writeln!(out, "{name}")?;
            }
        }
        Command::Start(args) => run_verb(controller, &args.names, HostVerb::Start).await?,
        Command::Stop(args) => run_verb(controller, &args.names, HostVerb::Stop).await?,
        Command::Restart(args) => run_verb(controller, &args.names, HostVerb::Restart).await?,
        Command::Kill(args) => run_verb(controller, &args.names, HostVerb::Kill).await?,
        Command::Provision(args) => {
            run_verb(controller, &args.names, HostVerb::Provision).await?;
        }
        Command::Upgrade(args) => {
            let reports = controller.for_each(&args.names, HostVerb::Upgrade).await?;
            write_reports(&mut out, &reports, true)?;
        }
        Command::Status(args) => {
            let reports = controller.status_all(&args.names).await?;
            write_reports(&mut out, &reports, false)?;
        }
        Command::Ip(args) => {
            let reports = controller.for_each(&args.names, HostVerb::Ip).await?;
            write_reports(&mut out, &reports, false)?;
        }
        Command::Url(args) => {
            writeln!(out, "{}", controller.url(&args.name).await?)?;
        }
        Command::RegenerateCerts(args) => {
            controller
                .regenerate_certs(&args.names, args.client_certs)
                .await?;
        }
        Command::Ssh(args) => {
            drop(out);
            return controller
                .ssh(&args.name, &args.command)
                .await?
                .ok_or(CliError::MissingExitCode);
        }
    }
    Ok(0)
}

async fn run_verb(
    controller: &Controller<'_>,
    names: &[String],
    verb: HostVerb,
) -> Result<(), CliError> {
    controller.for_each(names, verb).await?;
    Ok(())
}

fn create_request(args: CreateCommand) -> Result<CreateRequest, CliError> {
    let flags = group_flag_args(&args.driver_flags)?;
    let defaults = EngineOptions::default();
    let engine = EngineOptions {
        install_url: args.engine_install_url.unwrap_or_default(),
        env: args.engine_env,
        labels: args.engine_label,
        insecure_registry: args.engine_insecure_registry,
        registry_mirror: args.engine_registry_mirror,
        storage_driver: args.engine_storage_driver.unwrap_or_default(),
        arbitrary_flags: args.engine_opt,
        tls_port: args.engine_port.unwrap_or(defaults.tls_port),
        ..defaults
    };
    Ok(CreateRequest {
        name: args.name,
        driver_name: args.driver,
        flags,
        engine,
        swarm: SwarmOptions::default(),
        extra_sans: args.tls_san,
    })
}

fn write_reports(
    mut target: impl Write,
    reports: &[VerbReport],
    labelled: bool,
) -> io::Result<()> {
    for report in reports {
        let Some(output) = report.output.as_deref() else {
            continue;
        };
        if labelled {
            writeln!(target, "{}: {output}", report.name)?;
        } else {
            writeln!(target, "{output}")?;
        }
    }
    Ok(())
}

fn write_list(
    mut target: impl Write,
    summaries: &[HostSummary],
    args: &ListCommand,
) -> Result<(), CliError> {
    if args.quiet {
        for summary in summaries {
            writeln!(target, "{}", summary.name)?;
        }
        return Ok(());
    }
    match args.format {
        ListFormat::Json => writeln!(target, "{}", serde_json::to_string_pretty(summaries)?)?,
        ListFormat::Table => write_table(target, summaries)?,
    }
    Ok(())
}

fn write_table(mut target: impl Write, summaries: &[HostSummary]) -> io::Result<()> {
    let rows: Vec<[String; 5]> = summaries
        .iter()
        .map(|summary| {
            [
                summary.name.clone(),
                summary.driver_name.clone(),
                summary.state.to_string(),
                summary.url.clone().unwrap_or_default(),
                summary.error.clone().unwrap_or_default(),
            ]
        })
        .collect();
    let header = ["NAME", "DRIVER", "STATE", "URL", "ERRORS"].map(String::from);
    let mut widths = header.clone().map(|title| title.len());
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.len());
        }
    }
    for row in std::iter::once(&header).chain(&rows) {
        let line = row
            .iter()
            .zip(widths)
            .map(|(cell, width)| format!("{cell:<width$}"))
            .collect::<Vec<_>>()
            .join("   ");
        writeln!(target, "{}", line.trim_end())?;
    }
    Ok(())
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "error: {err}").ok();
}
