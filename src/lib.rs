//! Core library for the Machina container-host manager.
//!
//! The crate creates, provisions and manages remote hosts running a
//! container runtime. Infrastructure access goes through a [`Driver`]
//! contract, served out of process by a plugin child of the same binary;
//! provisioning reaches hosts over SSH and secures the runtime with
//! certificates minted by a local [`CertAuthority`]. The [`Controller`]
//! ties drivers, provisioning and the on-disk [`FileStore`] together.

pub mod cert;
pub mod command;
pub mod config;
pub mod controller;
pub mod driver;
pub mod error;
pub mod files;
pub mod host;
pub mod logging;
pub mod options;
pub mod plugin;
pub mod provision;
pub mod scaleway;
pub mod ssh;
pub mod store;
pub mod test_support;

pub use cert::{CertAuthority, CertError, CertPaths};
pub use config::{ConfigError, MachinaConfig};
pub use controller::{
    Controller, ControllerError, ControllerSettings, CreateRequest, Created, DriverFactory,
    HostSummary, HostVerb, InProcessFactory, PluginFactory, VerbReport,
};
pub use driver::{Driver, DriverError, DriverOptions, FlagDescriptor, MachineState};
pub use error::ErrorKind;
pub use host::{Host, HostError, HostRecord};
pub use options::{AuthOptions, EngineOptions, SwarmOptions};
pub use plugin::{PluginLauncher, TransportError, plugin_request, run_plugin};
pub use provision::{ProvisionError, ProvisionReport};
pub use ssh::{DefaultConnector, SshClientKind, SshError};
pub use store::{FileStore, HostStore, StoreError};
