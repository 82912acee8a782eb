//! Applying one verb across many hosts.

use std::fmt;

use futures::{StreamExt, stream};
use tracing::info;

use super::{Controller, ControllerError, close, natural_cmp};
use crate::host::{Host, HostError};

/// Verbs that can be fanned out across hosts.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HostVerb {
    /// Power on.
    Start,
    /// Graceful power off.
    Stop,
    /// Restart.
    Restart,
    /// Immediate power off.
    Kill,
    /// Reinstall the container runtime.
    Upgrade,
    /// Mint and place a new server certificate.
    RegenerateCerts,
    /// Rerun the provisioning sequence.
    Provision,
    /// Report the IP address.
    Ip,
    /// Report the machine state.
    Status,
}

impl HostVerb {
    /// Returns the command name of the verb.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
            Self::Kill => "kill",
            Self::Upgrade => "upgrade",
            Self::RegenerateCerts => "regenerate-certs",
            Self::Provision => "provision",
            Self::Ip => "ip",
            Self::Status => "status",
        }
    }
}

impl fmt::Display for HostVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Successful outcome of a verb on one host.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VerbReport {
    /// Host name.
    pub name: String,
    /// Value the verb produces, such as an IP address or a state.
    pub output: Option<String>,
}

/// Failure of a verb on one host.
#[derive(Debug)]
pub struct HostFailure {
    /// Host name.
    pub name: String,
    /// What went wrong.
    pub error: ControllerError,
}

impl fmt::Display for HostFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.error)
    }
}

impl Controller<'_> {
    /// Applies `verb` to every host in `names`, at most
    /// `fanout_limit` at a time.
    ///
    /// Hosts already in the requested state count as successes. Every host
    /// that succeeds is saved.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::Fanout`] with one entry per failing host;
    /// a failing host never stops its siblings.
    pub async fn for_each(
        &self,
        names: &[String],
        verb: HostVerb,
    ) -> Result<Vec<VerbReport>, ControllerError> {
        let outcomes: Vec<(String, Result<Option<String>, ControllerError>)> =
            stream::iter(names.iter().cloned())
                .map(|name| async move {
                    let outcome = self.apply(&name, verb).await;
                    (name, outcome)
                })
                .buffer_unordered(self.settings.fanout_limit.max(1))
                .collect()
                .await;

        let mut reports = Vec::new();
        let mut failures = Vec::new();
        for (name, outcome) in outcomes {
            match outcome {
                Ok(output) => reports.push(VerbReport { name, output }),
                Err(error) => failures.push(HostFailure { name, error }),
            }
        }
        if failures.is_empty() {
            reports.sort_by(|left, right| natural_cmp(&left.name, &right.name));
            Ok(reports)
        } else {
            failures.sort_by(|left, right| natural_cmp(&left.name, &right.name));
            Err(ControllerError::Fanout { failures })
        }
    }

    /// Reports the state of every host in `names`.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::Fanout`] for hosts whose state cannot be
    /// queried.
    pub async fn status_all(&self, names: &[String]) -> Result<Vec<VerbReport>, ControllerError> {
        self.for_each(names, HostVerb::Status).await
    }

    /// Places new server certificates on every host in `names`, replacing
    /// the CA pair first when `also_ca` is set.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::Cert`] when the CA cannot be replaced and
    /// [`ControllerError::Fanout`] for hosts that fail.
    pub async fn regenerate_certs(
        &self,
        names: &[String],
        also_ca: bool,
    ) -> Result<Vec<VerbReport>, ControllerError> {
        if also_ca {
            self.authority.regenerate()?;
        }
        self.for_each(names, HostVerb::RegenerateCerts).await
    }

    async fn apply(&self, name: &str, verb: HostVerb) -> Result<Option<String>, ControllerError> {
        let mut host = self.load(name).await?;
        let result = match self.run_verb(&mut host, verb).await {
            Err(HostError::AlreadyInState { state, .. }) => {
                info!(machine = name, %state, "machine is already in the requested state");
                Ok(None)
            }
            other => other,
        };
        let saved = if result.is_ok() {
            self.save(&mut host).await
        } else {
            Ok(())
        };
        close(&mut host).await;
        let output = result?;
        saved?;
        Ok(output)
    }

    async fn run_verb(&self, host: &mut Host, verb: HostVerb) -> Result<Option<String>, HostError> {
        let services = self.services();
        match verb {
            HostVerb::Start => host.start().await.map(|()| None),
            HostVerb::Stop => host.stop().await.map(|()| None),
            HostVerb::Restart => host.restart().await.map(|()| None),
            HostVerb::Kill => host.kill().await.map(|()| None),
            HostVerb::Upgrade => host.upgrade(services).await.map(Some),
            HostVerb::RegenerateCerts => host.regenerate_certs(services, false).await.map(|()| None),
            HostVerb::Provision => host.provision(services).await.map(|_| None),
            HostVerb::Ip => host.ip().await.map(Some),
            HostVerb::Status => host.state().await.map(|state| Some(state.to_string())),
        }
    }
}
