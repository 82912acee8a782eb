//! Machine lifecycle states observed by the controller.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle state reported by a driver.
///
/// `Timeout` is never reported by drivers; the controller synthesises it
/// when a state query misses its deadline.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineState {
    /// No state information is available.
    #[default]
    None,
    /// The machine is booting.
    Starting,
    /// The machine is up.
    Running,
    /// The machine is paused.
    Paused,
    /// The machine state was saved to disk.
    Saved,
    /// The machine is shutting down.
    Stopping,
    /// The machine is powered off.
    Stopped,
    /// The provider reports an error state.
    Error,
    /// The state query did not complete in time.
    Timeout,
}

impl MachineState {
    /// Returns the lowercase wire name of the state.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Saved => "saved",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Error => "error",
            Self::Timeout => "timeout",
        }
    }
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MachineState {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let state = match value.to_ascii_lowercase().as_str() {
            "none" | "" => Self::None,
            "starting" => Self::Starting,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "saved" => Self::Saved,
            "stopping" => Self::Stopping,
            "stopped" => Self::Stopped,
            "error" => Self::Error,
            "timeout" => Self::Timeout,
            other => return Err(format!("unknown machine state '{other}'")),
        };
        Ok(state)
    }
}
