//! Newtypes for Scaleway lifecycle values to avoid stringly-typed code.

use std::ops::Deref;

use crate::driver::MachineState;

macro_rules! newtype {
    ($name:ident) => {
        #[derive(Clone, Debug, Eq, PartialEq)]
        pub(crate) struct $name(String);

        impl $name {
            pub(crate) const fn as_str(&self) -> &str {
                self.0.as_str()
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                self.as_str()
            }
        }

        impl Deref for $name {
            type Target = str;
            fn deref(&self) -> &Self::Target {
                self.as_str()
            }
        }
    };
}

newtype!(InstanceId);
newtype!(InstanceState);
newtype!(Action);

impl InstanceState {
    /// Maps the provider state onto the lifecycle enum.
    pub(crate) fn machine_state(&self) -> MachineState {
        match self.as_str() {
            "starting" => MachineState::Starting,
            "running" => MachineState::Running,
            "stopping" => MachineState::Stopping,
            "stopped" | "stopped in place" => MachineState::Stopped,
            _ => MachineState::Error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("starting", MachineState::Starting)]
    #[case("running", MachineState::Running)]
    #[case("stopping", MachineState::Stopping)]
    #[case("stopped", MachineState::Stopped)]
    #[case("stopped in place", MachineState::Stopped)]
    #[case("locked", MachineState::Error)]
    fn provider_states_map_onto_lifecycle(#[case] raw: &str, #[case] expected: MachineState) {
        assert_eq!(InstanceState::from(raw).machine_state(), expected);
    }
}
