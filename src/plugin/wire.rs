//! Messages exchanged between the controller and a driver plugin.
//!
//! Every message is one JSON document inside a length-delimited frame (four
//! byte big-endian prefix). Requests name the service they address so the
//! plugin can refuse services it does not speak; responses echo the request
//! id so calls can be multiplexed over one connection.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use super::TransportError;
use crate::driver::{DriverError, DriverOptions, FlagDescriptor, MachineState};
use crate::error::ErrorKind;

/// One RPC request.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Correlation id, unique per connection.
    pub id: u64,
    /// Service name, e.g. `machina.driver.v1`.
    pub service: String,
    /// The method and its parameters.
    pub call: Call,
}

/// RPC methods: one per driver operation plus the administrative calls.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "kebab-case")]
pub enum Call {
    /// Reports the plugin's protocol version.
    GetVersion,
    /// Liveness probe.
    Heartbeat,
    /// Asks the plugin to stop serving.
    Close,
    /// Driver identity.
    DriverName,
    /// Machine name.
    MachineName,
    /// Flag descriptors.
    CreateFlags,
    /// Apply resolved flag values.
    Configure(DriverOptions),
    /// Read-only pre-flight validation.
    PreCreateCheck,
    /// Allocate infrastructure.
    Create,
    /// Query lifecycle state.
    State,
    /// Power on.
    Start,
    /// Power off gracefully.
    Stop,
    /// Reboot.
    Restart,
    /// Power off forcibly.
    Kill,
    /// Release infrastructure.
    Remove,
    /// Machine IP address.
    GetIp,
    /// SSH hostname.
    GetSshHostname,
    /// SSH port.
    GetSshPort,
    /// SSH user.
    GetSshUsername,
    /// SSH private key path.
    GetSshKeyPath,
    /// Container runtime endpoint.
    GetUrl,
    /// Serialised driver state.
    GetConfigRaw,
    /// Replace the driver state.
    SetConfigRaw(Vec<u8>),
}

impl Call {
    /// Returns the wire method name.
    #[must_use]
    pub const fn method(&self) -> &'static str {
        match self {
            Self::GetVersion => "get-version",
            Self::Heartbeat => "heartbeat",
            Self::Close => "close",
            Self::DriverName => "driver-name",
            Self::MachineName => "machine-name",
            Self::CreateFlags => "create-flags",
            Self::Configure(_) => "configure",
            Self::PreCreateCheck => "pre-create-check",
            Self::Create => "create",
            Self::State => "state",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
            Self::Kill => "kill",
            Self::Remove => "remove",
            Self::GetIp => "get-ip",
            Self::GetSshHostname => "get-ssh-hostname",
            Self::GetSshPort => "get-ssh-port",
            Self::GetSshUsername => "get-ssh-username",
            Self::GetSshKeyPath => "get-ssh-key-path",
            Self::GetUrl => "get-url",
            Self::GetConfigRaw => "get-config-raw",
            Self::SetConfigRaw(_) => "set-config-raw",
        }
    }
}

/// One RPC response.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Id of the request being answered.
    pub id: u64,
    /// Result or error.
    pub outcome: Outcome,
}

/// Result of one call.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Outcome {
    /// The call succeeded.
    Result(Reply),
    /// The call failed.
    Error(Fault),
}

/// Successful reply payloads.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "kebab-case")]
pub enum Reply {
    /// No payload.
    Unit,
    /// Protocol version.
    Version(u32),
    /// Text payload.
    Text(String),
    /// TCP port.
    Port(u16),
    /// Lifecycle state.
    State(MachineState),
    /// Flag descriptors.
    Flags(Vec<FlagDescriptor>),
    /// Opaque bytes.
    Raw(Vec<u8>),
}

/// Failure payloads.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "kebab-case")]
pub enum Fault {
    /// The plugin does not serve the requested service name.
    UnknownService {
        /// Service named by the request.
        service: String,
    },
    /// The request could not be decoded.
    BadRequest {
        /// Decoder message.
        message: String,
    },
    /// A driver operation failed or panicked.
    Driver {
        /// Error classification.
        kind: ErrorKind,
        /// Bare error message.
        message: String,
    },
}

impl From<&DriverError> for Fault {
    fn from(err: &DriverError) -> Self {
        Self::Driver {
            kind: err.kind(),
            message: err.message().to_owned(),
        }
    }
}

impl From<Fault> for DriverError {
    fn from(fault: Fault) -> Self {
        match fault {
            Fault::Driver { kind, message } => Self::from_kind(kind, message),
            Fault::UnknownService { service } => Self::IncompatibleDriver {
                message: format!("plugin does not serve {service}"),
            },
            Fault::BadRequest { message } => Self::IncompatibleDriver {
                message: format!("plugin rejected the request: {message}"),
            },
        }
    }
}

/// Frames a TCP stream with a four-byte big-endian length prefix.
#[must_use]
pub fn framed(stream: TcpStream) -> Framed<TcpStream, LengthDelimitedCodec> {
    Framed::new(stream, LengthDelimitedCodec::new())
}

/// Encodes a message into one frame payload.
///
/// # Errors
///
/// Returns [`TransportError::Codec`] when serialisation fails.
pub fn encode<T: Serialize>(message: &T) -> Result<Bytes, TransportError> {
    serde_json::to_vec(message)
        .map(Bytes::from)
        .map_err(|err| TransportError::Codec {
            message: err.to_string(),
        })
}

/// Decodes one frame payload.
///
/// # Errors
///
/// Returns [`TransportError::Codec`] when the payload is not a valid message.
pub fn decode<T: DeserializeOwned>(frame: &[u8]) -> Result<T, TransportError> {
    serde_json::from_slice(frame).map_err(|err| TransportError::Codec {
        message: err.to_string(),
    })
}

/// Extracts the request id from a frame that failed to decode fully.
pub(crate) fn salvage_id(frame: &[u8]) -> Option<u64> {
    serde_json::from_slice::<serde_json::Value>(frame)
        .ok()?
        .get("id")?
        .as_u64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn requests_carry_method_and_params_tags() {
        let request = Request {
            id: 7,
            service: String::from("machina.driver.v1"),
            call: Call::SetConfigRaw(b"{}".to_vec()),
        };
        let value = serde_json::to_value(&request).unwrap_or_else(|err| panic!("encode: {err}"));
        assert_eq!(value["call"]["method"], "set-config-raw");
        assert_eq!(value["call"]["params"], serde_json::json!([123, 125]));
    }

    #[rstest]
    #[case(Call::Heartbeat)]
    #[case(Call::Configure(DriverOptions::new().with("url", crate::driver::FlagValue::String(String::from("tcp://1.2.3.4:2376")))))]
    #[case(Call::GetSshKeyPath)]
    fn method_names_match_the_serialised_tag(#[case] call: Call) {
        let value = serde_json::to_value(&call).unwrap_or_else(|err| panic!("encode: {err}"));
        assert_eq!(value["method"], call.method());
    }

    #[test]
    fn flag_descriptors_survive_a_frame() {
        let reply = Response {
            id: 1,
            outcome: Outcome::Result(Reply::Flags(vec![
                FlagDescriptor::boolean("debug", "verbose"),
                FlagDescriptor::int("port", "SSH port", 22).with_env("PORT"),
                FlagDescriptor::string("url", "engine URL", ""),
                FlagDescriptor::string_list("tag", "tags"),
            ])),
        };
        let frame = encode(&reply).unwrap_or_else(|err| panic!("encode: {err}"));
        let decoded: Response = decode(&frame).unwrap_or_else(|err| panic!("decode: {err}"));
        assert_eq!(decoded, reply);
    }

    #[test]
    fn driver_faults_rebuild_the_original_error() {
        let err = DriverError::unsupported("none", "stop");
        let fault = Fault::from(&err);
        assert_eq!(DriverError::from(fault), err);
    }

    #[test]
    fn salvage_finds_ids_in_partial_requests() {
        assert_eq!(salvage_id(br#"{"id":42,"call":{"method":"fly"}}"#), Some(42));
        assert_eq!(salvage_id(b"not json"), None);
    }
}
