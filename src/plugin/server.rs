//! Plugin side of the transport.
//!
//! The reader loop answers `get-version` and `heartbeat` itself and hands
//! driver calls to a single worker task that owns the driver, so driver
//! calls run one at a time while liveness probes are answered immediately.
//! A writer task owns the socket sink and serialises replies.

use std::panic::AssertUnwindSafe;

use futures::{FutureExt, SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::wire::{Call, Fault, Outcome, Reply, Request, Response, decode, encode, framed, salvage_id};
use super::{PROTOCOL_VERSION, TransportError, panic_trap, service_name};
use crate::driver::{Driver, DriverError};

/// Protocol identity a server presents.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Protocol {
    /// Service name the server accepts.
    pub service: String,
    /// Version reported by `get-version`.
    pub version: u32,
}

impl Protocol {
    /// Returns the identity for protocol `version`.
    #[must_use]
    pub fn version(version: u32) -> Self {
        Self {
            service: service_name(version),
            version,
        }
    }
}

impl Default for Protocol {
    fn default() -> Self {
        Self::version(PROTOCOL_VERSION)
    }
}

/// Serves `driver` to the first connection accepted on `listener`.
///
/// # Errors
///
/// Returns [`TransportError::Io`] when the connection cannot be accepted.
pub async fn serve(listener: TcpListener, driver: Box<dyn Driver>) -> Result<(), TransportError> {
    serve_with(listener, driver, Protocol::default()).await
}

/// Serves `driver` speaking `protocol`.
///
/// # Errors
///
/// Returns [`TransportError::Io`] when the connection cannot be accepted.
pub async fn serve_with(
    listener: TcpListener,
    driver: Box<dyn Driver>,
    protocol: Protocol,
) -> Result<(), TransportError> {
    panic_trap::install();
    let (stream, peer) = listener.accept().await?;
    debug!(%peer, service = %protocol.service, "controller connected");
    let (mut sink, mut frames) = framed(stream).split();

    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<Response>();
    let (work_tx, work_rx) = mpsc::unbounded_channel::<Request>();

    let writer = tokio::spawn(async move {
        while let Some(response) = reply_rx.recv().await {
            let frame = match encode(&response) {
                Ok(frame) => frame,
                Err(err) => {
                    warn!(error = %err, "dropping unencodable reply");
                    continue;
                }
            };
            if let Err(err) = sink.send(frame).await {
                warn!(error = %err, "failed to send reply");
                break;
            }
        }
        sink.close().await.ok();
    });
    let worker = tokio::spawn(run_worker(driver, work_rx, reply_tx.clone()));

    while let Some(frame) = frames.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, "controller connection failed");
                break;
            }
        };
        let request: Request = match decode(&frame) {
            Ok(request) => request,
            Err(err) => {
                if let Some(id) = salvage_id(&frame) {
                    let fault = Fault::BadRequest {
                        message: err.to_string(),
                    };
                    reply_tx
                        .send(Response {
                            id,
                            outcome: Outcome::Error(fault),
                        })
                        .ok();
                } else {
                    warn!(error = %err, "ignoring undecodable frame");
                }
                continue;
            }
        };

        if request.service != protocol.service {
            let fault = Fault::UnknownService {
                service: request.service,
            };
            reply_tx
                .send(Response {
                    id: request.id,
                    outcome: Outcome::Error(fault),
                })
                .ok();
            continue;
        }

        let admin = match request.call {
            Call::GetVersion => Some(Reply::Version(protocol.version)),
            Call::Heartbeat | Call::Close => Some(Reply::Unit),
            _ => None,
        };
        match admin {
            Some(reply) => {
                let closing = request.call == Call::Close;
                reply_tx
                    .send(Response {
                        id: request.id,
                        outcome: Outcome::Result(reply),
                    })
                    .ok();
                if closing {
                    info!("close requested");
                    break;
                }
            }
            None => {
                if work_tx.send(request).is_err() {
                    break;
                }
            }
        }
    }

    drop(work_tx);
    worker.abort();
    worker.await.ok();
    drop(reply_tx);
    writer.await.ok();
    Ok(())
}

async fn run_worker(
    mut driver: Box<dyn Driver>,
    mut requests: mpsc::UnboundedReceiver<Request>,
    replies: mpsc::UnboundedSender<Response>,
) {
    while let Some(request) = requests.recv().await {
        let method = request.call.method();
        let outcome = contain(driver.as_mut(), request.call).await;
        if let Outcome::Error(fault) = &outcome {
            debug!(method, ?fault, "driver call failed");
        }
        if replies
            .send(Response {
                id: request.id,
                outcome,
            })
            .is_err()
        {
            break;
        }
    }
}

async fn contain(driver: &mut dyn Driver, call: Call) -> Outcome {
    match AssertUnwindSafe(dispatch(driver, call)).catch_unwind().await {
        Ok(Ok(reply)) => Outcome::Result(reply),
        Ok(Err(err)) => Outcome::Error(Fault::from(&err)),
        Err(payload) => {
            let err = DriverError::Panicked {
                message: panic_trap::describe(payload.as_ref()),
            };
            warn!(error = %err, "driver call panicked");
            Outcome::Error(Fault::from(&err))
        }
    }
}

async fn dispatch(driver: &mut dyn Driver, call: Call) -> Result<Reply, DriverError> {
    let unit = |()| Reply::Unit;
    match call {
        Call::DriverName => driver.driver_name().await.map(Reply::Text),
        Call::MachineName => driver.machine_name().await.map(Reply::Text),
        Call::CreateFlags => driver.create_flags().await.map(Reply::Flags),
        Call::Configure(options) => driver.configure(&options).await.map(unit),
        Call::PreCreateCheck => driver.pre_create_check().await.map(unit),
        Call::Create => driver.create().await.map(unit),
        Call::State => driver.state().await.map(Reply::State),
        Call::Start => driver.start().await.map(unit),
        Call::Stop => driver.stop().await.map(unit),
        Call::Restart => driver.restart().await.map(unit),
        Call::Kill => driver.kill().await.map(unit),
        Call::Remove => driver.remove().await.map(unit),
        Call::GetIp => driver.ip().await.map(Reply::Text),
        Call::GetSshHostname => driver.ssh_hostname().await.map(Reply::Text),
        Call::GetSshPort => driver.ssh_port().await.map(Reply::Port),
        Call::GetSshUsername => driver.ssh_username().await.map(Reply::Text),
        Call::GetSshKeyPath => driver.ssh_key_path().await.map(Reply::Text),
        Call::GetUrl => driver.url().await.map(Reply::Text),
        Call::GetConfigRaw => driver.config_raw().await.map(Reply::Raw),
        Call::SetConfigRaw(raw) => driver.set_config_raw(&raw).await.map(unit),
        Call::GetVersion | Call::Heartbeat | Call::Close => Err(DriverError::provider(
            "administrative calls are answered by the connection loop",
        )),
    }
}
