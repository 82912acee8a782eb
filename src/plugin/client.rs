//! Controller side of the transport.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::launcher::PluginProcess;
use super::wire::{Call, Fault, Outcome, Reply, Request, Response, decode, encode, framed};
use super::{PROTOCOL_VERSION, service_name};
use crate::driver::{
    Driver, DriverError, DriverFuture, DriverOptions, FlagDescriptor, MachineState,
};

/// Interval between heartbeats.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(250);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Connection tuning.
#[derive(Clone, Debug)]
pub struct ClientOptions {
    /// Protocol version to try first.
    pub protocol_version: u32,
    /// Heartbeat period; one missed heartbeat tears the connection down.
    pub heartbeat_interval: Duration,
    /// Machine name used to tag log events.
    pub machine_name: String,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            machine_name: String::new(),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Shared {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<Outcome>>>,
    outgoing: mpsc::UnboundedSender<Request>,
    cancel: CancellationToken,
    failure: Mutex<Option<String>>,
}

impl Shared {
    fn fail(&self, reason: &str) {
        {
            let mut failure = lock(&self.failure);
            if failure.is_none() {
                *failure = Some(reason.to_owned());
            }
        }
        self.cancel.cancel();
        lock(&self.pending).clear();
    }

    fn unreachable(&self) -> DriverError {
        let reason = lock(&self.failure)
            .clone()
            .unwrap_or_else(|| String::from("connection closed"));
        DriverError::PluginUnreachable { message: reason }
    }

    async fn roundtrip(&self, service: &str, call: Call) -> Result<Outcome, DriverError> {
        if self.cancel.is_cancelled() {
            return Err(self.unreachable());
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id, tx);
        let request = Request {
            id,
            service: service.to_owned(),
            call,
        };
        if self.outgoing.send(request).is_err() {
            lock(&self.pending).remove(&id);
            return Err(self.unreachable());
        }

        tokio::select! {
            outcome = rx => outcome.map_err(|_| self.unreachable()),
            () = self.cancel.cancelled() => {
                lock(&self.pending).remove(&id);
                Err(self.unreachable())
            }
        }
    }
}

/// Driver handle that forwards every operation to a plugin process.
pub struct RpcClientDriver {
    shared: Arc<Shared>,
    service: String,
    tasks: Vec<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
    process: Option<PluginProcess>,
    closed: bool,
}

impl RpcClientDriver {
    /// Connects to a plugin listening on `address` and negotiates the
    /// protocol.
    ///
    /// The TCP connection is retried once.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::PluginUnreachable`] when the plugin cannot be
    /// reached and [`DriverError::IncompatibleDriver`] when neither the
    /// current nor the previous protocol is spoken.
    pub async fn connect(address: SocketAddr, options: ClientOptions) -> Result<Self, DriverError> {
        let stream = match TcpStream::connect(address).await {
            Ok(stream) => stream,
            Err(first) => {
                debug!(%address, error = %first, "retrying plugin connection");
                sleep(CONNECT_RETRY_DELAY).await;
                TcpStream::connect(address)
                    .await
                    .map_err(|err| DriverError::PluginUnreachable {
                        message: format!("cannot connect to plugin at {address}: {err}"),
                    })?
            }
        };
        stream.set_nodelay(true).ok();

        let (outgoing, requests) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            outgoing,
            cancel: CancellationToken::new(),
            failure: Mutex::new(None),
        });

        let (sink, frames) = framed(stream).split();
        let mut client = Self {
            tasks: vec![
                tokio::spawn(write_loop(Arc::clone(&shared), sink, requests)),
                tokio::spawn(read_loop(Arc::clone(&shared), frames)),
            ],
            shared,
            service: service_name(options.protocol_version),
            heartbeat: None,
            process: None,
            closed: false,
        };

        if let Err(err) = client.negotiate(options.protocol_version).await {
            client.shared.cancel.cancel();
            return Err(err);
        }
        client.heartbeat = Some(tokio::spawn(heartbeat_loop(
            Arc::clone(&client.shared),
            client.service.clone(),
            options.heartbeat_interval,
            options.machine_name,
        )));
        Ok(client)
    }

    /// Attaches the child process so [`Driver::close`] can reap it.
    #[must_use]
    pub fn with_process(mut self, process: PluginProcess) -> Self {
        self.process = Some(process);
        self
    }

    /// Returns the service name in use after negotiation.
    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }

    async fn negotiate(&mut self, version: u32) -> Result<(), DriverError> {
        let current = service_name(version);
        match self.shared.roundtrip(&current, Call::GetVersion).await? {
            Outcome::Result(Reply::Version(reported)) if reported == version => {
                self.service = current;
                return Ok(());
            }
            Outcome::Result(other) => {
                return Err(DriverError::IncompatibleDriver {
                    message: format!("plugin answered get-version with {other:?}, expected {version}"),
                });
            }
            Outcome::Error(Fault::UnknownService { .. }) => {}
            Outcome::Error(fault) => return Err(fault.into()),
        }

        let Some(previous_version) = version.checked_sub(1) else {
            return Err(DriverError::IncompatibleDriver {
                message: format!("plugin does not serve {current}"),
            });
        };
        let previous = service_name(previous_version);
        match self.shared.roundtrip(&previous, Call::GetVersion).await? {
            Outcome::Result(Reply::Version(reported)) if reported == previous_version => {
                info!(from = %current, to = %previous, "downgrading plugin protocol");
                self.service = previous;
                Ok(())
            }
            Outcome::Result(other) => Err(DriverError::IncompatibleDriver {
                message: format!(
                    "plugin answered get-version with {other:?}, expected {previous_version}"
                ),
            }),
            Outcome::Error(_) => Err(DriverError::IncompatibleDriver {
                message: format!("plugin serves neither {current} nor {previous}"),
            }),
        }
    }

    async fn invoke(&self, call: Call) -> Result<Reply, DriverError> {
        let method = call.method();
        match self.shared.roundtrip(&self.service, call).await? {
            Outcome::Result(reply) => Ok(reply),
            Outcome::Error(fault) => {
                debug!(method, ?fault, "plugin call failed");
                Err(fault.into())
            }
        }
    }

    async fn unit(&self, call: Call) -> Result<(), DriverError> {
        match self.invoke(call).await? {
            Reply::Unit => Ok(()),
            other => Err(unexpected("unit", &other)),
        }
    }

    async fn text(&self, call: Call) -> Result<String, DriverError> {
        match self.invoke(call).await? {
            Reply::Text(text) => Ok(text),
            other => Err(unexpected("text", &other)),
        }
    }

    async fn close_connection(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
        if !self.shared.cancel.is_cancelled() {
            let goodbye = self.shared.roundtrip(&self.service, Call::Close);
            if timeout(CLOSE_TIMEOUT, goodbye).await.is_err() {
                debug!("plugin did not acknowledge close");
            }
        }
        self.shared.fail("connection closed");
        if let Some(process) = self.process.take() {
            process.shutdown().await;
        }
    }
}

impl Drop for RpcClientDriver {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
        for task in self.tasks.iter().chain(&self.heartbeat) {
            task.abort();
        }
    }
}

fn unexpected(expected: &str, reply: &Reply) -> DriverError {
    DriverError::IncompatibleDriver {
        message: format!("expected a {expected} reply, got {reply:?}"),
    }
}

async fn write_loop(
    shared: Arc<Shared>,
    mut sink: futures::stream::SplitSink<
        tokio_util::codec::Framed<TcpStream, tokio_util::codec::LengthDelimitedCodec>,
        bytes::Bytes,
    >,
    mut requests: mpsc::UnboundedReceiver<Request>,
) {
    loop {
        let request = tokio::select! {
            () = shared.cancel.cancelled() => break,
            request = requests.recv() => request,
        };
        let Some(request) = request else { break };
        let frame = match encode(&request) {
            Ok(frame) => frame,
            Err(err) => {
                if let Some(tx) = lock(&shared.pending).remove(&request.id) {
                    let fault = Fault::BadRequest {
                        message: err.to_string(),
                    };
                    tx.send(Outcome::Error(fault)).ok();
                }
                continue;
            }
        };
        if let Err(err) = sink.send(frame).await {
            shared.fail(&format!("failed to send to plugin: {err}"));
            break;
        }
    }
    sink.close().await.ok();
}

async fn read_loop(
    shared: Arc<Shared>,
    mut frames: futures::stream::SplitStream<
        tokio_util::codec::Framed<TcpStream, tokio_util::codec::LengthDelimitedCodec>,
    >,
) {
    loop {
        let frame = tokio::select! {
            () = shared.cancel.cancelled() => break,
            frame = frames.next() => frame,
        };
        match frame {
            Some(Ok(frame)) => match decode::<Response>(&frame) {
                Ok(response) => {
                    if let Some(tx) = lock(&shared.pending).remove(&response.id) {
                        tx.send(response.outcome).ok();
                    }
                }
                Err(err) => warn!(error = %err, "ignoring undecodable plugin reply"),
            },
            Some(Err(err)) => {
                shared.fail(&format!("plugin connection failed: {err}"));
                break;
            }
            None => {
                shared.fail("plugin closed the connection");
                break;
            }
        }
    }
}

async fn heartbeat_loop(
    shared: Arc<Shared>,
    service: String,
    period: Duration,
    machine_name: String,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    loop {
        tokio::select! {
            () = shared.cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let beat = timeout(period, shared.roundtrip(&service, Call::Heartbeat)).await;
        if matches!(beat, Ok(Ok(Outcome::Result(Reply::Unit)))) {
            continue;
        }
        warn!(machine = %machine_name, "plugin missed a heartbeat; treating it as dead");
        shared.fail(&format!(
            "plugin for {machine_name} missed a heartbeat after {}s",
            period.as_secs_f64()
        ));
        break;
    }
}

impl Driver for RpcClientDriver {
    fn driver_name(&self) -> DriverFuture<'_, String> {
        Box::pin(self.text(Call::DriverName))
    }

    fn machine_name(&self) -> DriverFuture<'_, String> {
        Box::pin(self.text(Call::MachineName))
    }

    fn create_flags(&self) -> DriverFuture<'_, Vec<FlagDescriptor>> {
        Box::pin(async move {
            match self.invoke(Call::CreateFlags).await? {
                Reply::Flags(flags) => Ok(flags),
                other => Err(unexpected("flags", &other)),
            }
        })
    }

    fn configure<'a>(&'a mut self, options: &'a DriverOptions) -> DriverFuture<'a, ()> {
        Box::pin(self.unit(Call::Configure(options.clone())))
    }

    fn pre_create_check(&self) -> DriverFuture<'_, ()> {
        Box::pin(self.unit(Call::PreCreateCheck))
    }

    fn create(&mut self) -> DriverFuture<'_, ()> {
        Box::pin(self.unit(Call::Create))
    }

    fn state(&self) -> DriverFuture<'_, MachineState> {
        Box::pin(async move {
            match self.invoke(Call::State).await? {
                Reply::State(state) => Ok(state),
                other => Err(unexpected("state", &other)),
            }
        })
    }

    fn start(&mut self) -> DriverFuture<'_, ()> {
        Box::pin(self.unit(Call::Start))
    }

    fn stop(&mut self) -> DriverFuture<'_, ()> {
        Box::pin(self.unit(Call::Stop))
    }

    fn restart(&mut self) -> DriverFuture<'_, ()> {
        Box::pin(self.unit(Call::Restart))
    }

    fn kill(&mut self) -> DriverFuture<'_, ()> {
        Box::pin(self.unit(Call::Kill))
    }

    fn remove(&mut self) -> DriverFuture<'_, ()> {
        Box::pin(self.unit(Call::Remove))
    }

    fn ip(&self) -> DriverFuture<'_, String> {
        Box::pin(self.text(Call::GetIp))
    }

    fn ssh_hostname(&self) -> DriverFuture<'_, String> {
        Box::pin(self.text(Call::GetSshHostname))
    }

    fn ssh_port(&self) -> DriverFuture<'_, u16> {
        Box::pin(async move {
            match self.invoke(Call::GetSshPort).await? {
                Reply::Port(port) => Ok(port),
                other => Err(unexpected("port", &other)),
            }
        })
    }

    fn ssh_username(&self) -> DriverFuture<'_, String> {
        Box::pin(self.text(Call::GetSshUsername))
    }

    fn ssh_key_path(&self) -> DriverFuture<'_, String> {
        Box::pin(self.text(Call::GetSshKeyPath))
    }

    fn url(&self) -> DriverFuture<'_, String> {
        Box::pin(self.text(Call::GetUrl))
    }

    fn config_raw(&self) -> DriverFuture<'_, Vec<u8>> {
        Box::pin(async move {
            match self.invoke(Call::GetConfigRaw).await? {
                Reply::Raw(raw) => Ok(raw),
                other => Err(unexpected("raw", &other)),
            }
        })
    }

    fn set_config_raw<'a>(&'a mut self, raw: &'a [u8]) -> DriverFuture<'a, ()> {
        Box::pin(self.unit(Call::SetConfigRaw(raw.to_vec())))
    }

    fn close(&mut self) -> DriverFuture<'_, ()> {
        Box::pin(async move {
            self.close_connection().await;
            Ok(())
        })
    }
}
