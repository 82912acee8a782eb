//! Test support utilities shared across unit and integration tests.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};

use crate::command::{CommandError, CommandFuture, CommandOutput, CommandRunner};
use crate::driver::{
    BaseDriver, Driver, DriverError, DriverFuture, DriverOptions, FlagDescriptor, MachineState,
    decode_config, encode_config,
};
use crate::controller::DriverFactory;
use crate::host::HostRecord;
use crate::ssh::{SshClient, SshConnector, SshFuture, SshTarget};
use crate::store::{HostStore, StoreError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn output(code: Option<i32>, stdout: impl Into<String>, stderr: impl Into<String>) -> CommandOutput {
    CommandOutput {
        code,
        stdout: stdout.into(),
        stderr: stderr.into(),
    }
}

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Arc<Mutex<VecDeque<CommandOutput>>>,
    invocations: Arc<Mutex<Vec<CommandInvocation>>>,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        lock(&self.invocations).clone()
    }

    /// Pushes a successful exit status.
    pub fn push_success(&self) {
        lock(&self.responses).push_back(output(Some(0), "", ""));
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32) {
        lock(&self.responses).push_back(output(Some(code), "", "simulated failure"));
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        lock(&self.responses).push_back(output(code, stdout, stderr));
    }

    fn next(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, CommandError> {
        lock(&self.invocations).push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
        });
        lock(&self.responses)
            .pop_front()
            .ok_or_else(|| CommandError::Spawn {
                program: program.to_owned(),
                message: String::from("no scripted response available"),
            })
    }
}

impl CommandRunner for ScriptedRunner {
    fn run<'a>(
        &'a self,
        program: &'a str,
        args: &'a [OsString],
    ) -> CommandFuture<'a, CommandOutput> {
        let result = self.next(program, args);
        Box::pin(std::future::ready(result))
    }

    fn run_attached<'a>(
        &'a self,
        program: &'a str,
        args: &'a [OsString],
    ) -> CommandFuture<'a, Option<i32>> {
        let result = self.next(program, args).map(|out| out.code);
        Box::pin(std::future::ready(result))
    }
}

#[derive(Debug)]
struct SshRule {
    needle: String,
    once: bool,
    output: CommandOutput,
}

#[derive(Debug, Default)]
struct SshScript {
    rules: Vec<SshRule>,
    commands: Vec<String>,
    targets: Vec<SshTarget>,
}

/// Scripted SSH endpoint answering commands by substring rules.
///
/// One-shot rules are consulted first, in insertion order, then persistent
/// rules, newest first. Commands matching no rule succeed with empty output.
/// Clones share state, so a connector can hand out clients while the test
/// keeps a handle for assertions.
#[derive(Clone, Debug, Default)]
pub struct ScriptedSsh {
    script: Arc<Mutex<SshScript>>,
}

impl ScriptedSsh {
    /// Creates an endpoint with no rules.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers every command containing `needle` with the given output.
    pub fn respond(&self, needle: &str, code: i32, stdout: &str) {
        lock(&self.script).rules.push(SshRule {
            needle: needle.to_owned(),
            once: false,
            output: output(Some(code), stdout, ""),
        });
    }

    /// Answers the next command containing `needle` with the given output.
    pub fn respond_once(&self, needle: &str, code: i32, stdout: &str, stderr: &str) {
        lock(&self.script).rules.push(SshRule {
            needle: needle.to_owned(),
            once: true,
            output: output(Some(code), stdout, stderr),
        });
    }

    /// Returns every command run so far.
    #[must_use]
    pub fn commands(&self) -> Vec<String> {
        lock(&self.script).commands.clone()
    }

    /// Returns the targets clients were created for.
    #[must_use]
    pub fn targets(&self) -> Vec<SshTarget> {
        lock(&self.script).targets.clone()
    }

    /// Returns `true` when any command contains `needle`.
    #[must_use]
    pub fn ran(&self, needle: &str) -> bool {
        lock(&self.script)
            .commands
            .iter()
            .any(|command| command.contains(needle))
    }

    fn answer(&self, command: &str) -> CommandOutput {
        let mut script = lock(&self.script);
        script.commands.push(command.to_owned());
        if let Some(index) = script
            .rules
            .iter()
            .position(|rule| rule.once && command.contains(&rule.needle))
        {
            return script.rules.remove(index).output;
        }
        script
            .rules
            .iter()
            .rev()
            .find(|rule| !rule.once && command.contains(&rule.needle))
            .map_or_else(|| output(Some(0), "", ""), |rule| rule.output.clone())
    }
}

impl SshClient for ScriptedSsh {
    fn output<'a>(&'a self, command: &'a str) -> SshFuture<'a, CommandOutput> {
        let answer = self.answer(command);
        Box::pin(std::future::ready(Ok(answer)))
    }

    fn shell<'a>(&'a self, args: &'a [String]) -> SshFuture<'a, Option<i32>> {
        let answer = self.answer(&args.join(" "));
        Box::pin(std::future::ready(Ok(answer.code)))
    }
}

impl SshConnector for ScriptedSsh {
    fn connect(&self, target: SshTarget) -> Box<dyn SshClient> {
        lock(&self.script).targets.push(target);
        Box::new(self.clone())
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Guard that holds the env mutex and cleans up variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: AsyncMutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}

#[derive(Debug, Default)]
struct FakeControls {
    calls: Vec<String>,
    failures: HashMap<(String, String), DriverError>,
    panics: HashSet<(String, String)>,
    delays: HashMap<(String, String), Duration>,
    allocated: HashMap<String, u32>,
    closes: HashMap<String, u32>,
    states: HashMap<String, MachineState>,
}

/// Shared switchboard steering every [`FakeDriver`] built from it.
///
/// Controls are keyed by machine name and operation name (`create`,
/// `state`, `stop`, ...), so one switchboard can drive a whole fleet.
#[derive(Clone, Debug, Default)]
pub struct FakeBehaviour {
    controls: Arc<Mutex<FakeControls>>,
}

impl FakeBehaviour {
    /// Creates a switchboard with no failures configured.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `operation` on `machine` fail with `error`.
    pub fn fail(&self, machine: &str, operation: &str, error: DriverError) {
        lock(&self.controls)
            .failures
            .insert((machine.to_owned(), operation.to_owned()), error);
    }

    /// Makes `operation` on `machine` panic.
    pub fn panic_on(&self, machine: &str, operation: &str) {
        lock(&self.controls)
            .panics
            .insert((machine.to_owned(), operation.to_owned()));
    }

    /// Delays `operation` on `machine` before it runs.
    pub fn delay(&self, machine: &str, operation: &str, delay: Duration) {
        lock(&self.controls)
            .delays
            .insert((machine.to_owned(), operation.to_owned()), delay);
    }

    /// Sets the infrastructure state of `machine`.
    pub fn set_state(&self, machine: &str, state: MachineState) {
        lock(&self.controls)
            .states
            .insert(machine.to_owned(), state);
    }

    /// Returns the infrastructure state of `machine`.
    #[must_use]
    pub fn state_of(&self, machine: &str) -> MachineState {
        lock(&self.controls)
            .states
            .get(machine)
            .copied()
            .unwrap_or_default()
    }

    /// Returns every `machine:operation` call so far.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        lock(&self.controls).calls.clone()
    }

    /// Returns the calls made for `machine`, without the machine prefix.
    #[must_use]
    pub fn calls_for(&self, machine: &str) -> Vec<String> {
        let prefix = format!("{machine}:");
        self.calls()
            .into_iter()
            .filter_map(|call| call.strip_prefix(&prefix).map(str::to_owned))
            .collect()
    }

    /// Returns how many resources remain allocated for `machine`.
    #[must_use]
    pub fn allocated(&self, machine: &str) -> u32 {
        lock(&self.controls)
            .allocated
            .get(machine)
            .copied()
            .unwrap_or(0)
    }

    /// Returns how often drivers for `machine` were closed.
    #[must_use]
    pub fn closes(&self, machine: &str) -> u32 {
        lock(&self.controls)
            .closes
            .get(machine)
            .copied()
            .unwrap_or(0)
    }

    async fn enter(&self, machine: &str, operation: &str) -> Result<(), DriverError> {
        let key = (machine.to_owned(), operation.to_owned());
        let (delay, panics, failure) = {
            let mut controls = lock(&self.controls);
            controls.calls.push(format!("{machine}:{operation}"));
            (
                controls.delays.get(&key).copied(),
                controls.panics.contains(&key),
                controls.failures.get(&key).cloned(),
            )
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        assert!(!panics, "fake driver told to panic during {operation}");
        failure.map_or(Ok(()), Err)
    }

    fn update(&self, machine: &str, apply: impl FnOnce(&mut FakeControls)) {
        let mut controls = lock(&self.controls);
        apply(&mut controls);
        controls.states.entry(machine.to_owned()).or_default();
    }
}

/// Address every [`FakeDriver`] reports.
pub const FAKE_IP: &str = "192.0.2.10";

/// In-memory driver whose infrastructure lives in a [`FakeBehaviour`].
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FakeDriver {
    /// Shared driver attributes.
    #[serde(flatten)]
    pub base: BaseDriver,
    /// Value of the `fake-label` flag.
    #[serde(default)]
    pub label: String,
    #[serde(skip)]
    behaviour: FakeBehaviour,
}

impl FakeDriver {
    /// Registry name reported by the fake.
    pub const NAME: &'static str = "fake";

    /// Creates a fake for `machine_name` steered by `behaviour`.
    #[must_use]
    pub fn new(machine_name: &str, behaviour: FakeBehaviour) -> Self {
        let mut base = BaseDriver::new(machine_name, Utf8Path::new("/tmp/machina-fake"));
        base.ip_address = String::from(FAKE_IP);
        base.ssh_key_path = String::from("/tmp/machina-fake/id_rsa");
        Self {
            base,
            label: String::new(),
            behaviour,
        }
    }

    fn name(&self) -> &str {
        &self.base.machine_name
    }

    async fn transition(&mut self, operation: &str, target: MachineState) -> Result<(), DriverError> {
        self.behaviour.enter(self.name(), operation).await?;
        let machine = self.name().to_owned();
        self.behaviour.update(&machine, |controls| {
            controls.states.insert(machine.clone(), target);
        });
        Ok(())
    }
}

impl Driver for FakeDriver {
    fn driver_name(&self) -> DriverFuture<'_, String> {
        Box::pin(async { Ok(Self::NAME.to_owned()) })
    }

    fn machine_name(&self) -> DriverFuture<'_, String> {
        Box::pin(async move { Ok(self.base.machine_name.clone()) })
    }

    fn create_flags(&self) -> DriverFuture<'_, Vec<FlagDescriptor>> {
        Box::pin(async {
            Ok(vec![
                FlagDescriptor::string("fake-label", "label recorded by the fake", "plain")
                    .with_env("FAKE_LABEL"),
            ])
        })
    }

    fn configure<'a>(&'a mut self, options: &'a DriverOptions) -> DriverFuture<'a, ()> {
        Box::pin(async move {
            self.behaviour.enter(self.name(), "configure").await?;
            self.label = options.string("fake-label").unwrap_or_default().to_owned();
            Ok(())
        })
    }

    fn pre_create_check(&self) -> DriverFuture<'_, ()> {
        Box::pin(self.behaviour.enter(self.name(), "pre-create-check"))
    }

    fn create(&mut self) -> DriverFuture<'_, ()> {
        Box::pin(async move {
            let machine = self.name().to_owned();
            self.behaviour.update(&machine, |controls| {
                *controls.allocated.entry(machine.clone()).or_default() += 1;
            });
            self.behaviour.enter(&machine, "create").await?;
            if self.base.ip_address.is_empty() {
                self.base.ip_address = String::from(FAKE_IP);
            }
            self.behaviour.update(&machine, |controls| {
                controls.states.insert(machine.clone(), MachineState::Running);
            });
            Ok(())
        })
    }

    fn state(&self) -> DriverFuture<'_, MachineState> {
        Box::pin(async move {
            self.behaviour.enter(self.name(), "state").await?;
            Ok(self.behaviour.state_of(self.name()))
        })
    }

    fn start(&mut self) -> DriverFuture<'_, ()> {
        Box::pin(self.transition("start", MachineState::Running))
    }

    fn stop(&mut self) -> DriverFuture<'_, ()> {
        Box::pin(self.transition("stop", MachineState::Stopped))
    }

    fn restart(&mut self) -> DriverFuture<'_, ()> {
        Box::pin(self.transition("restart", MachineState::Running))
    }

    fn kill(&mut self) -> DriverFuture<'_, ()> {
        Box::pin(self.transition("kill", MachineState::Stopped))
    }

    fn remove(&mut self) -> DriverFuture<'_, ()> {
        Box::pin(async move {
            self.behaviour.enter(self.name(), "remove").await?;
            let machine = self.name().to_owned();
            self.behaviour.update(&machine, |controls| {
                controls.allocated.remove(&machine);
                controls.states.insert(machine.clone(), MachineState::None);
            });
            Ok(())
        })
    }

    fn ip(&self) -> DriverFuture<'_, String> {
        Box::pin(async move {
            self.behaviour.enter(self.name(), "ip").await?;
            Ok(self.base.ip_address.clone())
        })
    }

    fn ssh_hostname(&self) -> DriverFuture<'_, String> {
        Box::pin(async move { Ok(self.base.ip_address.clone()) })
    }

    fn ssh_port(&self) -> DriverFuture<'_, u16> {
        Box::pin(async move { Ok(self.base.ssh_port()) })
    }

    fn ssh_username(&self) -> DriverFuture<'_, String> {
        Box::pin(async move { Ok(self.base.ssh_user()) })
    }

    fn ssh_key_path(&self) -> DriverFuture<'_, String> {
        Box::pin(async move { Ok(self.base.ssh_key_path.clone()) })
    }

    fn url(&self) -> DriverFuture<'_, String> {
        Box::pin(async move {
            self.behaviour.enter(self.name(), "url").await?;
            let state = self.behaviour.state_of(self.name());
            if state != MachineState::Running {
                return Err(DriverError::NotRunning {
                    message: format!("{} is {state}", self.name()),
                });
            }
            Ok(format!("tcp://{}:2376", self.base.ip_address))
        })
    }

    fn config_raw(&self) -> DriverFuture<'_, Vec<u8>> {
        Box::pin(async move { encode_config(self) })
    }

    fn set_config_raw<'a>(&'a mut self, raw: &'a [u8]) -> DriverFuture<'a, ()> {
        Box::pin(async move {
            let decoded: Self = decode_config(raw)?;
            self.base = decoded.base;
            self.label = decoded.label;
            Ok(())
        })
    }

    fn close(&mut self) -> DriverFuture<'_, ()> {
        Box::pin(async move {
            let machine = self.name().to_owned();
            *lock(&self.behaviour.controls)
                .closes
                .entry(machine)
                .or_default() += 1;
            Ok(())
        })
    }
}

/// Opens [`FakeDriver`]s sharing one [`FakeBehaviour`].
#[derive(Clone, Debug, Default)]
pub struct FakeDriverFactory {
    behaviour: FakeBehaviour,
}

impl FakeDriverFactory {
    /// Creates a factory whose drivers are steered by `behaviour`.
    #[must_use]
    pub const fn new(behaviour: FakeBehaviour) -> Self {
        Self { behaviour }
    }
}

impl DriverFactory for FakeDriverFactory {
    fn open<'a>(
        &'a self,
        driver_name: &'a str,
        machine_name: &'a str,
    ) -> DriverFuture<'a, Box<dyn Driver>> {
        Box::pin(async move {
            if driver_name != FakeDriver::NAME {
                return Err(DriverError::config(format!(
                    "driver \"{driver_name}\" not found"
                )));
            }
            let driver: Box<dyn Driver> =
                Box::new(FakeDriver::new(machine_name, self.behaviour.clone()));
            Ok(driver)
        })
    }
}

#[derive(Debug, Default)]
struct MemoryContents {
    records: BTreeMap<String, HostRecord>,
    saves: Vec<String>,
}

/// Host store kept in memory, recording every save.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    contents: Arc<Mutex<MemoryContents>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the host names passed to `save`, in call order.
    #[must_use]
    pub fn saves(&self) -> Vec<String> {
        lock(&self.contents).saves.clone()
    }

    /// Returns the stored record for `name`, if any.
    #[must_use]
    pub fn record(&self, name: &str) -> Option<HostRecord> {
        lock(&self.contents).records.get(name).cloned()
    }
}

impl HostStore for MemoryStore {
    fn save(&self, record: &HostRecord) -> Result<(), StoreError> {
        let mut contents = lock(&self.contents);
        contents.saves.push(record.name.clone());
        contents.records.insert(record.name.clone(), record.clone());
        Ok(())
    }

    fn load(&self, name: &str) -> Result<HostRecord, StoreError> {
        self.record(name).ok_or_else(|| StoreError::NotFound {
            name: name.to_owned(),
        })
    }

    fn exists(&self, name: &str) -> Result<bool, StoreError> {
        Ok(lock(&self.contents).records.contains_key(name))
    }

    fn list_names(&self) -> Result<Vec<String>, StoreError> {
        Ok(lock(&self.contents).records.keys().cloned().collect())
    }

    fn remove(&self, name: &str) -> Result<(), StoreError> {
        lock(&self.contents).records.remove(name);
        Ok(())
    }
}
