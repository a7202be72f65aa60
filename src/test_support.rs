//! Test support utilities shared across unit and integration tests.
//!
//! [`MemoryProvider`] keeps resources in memory and records every mutation,
//! [`DirectTransport`] opens plain TCP channels instead of going through a
//! remote host, and [`ScriptedRunner`] returns pre-seeded command outputs.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::env;
use std::ffi::OsString;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};
use tokio::task::JoinHandle;

use crate::config::{Document, Settings};
use crate::provider::{
    Provider, ProviderError, ProviderFuture, Resource, ResourceAction, ResourceKind, ResourceSpec,
};
use crate::task::TaskContext;
use crate::transport::{
    Channel, CommandOutput, CommandRunner, Connector, SshTarget, Transport, TransportError,
    TransportFuture,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Settings with fast polling suitable for tests.
#[must_use]
pub fn settings() -> Settings {
    Settings {
        ssh_bin: String::from("ssh"),
        sso_username: None,
        ssh_strict_host_key_checking: false,
        ssh_known_hosts_file: String::from("/dev/null"),
        ssh_connect_timeout_secs: 1,
        key_dir: env::temp_dir().join("contractor-test-keys").to_string_lossy().into_owned(),
        poll_interval_secs: 0,
        active_timeout_secs: 5,
        floating_ip_settle_secs: 0,
        tunnel_bind_address: String::from("127.0.0.1"),
        tunnel_port: 0,
        tunnel_drain_timeout_secs: 1,
    }
}

/// Task context wired to in-memory collaborators.
#[must_use]
pub fn task_context(
    document: Document,
    environment: &str,
    provider: &MemoryProvider,
    connector: &DirectConnector,
) -> TaskContext {
    TaskContext::new(
        environment,
        Arc::new(document),
        Arc::new(settings()),
        Arc::new(provider.clone()),
        Arc::new(connector.clone()),
    )
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
        self.push_output(Some(0), "", "");
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32) {
        self.push_output(Some(code), "", "simulated failure");
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        lock(&self.responses).push_back(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        });
    }
}

impl CommandRunner for ScriptedRunner {
    fn run<'a>(&'a self, program: &'a str, args: &'a [OsString]) -> TransportFuture<'a, CommandOutput> {
        lock(&self.invocations).push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
        });
        let response = lock(&self.responses)
            .pop_front()
            .ok_or_else(|| TransportError::Spawn {
                program: program.to_owned(),
                message: String::from("no scripted response available"),
            });
        Box::pin(std::future::ready(response))
    }
}

/// Mutation recorded by [`MemoryProvider`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Operation {
    /// A resource was created.
    Create {
        /// Kind created.
        kind: ResourceKind,
        /// Name of the new resource.
        name: String,
    },
    /// A resource was deleted.
    Delete {
        /// Kind deleted.
        kind: ResourceKind,
        /// Name of the deleted resource.
        name: String,
    },
    /// An action was applied.
    Perform {
        /// Kind acted upon.
        kind: ResourceKind,
        /// Name of the target resource.
        name: String,
        /// Action label.
        action: &'static str,
    },
}

#[derive(Debug, Default)]
struct MemoryState {
    resources: BTreeMap<ResourceKind, Vec<Resource>>,
    operations: Vec<Operation>,
    next_id: u64,
    activation_polls: u32,
    pending_polls: HashMap<String, u32>,
    interfaces: BTreeSet<(String, String)>,
    failures: Vec<(ResourceKind, String, ProviderError)>,
}

impl MemoryState {
    fn allocate_id(&mut self, kind: ResourceKind) -> String {
        self.next_id += 1;
        format!("{}-{}", kind.as_str().replace(' ', "-"), self.next_id)
    }

    fn take_failure(&mut self, kind: ResourceKind, name: &str) -> Option<ProviderError> {
        let position = self
            .failures
            .iter()
            .position(|(k, n, _)| *k == kind && n == name)?;
        Some(self.failures.swap_remove(position).2)
    }

    fn store_status(&mut self, kind: ResourceKind, id: &str, status: &str) {
        if let Some(resource) = self
            .resources
            .get_mut(&kind)
            .and_then(|items| items.iter_mut().find(|resource| resource.id == id))
        {
            resource.status = Some(status.to_owned());
        }
    }

    fn find(&self, kind: ResourceKind, id: &str) -> Option<&Resource> {
        self.resources
            .get(&kind)
            .and_then(|items| items.iter().find(|resource| resource.id == id))
    }
}

/// In-memory [`Provider`] with deterministic identifiers and an operation
/// log. Servers report `BUILD` for a configurable number of polls before
/// turning `ACTIVE`.
#[derive(Clone, Debug, Default)]
pub struct MemoryProvider {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryProvider {
    /// Creates an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `get` polls a new server spends in `BUILD`.
    #[must_use]
    pub fn with_activation_polls(self, polls: u32) -> Self {
        lock(&self.state).activation_polls = polls;
        self
    }

    /// Adds an existing resource without logging an operation.
    pub fn seed(&self, kind: ResourceKind, name: &str) -> Resource {
        let mut state = lock(&self.state);
        let id = state.allocate_id(kind);
        let mut resource = Resource::new(id.clone(), name);
        resource.attributes = serde_json::json!({ "id": id, "name": name });
        if kind == ResourceKind::Server {
            resource.status = Some(String::from("ACTIVE"));
        }
        state.resources.entry(kind).or_default().push(resource.clone());
        resource
    }

    /// Adds an existing resource with extra attributes.
    pub fn seed_with(&self, kind: ResourceKind, name: &str, attributes: Value) -> Resource {
        let mut resource = self.seed(kind, name);
        let mut state = lock(&self.state);
        if let Some(stored) = state
            .resources
            .get_mut(&kind)
            .and_then(|items| items.iter_mut().find(|item| item.id == resource.id))
        {
            if let (Some(target), Some(extra)) = (stored.attributes.as_object_mut(), attributes.as_object()) {
                for (key, value) in extra {
                    target.insert(key.clone(), value.clone());
                }
            }
            resource = stored.clone();
        }
        resource
    }

    /// Pins the status of `kind`/`id`, cancelling any pending activation.
    pub fn set_status(&self, kind: ResourceKind, id: &str, status: &str) {
        let mut state = lock(&self.state);
        state.pending_polls.remove(id);
        state.store_status(kind, id, status);
    }

    /// Makes the next operation touching `kind`/`name` fail with `error`.
    pub fn fail_on(&self, kind: ResourceKind, name: &str, error: ProviderError) {
        lock(&self.state)
            .failures
            .push((kind, name.to_owned(), error));
    }

    /// Snapshot of resources of `kind`.
    #[must_use]
    pub fn resources(&self, kind: ResourceKind) -> Vec<Resource> {
        lock(&self.state)
            .resources
            .get(&kind)
            .cloned()
            .unwrap_or_default()
    }

    /// Names of resources of `kind`, sorted.
    #[must_use]
    pub fn names(&self, kind: ResourceKind) -> Vec<String> {
        let mut names: Vec<String> = self
            .resources(kind)
            .into_iter()
            .map(|resource| resource.name)
            .collect();
        names.sort();
        names
    }

    /// Every mutation performed so far.
    #[must_use]
    pub fn operations(&self) -> Vec<Operation> {
        lock(&self.state).operations.clone()
    }

    /// Router/subnet id pairs currently attached.
    #[must_use]
    pub fn interfaces(&self) -> Vec<(String, String)> {
        lock(&self.state).interfaces.iter().cloned().collect()
    }

    fn list_now(&self, kind: ResourceKind) -> Result<Vec<Resource>, ProviderError> {
        Ok(self.resources(kind))
    }

    fn get_now(&self, kind: ResourceKind, id: &str) -> Result<Resource, ProviderError> {
        let mut state = lock(&self.state);
        let mut resource = state
            .find(kind, id)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound {
                kind,
                id: id.to_owned(),
            })?;
        if let Some(remaining) = state.pending_polls.get_mut(id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Ok(resource);
            }
            state.pending_polls.remove(id);
            resource.status = Some(String::from("ACTIVE"));
            state.store_status(kind, id, "ACTIVE");
        }
        Ok(resource)
    }

    fn create_now(&self, kind: ResourceKind, spec: &ResourceSpec) -> Result<Resource, ProviderError> {
        let mut state = lock(&self.state);
        if let Some(err) = state.take_failure(kind, &spec.name) {
            return Err(err);
        }
        let generated = state.allocate_id(kind);
        let name = match kind {
            ResourceKind::FloatingIp => format!("203.0.113.{}", state.next_id),
            _ => spec.name.clone(),
        };
        let id = if kind == ResourceKind::Keypair {
            name.clone()
        } else {
            generated
        };
        let mut attributes = spec.attributes.clone();
        attributes.insert(String::from("id"), Value::String(id.clone()));
        attributes.insert(String::from("name"), Value::String(name.clone()));
        if kind == ResourceKind::Keypair && !attributes.contains_key("public_key") {
            attributes.insert(
                String::from("private_key"),
                Value::String(String::from("-----BEGIN TEST KEY-----")),
            );
        }
        let mut resource = Resource::new(id.clone(), name.clone());
        resource.attributes = Value::Object(attributes);
        if kind == ResourceKind::Server {
            resource.status = Some(String::from("BUILD"));
            let polls = state.activation_polls;
            state.pending_polls.insert(id, polls);
        }
        state
            .resources
            .entry(kind)
            .or_default()
            .push(resource.clone());
        state.operations.push(Operation::Create { kind, name });
        Ok(resource)
    }

    fn delete_now(&self, kind: ResourceKind, id: &str) -> Result<(), ProviderError> {
        let mut state = lock(&self.state);
        let name = state
            .find(kind, id)
            .map(|resource| resource.name.clone())
            .ok_or_else(|| ProviderError::NotFound {
                kind,
                id: id.to_owned(),
            })?;
        if let Some(err) = state.take_failure(kind, &name) {
            return Err(err);
        }
        if let Some(items) = state.resources.get_mut(&kind) {
            items.retain(|resource| resource.id != id);
        }
        state.operations.push(Operation::Delete { kind, name });
        Ok(())
    }

    fn perform_now(
        &self,
        kind: ResourceKind,
        id: &str,
        action: &ResourceAction,
    ) -> Result<(), ProviderError> {
        let mut state = lock(&self.state);
        let name = state
            .find(kind, id)
            .map(|resource| resource.name.clone())
            .ok_or_else(|| ProviderError::NotFound {
                kind,
                id: id.to_owned(),
            })?;
        if let Some(err) = state.take_failure(kind, &name) {
            return Err(err);
        }
        match action {
            ResourceAction::AddRouterInterface { subnet_id } => {
                if !state.interfaces.insert((id.to_owned(), subnet_id.clone())) {
                    return Err(ProviderError::Api {
                        status: 400,
                        message: format!("Router {id} already has a port on subnet {subnet_id}"),
                    });
                }
            }
            ResourceAction::RemoveRouterInterface { subnet_id } => {
                if !state.interfaces.remove(&(id.to_owned(), subnet_id.clone())) {
                    return Err(ProviderError::NotFound {
                        kind: ResourceKind::Subnet,
                        id: subnet_id.clone(),
                    });
                }
            }
            ResourceAction::AddFloatingIp { .. } => {}
        }
        state.operations.push(Operation::Perform {
            kind,
            name,
            action: action.label(),
        });
        Ok(())
    }
}

impl Provider for MemoryProvider {
    fn list(&self, kind: ResourceKind) -> ProviderFuture<'_, Vec<Resource>> {
        Box::pin(std::future::ready(self.list_now(kind)))
    }

    fn get<'a>(&'a self, kind: ResourceKind, id: &'a str) -> ProviderFuture<'a, Resource> {
        Box::pin(std::future::ready(self.get_now(kind, id)))
    }

    fn create<'a>(
        &'a self,
        kind: ResourceKind,
        spec: &'a ResourceSpec,
    ) -> ProviderFuture<'a, Resource> {
        Box::pin(std::future::ready(self.create_now(kind, spec)))
    }

    fn delete<'a>(&'a self, kind: ResourceKind, id: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(std::future::ready(self.delete_now(kind, id)))
    }

    fn perform<'a>(
        &'a self,
        kind: ResourceKind,
        id: &'a str,
        action: &'a ResourceAction,
    ) -> ProviderFuture<'a, ()> {
        Box::pin(std::future::ready(self.perform_now(kind, id, action)))
    }
}

#[derive(Debug, Default)]
struct DirectState {
    routes: HashMap<(String, u16), SocketAddr>,
    refused: BTreeSet<String>,
    fail_next_channels: usize,
    channels: Vec<(String, u16, SocketAddr)>,
    commands: Vec<String>,
    responses: VecDeque<CommandOutput>,
}

/// [`Transport`] that opens channels as direct TCP connections.
///
/// Destinations may be routed to local listeners with
/// [`DirectTransport::route`], which stands in for a private address only
/// reachable from the remote host.
#[derive(Clone, Debug, Default)]
pub struct DirectTransport {
    state: Arc<Mutex<DirectState>>,
    closed: Arc<AtomicBool>,
}

impl DirectTransport {
    /// Creates a transport with no routes.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sends channels for `host:port` to `target`.
    #[must_use]
    pub fn route(self, host: &str, port: u16, target: SocketAddr) -> Self {
        lock(&self.state)
            .routes
            .insert((host.to_owned(), port), target);
        self
    }

    /// Rejects every channel to `host`.
    #[must_use]
    pub fn refuse(self, host: &str) -> Self {
        lock(&self.state).refused.insert(host.to_owned());
        self
    }

    /// Fails the next `count` channel opens regardless of destination.
    pub fn fail_next_channels(&self, count: usize) {
        lock(&self.state).fail_next_channels = count;
    }

    /// Queues the output of the next executed command.
    pub fn push_output(&self, output: CommandOutput) {
        lock(&self.state).responses.push_back(output);
    }

    /// Destinations and peers of every channel opened.
    #[must_use]
    pub fn channels(&self) -> Vec<(String, u16, SocketAddr)> {
        lock(&self.state).channels.clone()
    }

    /// Commands executed so far.
    #[must_use]
    pub fn commands(&self) -> Vec<String> {
        lock(&self.state).commands.clone()
    }

    /// Returns `true` once closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// A new session sharing routes and logs but with its own closed flag.
    #[must_use]
    pub fn session(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            closed: Arc::default(),
        }
    }

    fn destination(&self, host: &str, port: u16, peer: SocketAddr) -> Result<String, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut state = lock(&self.state);
        let reject = |message: &str| TransportError::Channel {
            host: host.to_owned(),
            port,
            message: message.to_owned(),
        };
        if state.fail_next_channels > 0 {
            state.fail_next_channels -= 1;
            return Err(reject("administratively prohibited"));
        }
        if state.refused.contains(host) {
            return Err(reject("connect failed"));
        }
        state.channels.push((host.to_owned(), port, peer));
        Ok(state
            .routes
            .get(&(host.to_owned(), port))
            .map_or_else(|| format!("{host}:{port}"), ToString::to_string))
    }
}

impl Transport for DirectTransport {
    fn execute<'a>(&'a self, command: &'a str) -> TransportFuture<'a, CommandOutput> {
        let result = if self.is_closed() {
            Err(TransportError::Closed)
        } else {
            let mut state = lock(&self.state);
            state.commands.push(command.to_owned());
            Ok(state.responses.pop_front().unwrap_or(CommandOutput {
                code: Some(0),
                stdout: String::new(),
                stderr: String::new(),
            }))
        };
        Box::pin(std::future::ready(result))
    }

    fn open_channel<'a>(
        &'a self,
        host: &'a str,
        port: u16,
        peer: SocketAddr,
    ) -> TransportFuture<'a, Box<dyn Channel>> {
        Box::pin(async move {
            let address = self.destination(host, port, peer)?;
            let stream = TcpStream::connect(&address)
                .await
                .map_err(|err| TransportError::Channel {
                    host: host.to_owned(),
                    port,
                    message: err.to_string(),
                })?;
            let channel: Box<dyn Channel> = Box::new(stream);
            Ok(channel)
        })
    }

    fn close(&self) -> TransportFuture<'_, ()> {
        self.closed.store(true, Ordering::Release);
        Box::pin(std::future::ready(Ok(())))
    }
}

/// [`Connector`] handing out sessions of one [`DirectTransport`] and
/// recording every target it was asked for.
#[derive(Clone, Debug, Default)]
pub struct DirectConnector {
    transport: DirectTransport,
    targets: Arc<Mutex<Vec<SshTarget>>>,
    sessions: Arc<Mutex<Vec<DirectTransport>>>,
}

impl DirectConnector {
    /// Creates a connector around `transport`.
    #[must_use]
    pub fn new(transport: DirectTransport) -> Self {
        Self {
            transport,
            targets: Arc::default(),
            sessions: Arc::default(),
        }
    }

    /// The shared transport.
    #[must_use]
    pub const fn transport(&self) -> &DirectTransport {
        &self.transport
    }

    /// Targets requested so far.
    #[must_use]
    pub fn targets(&self) -> Vec<SshTarget> {
        lock(&self.targets).clone()
    }

    /// Sessions handed out so far, in connection order.
    #[must_use]
    pub fn sessions(&self) -> Vec<DirectTransport> {
        lock(&self.sessions).clone()
    }
}

impl Connector for DirectConnector {
    fn connect<'a>(&'a self, target: &'a SshTarget) -> TransportFuture<'a, Arc<dyn Transport>> {
        lock(&self.targets).push(target.clone());
        let session = self.transport.session();
        lock(&self.sessions).push(session.clone());
        let transport: Arc<dyn Transport> = Arc::new(session);
        Box::pin(std::future::ready(Ok(transport)))
    }
}

/// Starts a TCP server echoing every byte back until the client closes.
///
/// # Errors
///
/// Returns the bind error.
pub async fn spawn_echo_server() -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let address = listener.local_addr()?;
    let handle = tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.split();
                tokio::io::copy(&mut reader, &mut writer).await.ok();
            });
        }
    });
    Ok((address, handle))
}

/// Starts a TCP server answering each line with `reply` followed by a
/// newline, as a shell running `whoami` would.
///
/// # Errors
///
/// Returns the bind error.
pub async fn spawn_line_server(reply: &str) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let address = listener.local_addr()?;
    let answer: Arc<str> = Arc::from(format!("{reply}\n"));
    let handle = tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let line = Arc::clone(&answer);
            tokio::spawn(async move {
                let (reader, mut writer) = socket.into_split();
                let mut lines = BufReader::new(reader).lines();
                while let Ok(Some(_)) = lines.next_line().await {
                    if writer.write_all(line.as_bytes()).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    Ok((address, handle))
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
