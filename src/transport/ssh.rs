//! OpenSSH client backed transport.
//!
//! Commands run through a [`CommandRunner`] invoking `ssh` in batch mode.
//! Channels are `ssh -W host:port` child processes whose stdin and stdout
//! carry the relayed bytes, so the remote side opens a `direct-tcpip`
//! channel exactly as an interactive client would.

use std::ffi::OsString;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::fs::OpenOptions;
use cap_std::{ambient_authority, fs_utf8::Dir};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info};

use super::{
    Channel, CommandOutput, CommandRunner, Connector, SshTarget, Transport, TransportError,
    TransportFuture,
};

/// User tried first when no single-sign-on user is configured.
pub const DEFAULT_SSO_USER: &str = "ubuntu";

/// Exit status `ssh` reports for connection and authentication failures.
const SSH_FAILURE_STATUS: i32 = 255;

/// Client options applied to every `ssh` invocation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SshOptions {
    /// Path to the `ssh` executable.
    pub ssh_bin: String,
    /// Whether host keys are verified.
    pub strict_host_key_checking: bool,
    /// Known hosts file.
    pub known_hosts_file: String,
    /// TCP connect timeout in seconds.
    pub connect_timeout_secs: u64,
}

impl SshOptions {
    /// Arguments selecting port, key and client behaviour for `target`,
    /// ending with the `user@host` destination.
    #[must_use]
    pub fn args(&self, target: &SshTarget) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![OsString::from("-p"), OsString::from(target.port.to_string())];
        if let Some(identity) = &target.identity {
            args.push(OsString::from("-i"));
            args.push(OsString::from(identity.as_str()));
            args.push(OsString::from("-o"));
            args.push(OsString::from("IdentitiesOnly=yes"));
        }
        let strict = if self.strict_host_key_checking { "yes" } else { "no" };
        for option in [
            String::from("BatchMode=yes"),
            format!("StrictHostKeyChecking={strict}"),
            format!("UserKnownHostsFile={}", self.known_hosts_file),
            format!("ConnectTimeout={}", self.connect_timeout_secs),
        ] {
            args.push(OsString::from("-o"));
            args.push(OsString::from(option));
        }
        args.push(OsString::from(format!("{}@{}", target.user, target.host)));
        args
    }
}

/// [`Transport`] that shells out to the OpenSSH client.
#[derive(Debug)]
pub struct SshTransport<R> {
    runner: R,
    options: SshOptions,
    target: SshTarget,
    closed: AtomicBool,
}

impl<R> SshTransport<R>
where
    R: CommandRunner,
{
    /// Creates a transport for an already-verified target.
    #[must_use]
    pub const fn new(runner: R, options: SshOptions, target: SshTarget) -> Self {
        Self {
            runner,
            options,
            target,
            closed: AtomicBool::new(false),
        }
    }

    /// Target this transport talks to.
    #[must_use]
    pub const fn target(&self) -> &SshTarget {
        &self.target
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    async fn run_remote(&self, command: &str) -> Result<CommandOutput, TransportError> {
        self.ensure_open()?;
        let mut args = self.options.args(&self.target);
        args.push(OsString::from(command));
        self.runner.run(&self.options.ssh_bin, &args).await
    }

    fn spawn_channel(&self, host: &str, port: u16, peer: SocketAddr) -> Result<Box<dyn Channel>, TransportError> {
        self.ensure_open()?;
        let mut args = self.options.args(&self.target);
        let destination = args.pop();
        args.push(OsString::from("-W"));
        args.push(OsString::from(format!("{host}:{port}")));
        args.extend(destination);

        let channel_error = |message: String| TransportError::Channel {
            host: host.to_owned(),
            port,
            message,
        };
        let mut child = Command::new(&self.options.ssh_bin)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| channel_error(err.to_string()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| channel_error(String::from("ssh stdin unavailable")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| channel_error(String::from("ssh stdout unavailable")))?;
        debug!(%peer, host, port, via = %self.target.host, "channel opened");
        Ok(Box::new(ProcessChannel {
            _child: child,
            stdin,
            stdout,
        }))
    }
}

impl<R> Transport for SshTransport<R>
where
    R: CommandRunner,
{
    fn execute<'a>(&'a self, command: &'a str) -> TransportFuture<'a, CommandOutput> {
        Box::pin(self.run_remote(command))
    }

    fn open_channel<'a>(
        &'a self,
        host: &'a str,
        port: u16,
        peer: SocketAddr,
    ) -> TransportFuture<'a, Box<dyn Channel>> {
        Box::pin(async move { self.spawn_channel(host, port, peer) })
    }

    fn close(&self) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            self.closed.store(true, Ordering::Release);
            Ok(())
        })
    }
}

/// `ssh -W` child process exposed as a byte stream. Dropping the channel
/// kills the child.
#[derive(Debug)]
struct ProcessChannel {
    _child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
}

impl AsyncRead for ProcessChannel {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdout).poll_read(cx, buf)
    }
}

impl AsyncWrite for ProcessChannel {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stdin).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdin).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdin).poll_shutdown(cx)
    }
}

/// [`Connector`] that probes candidate users with `ssh … true`.
///
/// The single-sign-on user (or `ubuntu`) is tried first, then the target's
/// configured user. The first candidate whose probe exits zero wins.
#[derive(Clone, Debug)]
pub struct SshConnector<R> {
    runner: R,
    options: SshOptions,
    sso_username: Option<String>,
}

impl<R> SshConnector<R>
where
    R: CommandRunner + Clone + 'static,
{
    /// Creates a connector.
    #[must_use]
    pub const fn new(runner: R, options: SshOptions, sso_username: Option<String>) -> Self {
        Self {
            runner,
            options,
            sso_username,
        }
    }

    /// Users to try for `target`, in order and without duplicates. The
    /// single-sign-on user authenticates with agent or default keys; only
    /// the configured user carries the target's identity file.
    #[must_use]
    pub fn candidates(&self, target: &SshTarget) -> Vec<SshTarget> {
        let first = self
            .sso_username
            .as_deref()
            .filter(|user| !user.trim().is_empty())
            .unwrap_or(DEFAULT_SSO_USER);
        let mut candidates = vec![SshTarget {
            user: first.to_owned(),
            identity: None,
            ..target.clone()
        }];
        if target.user != first {
            candidates.push(target.clone());
        }
        candidates
    }

    async fn establish(&self, target: &SshTarget) -> Result<Arc<dyn Transport>, TransportError> {
        let candidates = self.candidates(target);
        let mut last_message = String::new();
        for candidate in &candidates {
            let mut args = self.options.args(candidate);
            args.push(OsString::from("true"));
            let output = self.runner.run(&self.options.ssh_bin, &args).await?;
            if output.is_success() {
                info!(host = %candidate.host, user = %candidate.user, "ssh session established");
                let transport: Arc<dyn Transport> = Arc::new(SshTransport::new(
                    self.runner.clone(),
                    self.options.clone(),
                    candidate.clone(),
                ));
                return Ok(transport);
            }
            debug!(
                host = %candidate.host,
                user = %candidate.user,
                code = output.code.unwrap_or(SSH_FAILURE_STATUS),
                "ssh authentication attempt failed"
            );
            last_message = output.stderr.trim().to_owned();
        }
        Err(TransportError::Auth {
            host: target.host.clone(),
            users: candidates
                .iter()
                .map(|candidate| candidate.user.as_str())
                .collect::<Vec<_>>()
                .join(", "),
            message: last_message,
        })
    }
}

impl<R> Connector for SshConnector<R>
where
    R: CommandRunner + Clone + 'static,
{
    fn connect<'a>(&'a self, target: &'a SshTarget) -> TransportFuture<'a, Arc<dyn Transport>> {
        Box::pin(self.establish(target))
    }
}

/// Writes `private_key` to `dir/name` readable only by the owner and
/// returns the path.
///
/// # Errors
///
/// Returns [`TransportError::KeyFile`] when the directory or file cannot be
/// written.
pub fn write_private_key(
    dir: &Utf8Path,
    name: &str,
    private_key: &str,
) -> Result<Utf8PathBuf, TransportError> {
    let path = dir.join(name);
    let io_error = |message: String| TransportError::KeyFile {
        path: path.clone(),
        message,
    };
    Dir::create_ambient_dir_all(dir, ambient_authority()).map_err(|err| io_error(err.to_string()))?;
    let handle =
        Dir::open_ambient_dir(dir, ambient_authority()).map_err(|err| io_error(err.to_string()))?;
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use cap_std::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = handle
        .open_with(name, &options)
        .map_err(|err| io_error(err.to_string()))?;
    file.write_all(private_key.as_bytes())
        .map_err(|err| io_error(err.to_string()))?;
    Ok(path)
}

/// Removes a key written by [`write_private_key`]; a missing file is not an
/// error.
///
/// # Errors
///
/// Returns [`TransportError::KeyFile`] on other I/O failures.
pub fn remove_private_key(path: &Utf8Path) -> Result<(), TransportError> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    let Some(name) = path.file_name() else {
        return Ok(());
    };
    let io_error = |message: String| TransportError::KeyFile {
        path: path.to_path_buf(),
        message,
    };
    let handle = match Dir::open_ambient_dir(parent, ambient_authority()) {
        Ok(handle) => handle,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(io_error(err.to_string())),
    };
    match handle.remove_file(name) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_error(err.to_string())),
    }
}
