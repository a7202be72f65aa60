//! Remote transport used to run commands on, and tunnel through, hosts the
//! orchestrator provisions.
//!
//! A [`Transport`] is an authenticated session to one host that can execute
//! commands and open byte channels to destinations reachable from that host.
//! A [`Connection`] wraps a transport together with the tunnels it owns so
//! that disconnecting stops every tunnel before the transport closes.

use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::tunnel::Tunnel;

mod command;
pub mod ssh;

pub use command::{CommandOutput, CommandRunner, ProcessCommandRunner};
pub use ssh::{SshConnector, SshOptions, SshTransport};

/// Default grace period for relays once a tunnel stops.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors raised by transports, connectors and tunnels.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TransportError {
    /// Every authentication attempt was rejected.
    #[error("could not authenticate to {host} as {users}: {message}")]
    Auth {
        /// Host that refused the session.
        host: String,
        /// Users tried, in order.
        users: String,
        /// Diagnostic from the last attempt.
        message: String,
    },
    /// A helper process could not be started.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Program name.
        program: String,
        /// Underlying I/O message.
        message: String,
    },
    /// A channel to the destination could not be opened.
    #[error("failed to open channel to {host}:{port}: {message}")]
    Channel {
        /// Destination host.
        host: String,
        /// Destination port.
        port: u16,
        /// Underlying message.
        message: String,
    },
    /// A tunnel listener could not be bound.
    #[error("failed to bind tunnel listener on {address}: {message}")]
    Bind {
        /// Requested address.
        address: SocketAddr,
        /// Underlying I/O message.
        message: String,
    },
    /// A private key file could not be written or removed.
    #[error("failed to manage key file {path}: {message}")]
    KeyFile {
        /// Key file path.
        path: Utf8PathBuf,
        /// Underlying I/O message.
        message: String,
    },
    /// The transport was already closed.
    #[error("transport is closed")]
    Closed,
}

/// Bidirectional byte stream opened through a transport.
pub trait Channel: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> Channel for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Future returned by transport operations.
pub type TransportFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, TransportError>> + Send + 'a>>;

/// Authenticated session to a remote host.
pub trait Transport: Send + Sync {
    /// Runs `command` on the remote host.
    fn execute<'a>(&'a self, command: &'a str) -> TransportFuture<'a, CommandOutput>;

    /// Opens a channel from the remote host to `host:port` on behalf of the
    /// local `peer`.
    fn open_channel<'a>(
        &'a self,
        host: &'a str,
        port: u16,
        peer: SocketAddr,
    ) -> TransportFuture<'a, Box<dyn Channel>>;

    /// Closes the session; later calls fail with [`TransportError::Closed`].
    fn close(&self) -> TransportFuture<'_, ()>;
}

/// Where and as whom to connect.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SshTarget {
    /// Host name or address.
    pub host: String,
    /// SSH port.
    pub port: u16,
    /// Configured login user.
    pub user: String,
    /// Private key to authenticate with.
    pub identity: Option<Utf8PathBuf>,
}

impl SshTarget {
    /// Targets `user@host` on port 22 without an explicit key.
    #[must_use]
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 22,
            user: user.into(),
            identity: None,
        }
    }

    /// Overrides the port.
    #[must_use]
    pub const fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the private key.
    #[must_use]
    pub fn with_identity(mut self, identity: Utf8PathBuf) -> Self {
        self.identity = Some(identity);
        self
    }
}

/// Establishes transports, applying the authentication fallback policy.
pub trait Connector: Send + Sync {
    /// Connects to `target`.
    fn connect<'a>(&'a self, target: &'a SshTarget) -> TransportFuture<'a, Arc<dyn Transport>>;
}

/// A transport plus the tunnels opened through it.
pub struct Connection {
    transport: Arc<dyn Transport>,
    tunnels: Mutex<Vec<Tunnel>>,
    bind: SocketAddr,
    drain_timeout: Duration,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("bind", &self.bind)
            .field("drain_timeout", &self.drain_timeout)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Wraps an established transport. Tunnels bind to `127.0.0.1` on an
    /// ephemeral port unless overridden.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            tunnels: Mutex::new(Vec::new()),
            bind: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    /// Overrides the address tunnels listen on.
    #[must_use]
    pub const fn with_bind_address(mut self, bind: SocketAddr) -> Self {
        self.bind = bind;
        self
    }

    /// Overrides how long in-flight relays may run once a tunnel stops.
    #[must_use]
    pub const fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// The underlying transport.
    #[must_use]
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Runs `command` on the remote host.
    ///
    /// # Errors
    ///
    /// Propagates the transport's error.
    pub async fn execute(&self, command: &str) -> Result<CommandOutput, TransportError> {
        self.transport.execute(command).await
    }

    /// Opens a tunnel to `host:port` and returns the local port to connect
    /// to. The accept loop runs in the background.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Bind`] when the listener cannot be bound.
    pub async fn tunnel(&self, host: &str, port: u16) -> Result<u16, TransportError> {
        let tunnel = Tunnel::open(
            Arc::clone(&self.transport),
            host,
            port,
            self.bind,
            self.drain_timeout,
        )
        .await?;
        let local_port = tunnel.local_port();
        self.tunnels.lock().await.push(tunnel);
        Ok(local_port)
    }

    /// Stops the tunnel listening on `local_port`. Returns `false` when no
    /// such tunnel is open.
    pub async fn stop_tunnel(&self, local_port: u16) -> bool {
        let mut tunnels = self.tunnels.lock().await;
        let Some(position) = tunnels.iter().position(|t| t.local_port() == local_port) else {
            return false;
        };
        let mut tunnel = tunnels.swap_remove(position);
        drop(tunnels);
        tunnel.stop().await;
        true
    }

    /// Number of open tunnels.
    pub async fn tunnel_count(&self) -> usize {
        self.tunnels.lock().await.len()
    }

    /// Stops every tunnel, then closes the transport.
    ///
    /// # Errors
    ///
    /// Propagates the transport's close error.
    pub async fn disconnect(&self) -> Result<(), TransportError> {
        let tunnels: Vec<Tunnel> = self.tunnels.lock().await.drain(..).collect();
        if !tunnels.is_empty() {
            debug!(count = tunnels.len(), "stopping tunnels before disconnect");
        }
        for mut tunnel in tunnels {
            tunnel.stop().await;
        }
        self.transport.close().await?;
        info!("transport disconnected");
        Ok(())
    }
}
