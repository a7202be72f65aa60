//! Local TCP listener relaying each accepted connection through a transport
//! channel.
//!
//! [`Tunnel::open`] binds the listener and returns immediately; a background
//! accept loop spawns one relay per inbound connection. A relay forwards
//! bytes verbatim in both directions until either side reads end-of-stream,
//! then closes both ends. Failing to open a channel drops only that one
//! connection.
//!
//! [`Tunnel::stop`] cancels the accept loop and closes the listener, gives
//! in-flight relays until the drain deadline to finish, aborts whatever is
//! left and joins the worker. Once it returns, connecting to the local port
//! is refused.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::transport::{Transport, TransportError};

const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// Pause after a failed `accept` so persistent errors such as descriptor
/// exhaustion do not spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Bytes moved by one relay.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RelayStats {
    /// Bytes copied from the local socket into the channel.
    pub upstream: u64,
    /// Bytes copied from the channel to the local socket.
    pub downstream: u64,
}

/// Running tunnel; stop it explicitly to wait for the worker.
#[derive(Debug)]
pub struct Tunnel {
    local_addr: SocketAddr,
    remote_host: String,
    remote_port: u16,
    cancel: CancellationToken,
    worker: Option<JoinHandle<()>>,
}

impl Tunnel {
    /// Binds `bind` and starts relaying connections to
    /// `remote_host:remote_port` through `transport`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Bind`] when the listener cannot be bound.
    pub async fn open(
        transport: Arc<dyn Transport>,
        remote_host: &str,
        remote_port: u16,
        bind: SocketAddr,
        drain_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let bind_error = |err: io::Error| TransportError::Bind {
            address: bind,
            message: err.to_string(),
        };
        let listener = TcpListener::bind(bind).await.map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;
        let cancel = CancellationToken::new();
        let destination = Destination {
            transport,
            host: remote_host.to_owned(),
            port: remote_port,
        };
        let worker = tokio::spawn(accept_loop(
            listener,
            destination,
            cancel.clone(),
            drain_timeout,
        ));
        info!(%local_addr, remote_host, remote_port, "tunnel listening");

        Ok(Self {
            local_addr,
            remote_host: remote_host.to_owned(),
            remote_port,
            cancel,
            worker: Some(worker),
        })
    }

    /// Port the listener is bound to.
    #[must_use]
    pub const fn local_port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Address the listener is bound to.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Destination every connection is relayed to.
    #[must_use]
    pub fn remote(&self) -> (&str, u16) {
        (&self.remote_host, self.remote_port)
    }

    /// Returns `true` until [`Tunnel::stop`] has completed.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Stops accepting, drains in-flight relays up to the deadline and joins
    /// the background worker. Calling it again is a no-op.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        let Some(worker) = self.worker.take() else {
            return;
        };
        if let Err(err) = worker.await {
            warn!(local_addr = %self.local_addr, error = %err, "tunnel worker ended abnormally");
        }
        info!(local_addr = %self.local_addr, "tunnel stopped");
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Destination {
    transport: Arc<dyn Transport>,
    host: String,
    port: u16,
}

async fn accept_loop(
    listener: TcpListener,
    destination: Destination,
    cancel: CancellationToken,
    drain_timeout: Duration,
) {
    let shared = Arc::new(destination);
    let mut relays = JoinSet::new();
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    debug!(%peer, "tunnel accepted connection");
                    relays.spawn(relay_connection(socket, peer, Arc::clone(&shared)));
                }
                Err(err) => {
                    warn!(error = %err, "tunnel accept failed");
                    if back_off(&cancel).await {
                        break;
                    }
                }
            },
            Some(finished) = relays.join_next(), if !relays.is_empty() => {
                if let Err(err) = finished {
                    warn!(error = %err, "relay task ended abnormally");
                }
            }
        }
    }
    drop(listener);
    drain(relays, drain_timeout).await;
}

/// Waits out [`ACCEPT_BACKOFF`]; returns `true` if cancelled meanwhile.
async fn back_off(cancel: &CancellationToken) -> bool {
    tokio::select! {
        () = cancel.cancelled() => true,
        () = sleep(ACCEPT_BACKOFF) => false,
    }
}

async fn drain(mut relays: JoinSet<()>, drain_timeout: Duration) {
    if relays.is_empty() {
        return;
    }
    debug!(in_flight = relays.len(), "draining relays");
    let drained = timeout(drain_timeout, async {
        while relays.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(
            aborted = relays.len(),
            "relays still running after drain deadline; aborting"
        );
        relays.abort_all();
        while relays.join_next().await.is_some() {}
    }
}

async fn relay_connection(socket: TcpStream, peer: SocketAddr, destination: Arc<Destination>) {
    let channel = match destination
        .transport
        .open_channel(&destination.host, destination.port, peer)
        .await
    {
        Ok(channel) => channel,
        Err(err) => {
            warn!(%peer, error = %err, "could not open channel; dropping connection");
            return;
        }
    };
    match relay(socket, channel).await {
        Ok(stats) => debug!(
            %peer,
            upstream = stats.upstream,
            downstream = stats.downstream,
            "relay closed"
        ),
        Err(err) => warn!(%peer, error = %err, "relay failed"),
    }
}

/// Copies bytes between `local` and `remote` until either reads
/// end-of-stream, then shuts both down.
///
/// # Errors
///
/// Returns the first read or write error; both ends are still shut down.
pub async fn relay<L, R>(mut local: L, mut remote: R) -> io::Result<RelayStats>
where
    L: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + AsyncWrite + Unpin,
{
    let mut stats = RelayStats::default();
    let result = pump(&mut local, &mut remote, &mut stats).await;
    local.shutdown().await.ok();
    remote.shutdown().await.ok();
    result.map(|()| stats)
}

async fn pump<L, R>(local: &mut L, remote: &mut R, stats: &mut RelayStats) -> io::Result<()>
where
    L: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + AsyncWrite + Unpin,
{
    let mut upstream = vec![0_u8; RELAY_BUFFER_SIZE];
    let mut downstream = vec![0_u8; RELAY_BUFFER_SIZE];
    loop {
        tokio::select! {
            read = local.read(&mut upstream) => {
                let count = read?;
                let Some(chunk) = upstream.get(..count).filter(|chunk| !chunk.is_empty()) else {
                    return Ok(());
                };
                remote.write_all(chunk).await?;
                remote.flush().await?;
                stats.upstream += count as u64;
            }
            read = remote.read(&mut downstream) => {
                let count = read?;
                let Some(chunk) = downstream.get(..count).filter(|chunk| !chunk.is_empty()) else {
                    return Ok(());
                };
                local.write_all(chunk).await?;
                local.flush().await?;
                stats.downstream += count as u64;
            }
        }
    }
}
