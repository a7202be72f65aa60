//! BDD step definitions for SSH tunnels.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use contractor::test_support::spawn_line_server;
use contractor::transport::{Connection, Transport};
use rstest_bdd_macros::{given, then, when};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use super::test_helpers::TunnelContext;

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Transport(#[from] contractor::TransportError),
    #[error("assertion failed: {0}")]
    Assertion(String),
}

fn connection(tunnel_context: &TunnelContext) -> Result<Arc<Connection>, StepError> {
    tunnel_context
        .connection
        .clone()
        .ok_or_else(|| StepError::Assertion(String::from("no connection established")))
}

fn local_address(tunnel_context: &TunnelContext) -> Result<SocketAddr, StepError> {
    let port = tunnel_context
        .local_port
        .ok_or_else(|| StepError::Assertion(String::from("no tunnel opened")))?;
    Ok(SocketAddr::from((Ipv4Addr::LOCALHOST, port)))
}

#[given("a private host \"{host}\" answering \"{reply}\" on port {port}")]
fn private_host(
    mut tunnel_context: TunnelContext,
    host: String,
    reply: String,
    port: u16,
) -> Result<TunnelContext, StepError> {
    let (address, _server) = tunnel_context
        .runtime
        .block_on(spawn_line_server(&reply))?;
    tunnel_context.transport = tunnel_context.transport.route(&host, port, address);
    let transport: Arc<dyn Transport> = Arc::new(tunnel_context.transport.clone());
    tunnel_context.connection = Some(Arc::new(Connection::new(transport)));
    Ok(tunnel_context)
}

#[when("a tunnel is opened to \"{host}\" port {port}")]
fn tunnel_opened(
    mut tunnel_context: TunnelContext,
    host: String,
    port: u16,
) -> Result<TunnelContext, StepError> {
    let connection = connection(&tunnel_context)?;
    let local_port = tunnel_context
        .runtime
        .block_on(async move { connection.tunnel(&host, port).await })?;
    tunnel_context.local_port = Some(local_port);
    Ok(tunnel_context)
}

#[when("a client sends \"{line}\" through the tunnel")]
fn client_sends(
    mut tunnel_context: TunnelContext,
    line: String,
) -> Result<TunnelContext, StepError> {
    let address = local_address(&tunnel_context)?;
    let received = tunnel_context.runtime.block_on(async move {
        let mut stream = TcpStream::connect(address).await?;
        stream.write_all(format!("{line}\n").as_bytes()).await?;
        let mut reply = String::new();
        BufReader::new(stream).read_line(&mut reply).await?;
        Ok::<_, std::io::Error>(reply)
    })?;
    tunnel_context.received = Some(received);
    Ok(tunnel_context)
}

#[when("the tunnel is stopped")]
fn tunnel_stopped(tunnel_context: TunnelContext) -> Result<TunnelContext, StepError> {
    let connection = connection(&tunnel_context)?;
    let address = local_address(&tunnel_context)?;
    let stopped = tunnel_context
        .runtime
        .block_on(async move { connection.stop_tunnel(address.port()).await });
    if stopped {
        Ok(tunnel_context)
    } else {
        Err(StepError::Assertion(String::from("tunnel was not running")))
    }
}

#[when("the connection is disconnected")]
fn connection_disconnected(tunnel_context: TunnelContext) -> Result<TunnelContext, StepError> {
    let connection = connection(&tunnel_context)?;
    tunnel_context
        .runtime
        .block_on(async move { connection.disconnect().await })?;
    Ok(tunnel_context)
}

#[then("the client receives \"{reply}\"")]
fn client_receives(tunnel_context: &TunnelContext, reply: String) -> Result<(), StepError> {
    match tunnel_context.received.as_deref() {
        Some(received) if received.trim_end() == reply => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected {reply:?}, received {other:?}"
        ))),
    }
}

#[then("the transport opened a channel to \"{host}\" port {port}")]
fn channel_opened(tunnel_context: &TunnelContext, host: String, port: u16) -> Result<(), StepError> {
    let channels = tunnel_context.transport.channels();
    if channels
        .iter()
        .any(|(opened, opened_port, _)| *opened == host && *opened_port == port)
    {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "no channel to {host}:{port} in {channels:?}"
        )))
    }
}

#[then("new clients are refused")]
fn new_clients_refused(tunnel_context: &TunnelContext) -> Result<(), StepError> {
    let address = local_address(tunnel_context)?;
    let result = tunnel_context
        .runtime
        .block_on(async move { TcpStream::connect(address).await });
    match result {
        Err(_) => Ok(()),
        Ok(_) => Err(StepError::Assertion(format!(
            "{address} still accepts connections"
        ))),
    }
}

#[then("the transport is closed")]
fn transport_closed(tunnel_context: &TunnelContext) -> Result<(), StepError> {
    if tunnel_context.transport.is_closed() {
        Ok(())
    } else {
        Err(StepError::Assertion(String::from("transport still open")))
    }
}
