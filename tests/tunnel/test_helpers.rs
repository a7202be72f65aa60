//! Shared fixtures for tunnel BDD scenarios.

use std::sync::Arc;

use contractor::test_support::DirectTransport;
use contractor::transport::Connection;
use rstest::fixture;
use thiserror::Error;
use tokio::runtime::Runtime;

/// State threaded through tunnel steps. The runtime outlives individual
/// steps so that accept loops and relays keep running between them.
#[derive(Clone, Debug)]
pub struct TunnelContext {
    pub runtime: Arc<Runtime>,
    pub transport: DirectTransport,
    pub connection: Option<Arc<Connection>>,
    pub local_port: Option<u16>,
    pub received: Option<String>,
}

#[derive(Debug, Error)]
pub enum TunnelTestError {
    #[error("failed to start runtime: {0}")]
    Runtime(#[from] std::io::Error),
}

pub type TunnelContextResult = Result<TunnelContext, TunnelTestError>;

#[fixture]
pub fn tunnel_context_result() -> TunnelContextResult {
    Ok(TunnelContext {
        runtime: Arc::new(Runtime::new()?),
        transport: DirectTransport::new(),
        connection: None,
        local_port: None,
        received: None,
    })
}

#[fixture]
pub fn tunnel_context(tunnel_context_result: TunnelContextResult) -> TunnelContext {
    tunnel_context_result
        .unwrap_or_else(|err| panic!("tunnel context fixture should initialise: {err}"))
}
