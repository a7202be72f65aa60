//! BDD scenarios for SSH tunnels.

use rstest_bdd_macros::scenario;

use super::test_helpers::{TunnelContext, tunnel_context};

#[scenario(
    path = "tests/features/tunnel.feature",
    name = "Relay a command to a private host"
)]
fn scenario_relay_command(tunnel_context: TunnelContext) {
    drop(tunnel_context);
}

#[scenario(
    path = "tests/features/tunnel.feature",
    name = "A stopped tunnel refuses new clients"
)]
fn scenario_stopped_tunnel(tunnel_context: TunnelContext) {
    drop(tunnel_context);
}

#[scenario(
    path = "tests/features/tunnel.feature",
    name = "Disconnecting closes tunnels and the transport"
)]
fn scenario_disconnect(tunnel_context: TunnelContext) {
    drop(tunnel_context);
}
