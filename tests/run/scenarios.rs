//! BDD scenarios for phased reconciliation runs.

use rstest_bdd_macros::scenario;

use super::test_helpers::{RunContext, run_context};

#[scenario(
    path = "tests/features/run.feature",
    name = "Build networking in an empty project"
)]
fn scenario_build_networking(run_context: RunContext) {
    drop(run_context);
}

#[scenario(
    path = "tests/features/run.feature",
    name = "Tear down resources the environment no longer declares"
)]
fn scenario_teardown(run_context: RunContext) {
    drop(run_context);
}

#[scenario(
    path = "tests/features/run.feature",
    name = "Keep the external network during teardown"
)]
fn scenario_keep_external_network(run_context: RunContext) {
    drop(run_context);
}

#[scenario(
    path = "tests/features/run.feature",
    name = "A converged environment is left untouched"
)]
fn scenario_converged(run_context: RunContext) {
    drop(run_context);
}

#[scenario(
    path = "tests/features/run.feature",
    name = "Provider failures abort the run"
)]
fn scenario_provider_failure(run_context: RunContext) {
    drop(run_context);
}
