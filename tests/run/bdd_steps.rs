//! BDD step definitions for phased reconciliation runs.

use contractor::provider::{ProviderError, ResourceKind};
use contractor::test_support::Operation;
use rstest_bdd_macros::{given, then, when};
use serde_json::json;
use tokio::runtime::Runtime;

use super::test_helpers::{RunContext, RunOutcome, RunTestError, outcome_of};

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error(transparent)]
    Setup(#[from] RunTestError),
    #[error("assertion failed: {0}")]
    Assertion(String),
}

#[given("an environment declaring router \"{router}\", network \"{network}\" and subnet \"{subnet}\"")]
fn environment_declaring(
    mut run_context: RunContext,
    router: String,
    network: String,
    subnet: String,
) -> RunContext {
    run_context.environment = json!({
        "routers": { router: { "interfaces": [subnet.as_str()] } },
        "networks": { network: { "subnets": { subnet: { "cidr": "10.0.0.0/24" } } } },
    });
    run_context
}

#[given("an environment declaring nothing")]
fn environment_declaring_nothing(run_context: RunContext) -> RunContext {
    run_context
}

#[given("an empty project")]
fn empty_project(run_context: RunContext) -> RunContext {
    run_context
}

#[given("a project holding router \"{router}\", network \"{network}\" and subnet \"{subnet}\"")]
fn project_holding(
    run_context: RunContext,
    router: String,
    network: String,
    subnet: String,
) -> RunContext {
    run_context.provider.seed(ResourceKind::Router, &router);
    let seeded = run_context.provider.seed(ResourceKind::Network, &network);
    run_context.provider.seed_with(
        ResourceKind::Subnet,
        &subnet,
        json!({ "network_id": format!("{}-private", seeded.id) }),
    );
    run_context
}

#[given("the provider rejects network \"{network}\"")]
fn provider_rejects(run_context: RunContext, network: String) -> RunContext {
    run_context.provider.fail_on(
        ResourceKind::Network,
        &network,
        ProviderError::Api {
            status: 409,
            message: String::from("quota exceeded for network"),
        },
    );
    run_context
}

fn reconcile(run_context: &RunContext) -> Result<RunOutcome, StepError> {
    let runtime = Runtime::new().map_err(|err| StepError::Assertion(err.to_string()))?;
    let runner = run_context.runner()?;
    Ok(outcome_of(runtime.block_on(runner.execute())))
}

#[when("the environment is reconciled")]
fn reconciled(mut run_context: RunContext) -> Result<RunContext, StepError> {
    run_context.outcome = Some(reconcile(&run_context)?);
    Ok(run_context)
}

#[when("the environment is reconciled twice")]
fn reconciled_twice(mut run_context: RunContext) -> Result<RunContext, StepError> {
    let first = reconcile(&run_context)?;
    if first != RunOutcome::Success {
        return Err(StepError::Assertion(format!("first run failed: {first:?}")));
    }
    run_context.operations_after_first_run = Some(run_context.provider.operations().len());
    run_context.outcome = Some(reconcile(&run_context)?);
    Ok(run_context)
}

#[then("the run succeeds")]
fn run_succeeds(run_context: &RunContext) -> Result<(), StepError> {
    match &run_context.outcome {
        Some(RunOutcome::Success) => Ok(()),
        Some(other) => Err(StepError::Assertion(format!(
            "expected success, got {other:?}"
        ))),
        None => Err(StepError::Assertion(String::from("missing outcome"))),
    }
}

#[then("the run fails in task \"{task}\" during \"{phase}\"")]
fn run_fails(run_context: &RunContext, task: String, phase: String) -> Result<(), StepError> {
    let Some(RunOutcome::Failure {
        task: failed,
        phase: failed_phase,
    }) = &run_context.outcome
    else {
        return Err(StepError::Assertion(format!(
            "expected a task failure, got {:?}",
            run_context.outcome
        )));
    };
    if *failed == task && failed_phase.as_str() == phase {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected failure in {task} during {phase}, got {failed} during {failed_phase}"
        )))
    }
}

fn expect_operations(run_context: &RunContext, expected: &[Operation]) -> Result<(), StepError> {
    let operations = run_context.provider.operations();
    if operations == expected {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected operations {expected:?}, got {operations:?}"
        )))
    }
}

fn created(kind: ResourceKind, name: String) -> Operation {
    Operation::Create { kind, name }
}

fn deleted(kind: ResourceKind, name: String) -> Operation {
    Operation::Delete { kind, name }
}

#[then("the provider created router \"{router}\", network \"{network}\" and subnet \"{subnet}\" in that order")]
fn provider_created(
    run_context: &RunContext,
    router: String,
    network: String,
    subnet: String,
) -> Result<(), StepError> {
    expect_operations(
        run_context,
        &[
            created(ResourceKind::Router, router),
            created(ResourceKind::Network, network),
            created(ResourceKind::Subnet, subnet),
        ],
    )
}

#[then("the provider deleted subnet \"{subnet}\", network \"{network}\" and router \"{router}\" in that order")]
fn provider_deleted(
    run_context: &RunContext,
    subnet: String,
    network: String,
    router: String,
) -> Result<(), StepError> {
    expect_operations(
        run_context,
        &[
            deleted(ResourceKind::Subnet, subnet),
            deleted(ResourceKind::Network, network),
            deleted(ResourceKind::Router, router),
        ],
    )
}

#[then("the provider deleted subnet \"{subnet}\" and router \"{router}\" only")]
fn provider_deleted_only(
    run_context: &RunContext,
    subnet: String,
    router: String,
) -> Result<(), StepError> {
    expect_operations(
        run_context,
        &[
            deleted(ResourceKind::Subnet, subnet),
            deleted(ResourceKind::Router, router),
        ],
    )
}

#[then("subnet \"{subnet}\" is placed on network \"{network}\"")]
fn subnet_on_network(
    run_context: &RunContext,
    subnet: String,
    network: String,
) -> Result<(), StepError> {
    let find = |kind: ResourceKind, name: &str| {
        run_context
            .provider
            .resources(kind)
            .into_iter()
            .find(|resource| resource.name == name)
            .ok_or_else(|| StepError::Assertion(format!("{kind} {name} does not exist")))
    };
    let network = find(ResourceKind::Network, &network)?;
    let subnet = find(ResourceKind::Subnet, &subnet)?;
    if subnet.attribute_str("network_id") == Some(network.id.as_str()) {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "subnet {} references {:?}, expected {}",
            subnet.name,
            subnet.attribute_str("network_id"),
            network.id
        )))
    }
}

#[then("the second run changed nothing")]
fn second_run_changed_nothing(run_context: &RunContext) -> Result<(), StepError> {
    let before = run_context
        .operations_after_first_run
        .ok_or_else(|| StepError::Assertion(String::from("only one run recorded")))?;
    let after = run_context.provider.operations().len();
    if before == after {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "second run performed {} operations",
            after - before
        )))
    }
}

#[then("no subnet was created")]
fn no_subnet_created(run_context: &RunContext) -> Result<(), StepError> {
    if run_context.provider.resources(ResourceKind::Subnet).is_empty() {
        Ok(())
    } else {
        Err(StepError::Assertion(String::from(
            "subnet created after the network failed",
        )))
    }
}
