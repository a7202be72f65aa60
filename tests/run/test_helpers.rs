//! Shared fixtures for run BDD scenarios.

use camino::Utf8Path;
use contractor::config::{ConfigError, Document};
use contractor::task::Phase;
use contractor::tasks::{NETWORK, ROUTER, SUBNET, registry};
use contractor::test_support::{DirectConnector, MemoryProvider, task_context};
use contractor::{RunError, Runner};
use rstest::fixture;
use serde_json::{Value, json};
use thiserror::Error;

pub const ENVIRONMENT: &str = "staging";

#[derive(Clone, Debug)]
pub struct RunContext {
    pub provider: MemoryProvider,
    pub environment: Value,
    pub outcome: Option<RunOutcome>,
    pub operations_after_first_run: Option<usize>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RunOutcome {
    Success,
    Failure { task: String, phase: Phase },
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum RunTestError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Run(#[from] RunError),
}

pub type RunContextResult = Result<RunContext, RunTestError>;

#[fixture]
pub fn run_context_result() -> RunContextResult {
    Ok(RunContext {
        provider: MemoryProvider::new(),
        environment: json!({}),
        outcome: None,
        operations_after_first_run: None,
    })
}

#[fixture]
pub fn run_context(run_context_result: RunContextResult) -> RunContext {
    run_context_result.unwrap_or_else(|err| panic!("run context fixture should initialise: {err}"))
}

impl RunContext {
    /// Runner over the networking tasks for the declared environment.
    pub fn runner(&self) -> Result<Runner, RunTestError> {
        let text = json!({ "environments": { ENVIRONMENT: self.environment } }).to_string();
        let document = Document::from_json(Utf8Path::new("run.feature.json"), &text)?;
        let descriptors = registry()
            .into_iter()
            .filter(|descriptor| [ROUTER, NETWORK, SUBNET].contains(&descriptor.provides()))
            .collect();
        let context = task_context(
            document,
            ENVIRONMENT,
            &self.provider,
            &DirectConnector::default(),
        );
        Ok(Runner::new(context, descriptors)?)
    }
}

pub fn outcome_of(result: Result<contractor::RunSummary, RunError>) -> RunOutcome {
    match result {
        Ok(_) => RunOutcome::Success,
        Err(RunError::Task { task, phase, .. }) => RunOutcome::Failure { task, phase },
        Err(err) => RunOutcome::Rejected(err.to_string()),
    }
}
