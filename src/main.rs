//! Binary entry point for the contractor CLI.

use std::io::{self, Write};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use camino::Utf8PathBuf;
use clap::Parser;
use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;

use contractor::{
    ConfigError, Document, ExecutionOrder, GraphError, OpenStackProvider, ProcessCommandRunner,
    ProviderError, RunError, Runner, Settings, SshConnector, TaskContext, TaskDescriptor,
    TaskGraph, registry,
};

mod cli;

use cli::{Cli, Command, GraphCommand, RunCommand};

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("path is not valid UTF-8: {0}")]
    Path(String),
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("task graph error: {0}")]
    Graph(#[from] GraphError),
    #[error("run failed: {0}")]
    Run(#[from] RunError),
    #[error("failed to write output: {0}")]
    Output(#[from] io::Error),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let exit_code = match dispatch(cli.command).await {
        Ok(()) => 0,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

fn init_tracing(verbose: bool) {
    let fallback = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

async fn dispatch(command: Command) -> Result<(), CliError> {
    match command {
        Command::Run(args) => run_command(args).await,
        Command::Graph(args) => graph_command(&args, io::stdout()),
    }
}

fn load_document(path: PathBuf) -> Result<Document, CliError> {
    let utf8 = Utf8PathBuf::from_path_buf(path)
        .map_err(|rejected| CliError::Path(rejected.display().to_string()))?;
    Ok(Document::load(&utf8)?)
}

async fn run_command(args: RunCommand) -> Result<(), CliError> {
    let document = load_document(args.config)?;
    let credentials = document
        .environment(&args.environment)?
        .credentials(&args.environment)?
        .clone();

    let settings = Settings::load_without_cli_args()?;
    settings.validate()?;
    let connector = SshConnector::new(
        ProcessCommandRunner,
        settings.ssh_options(),
        settings.sso_username.clone(),
    );
    let provider = OpenStackProvider::new(credentials)?;

    let context = TaskContext::new(
        args.environment,
        Arc::new(document),
        Arc::new(settings),
        Arc::new(provider),
        Arc::new(connector),
    );
    let runner = Runner::new(context, registry())?;
    let summary = runner.execute().await?;
    if !summary.skipped.is_empty() {
        info!(skipped = ?summary.skipped, "disabled tasks were skipped");
    }
    Ok(())
}

fn graph_command(args: &GraphCommand, target: impl Write) -> Result<(), CliError> {
    if let Some(path) = &args.config {
        load_document(path.clone())?;
    }
    let descriptors = registry();
    let order = TaskGraph::build(descriptors.iter().map(TaskDescriptor::declaration))?.order()?;
    write_order(target, &order)
}

fn write_order(mut target: impl Write, order: &ExecutionOrder) -> Result<(), CliError> {
    for identity in order.forward() {
        writeln!(target, "{identity}")?;
    }
    Ok(())
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}
