//! Command-line interface definitions for the `contractor` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Top-level CLI for the `contractor` binary.
#[derive(Debug, Parser)]
#[command(
    name = "contractor",
    version,
    about = "Reconcile a declarative OpenStack environment through a phased task graph",
    arg_required_else_help = true
)]
pub(crate) struct Cli {
    /// Log at debug level unless `RUST_LOG` says otherwise.
    #[arg(long, short, global = true)]
    pub(crate) verbose: bool,
    /// Subcommand to execute.
    #[command(subcommand)]
    pub(crate) command: Command,
}

/// Subcommands of `contractor`.
#[derive(Debug, Subcommand)]
pub(crate) enum Command {
    /// Bring an environment in line with the document.
    #[command(name = "run", about = "Bring an environment in line with the document")]
    Run(RunCommand),
    /// Print the task execution order.
    #[command(name = "graph", about = "Print the task execution order")]
    Graph(GraphCommand),
}

/// Arguments for the `contractor run` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct RunCommand {
    /// Environment to reconcile, as named in the document.
    #[arg(long, short, env = "CONTRACTOR_ENVIRONMENT", value_name = "NAME")]
    pub(crate) environment: String,
    /// Path to the JSON environment document.
    #[arg(long, short, env = "CONTRACTOR_DOCUMENT", value_name = "PATH")]
    pub(crate) config: PathBuf,
}

/// Arguments for the `contractor graph` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct GraphCommand {
    /// Path to the JSON environment document; parsed to catch mistakes
    /// early, never sent to the provider.
    #[arg(long, short, env = "CONTRACTOR_DOCUMENT", value_name = "PATH")]
    pub(crate) config: Option<PathBuf>,
}
