//! Configuration for a contractor run.
//!
//! Two layers feed a run. The environment document is a JSON file describing
//! the desired state of each environment (networks, routers, roles, …) and
//! is selected on the command line. Operator [`Settings`] (SSH client
//! options, polling bounds, tunnel behaviour) are merged by `ortho-config`
//! from defaults, `contractor.toml` and `CONTRACTOR_*` environment variables.

use camino::Utf8PathBuf;
use thiserror::Error;

mod document;
mod settings;

pub use document::{
    BeachheadSpec, Credentials, Document, Environment, InstanceSlot, KeypairSpec, NetworkSpec,
    NicSpec, RoleSpec, RouterSpec, RuleSpec, SecurityGroupSpec, SubnetSpec,
};
pub use settings::Settings;

/// Errors raised while loading or validating configuration.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// The environment document could not be read.
    #[error("failed to read {path}: {message}")]
    Read {
        /// File that was requested.
        path: Utf8PathBuf,
        /// Underlying I/O message.
        message: String,
    },
    /// The environment document is not valid JSON for the expected shape.
    #[error("failed to parse {path}: {message}")]
    Parse {
        /// File that was parsed.
        path: Utf8PathBuf,
        /// Parser message.
        message: String,
    },
    /// The requested environment is not defined in the document.
    #[error("environment `{name}` is not defined (available: {available})")]
    UnknownEnvironment {
        /// Requested environment.
        name: String,
        /// Comma-separated list of defined environments.
        available: String,
    },
    /// The environment defines no provider credentials.
    #[error("environment `{environment}` has no credentials section")]
    MissingCredentials {
        /// Environment lacking credentials.
        environment: String,
    },
    /// A required value is empty or invalid.
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("settings parsing failed: {0}")]
    Settings(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Settings(value.to_string())
    }
}
