//! Operator settings loaded via `ortho-config`.

use std::ffi::OsString;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;

use super::ConfigError;
use crate::provider::RetryPolicy;
use crate::transport::SshOptions;

/// SSH, polling and tunnel settings merged from defaults, `contractor.toml`
/// and `CONTRACTOR_*` environment variables.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "CONTRACTOR",
    discovery(
        app_name = "contractor",
        env_var = "CONTRACTOR_CONFIG_PATH",
        config_file_name = "contractor.toml",
        dotfile_name = ".contractor.toml",
        project_file_name = "contractor.toml"
    )
)]
pub struct Settings {
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// User tried first when connecting to a new host. Falls back to
    /// `ubuntu` when unset.
    pub sso_username: Option<String>,
    /// Whether to enforce host key checking; ephemeral hosts default to off.
    #[ortho_config(default = false)]
    pub ssh_strict_host_key_checking: bool,
    /// Known hosts file override; defaults to `/dev/null` for ephemeral hosts.
    #[ortho_config(default = "/dev/null".to_owned())]
    pub ssh_known_hosts_file: String,
    /// Seconds `ssh` waits for a TCP connection before giving up.
    #[ortho_config(default = 10)]
    pub ssh_connect_timeout_secs: u64,
    /// Directory receiving generated private keys.
    #[ortho_config(default = ".contractor/keys".to_owned())]
    pub key_dir: String,
    /// Seconds between status polls while waiting for servers.
    #[ortho_config(default = 10)]
    pub poll_interval_secs: u64,
    /// Seconds allowed for a server to reach `ACTIVE`.
    #[ortho_config(default = 600)]
    pub active_timeout_secs: u64,
    /// Seconds to pause after associating a floating IP before connecting.
    #[ortho_config(default = 2)]
    pub floating_ip_settle_secs: u64,
    /// Address tunnels listen on.
    #[ortho_config(default = "127.0.0.1".to_owned())]
    pub tunnel_bind_address: String,
    /// Local port for tunnels; `0` lets the operating system choose.
    #[ortho_config(default = 0)]
    pub tunnel_port: u16,
    /// Seconds in-flight relays may keep running once a tunnel stops.
    #[ortho_config(default = 5)]
    pub tunnel_drain_timeout_secs: u64,
}

impl Settings {
    /// Loads settings without parsing CLI arguments. Values still merge
    /// defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Settings`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("contractor")])
            .map_err(|err| ConfigError::Settings(err.to_string()))
    }

    /// Checks values that have no sensible fallback.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the environment variable and
    /// TOML key to fix.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Self::require(&self.ssh_bin, "SSH client", "CONTRACTOR_SSH_BIN", "ssh_bin")?;
        Self::require(&self.key_dir, "key directory", "CONTRACTOR_KEY_DIR", "key_dir")?;
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid(String::from(
                "poll interval must be positive: set CONTRACTOR_POLL_INTERVAL_SECS or poll_interval_secs in contractor.toml",
            )));
        }
        self.tunnel_bind()?;
        Ok(())
    }

    fn require(value: &str, description: &str, env_var: &str, key: &str) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(ConfigError::Invalid(format!(
                "missing {description}: set {env_var} or add {key} to contractor.toml"
            )));
        }
        Ok(())
    }

    /// Polling policy for "wait until ACTIVE" loops.
    #[must_use]
    pub const fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_secs(self.poll_interval_secs),
            Duration::from_secs(self.active_timeout_secs),
        )
    }

    /// Pause after associating a floating IP.
    #[must_use]
    pub const fn floating_ip_settle(&self) -> Duration {
        Duration::from_secs(self.floating_ip_settle_secs)
    }

    /// Grace period for in-flight relays when a tunnel stops.
    #[must_use]
    pub const fn tunnel_drain_timeout(&self) -> Duration {
        Duration::from_secs(self.tunnel_drain_timeout_secs)
    }

    /// Socket address tunnels bind to.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when the bind address is not an IP.
    pub fn tunnel_bind(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = self.tunnel_bind_address.trim().parse().map_err(|_| {
            ConfigError::Invalid(format!(
                "tunnel bind address `{}` is not an IP address: fix CONTRACTOR_TUNNEL_BIND_ADDRESS or tunnel_bind_address in contractor.toml",
                self.tunnel_bind_address
            ))
        })?;
        Ok(SocketAddr::new(ip, self.tunnel_port))
    }

    /// Directory for generated private keys.
    #[must_use]
    pub fn key_dir(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(&self.key_dir)
    }

    /// Options passed to every `ssh` invocation.
    #[must_use]
    pub fn ssh_options(&self) -> SshOptions {
        SshOptions {
            ssh_bin: self.ssh_bin.clone(),
            strict_host_key_checking: self.ssh_strict_host_key_checking,
            known_hosts_file: self.ssh_known_hosts_file.clone(),
            connect_timeout_secs: self.ssh_connect_timeout_secs,
        }
    }
}
