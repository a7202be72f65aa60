//! Environment document model.

use std::collections::BTreeMap;
use std::fmt;

use camino::Utf8Path;
use cap_std::{ambient_authority, fs_utf8::Dir};
use serde::Deserialize;
use serde_json::Value;

use super::ConfigError;

const DEFAULT_INSTANCE_PREFIX: &str = "dns-";
const DEFAULT_AZ: &str = "az1";
const DEFAULT_FLOATING_IP_POOL: &str = "Ext-Net";
const DEFAULT_BEACHHEAD_USER: &str = "ubuntu";

fn default_instance_prefix() -> String {
    DEFAULT_INSTANCE_PREFIX.to_owned()
}

fn default_az() -> String {
    DEFAULT_AZ.to_owned()
}

fn default_floating_ip_pool() -> String {
    DEFAULT_FLOATING_IP_POOL.to_owned()
}

fn default_beachhead_user() -> String {
    DEFAULT_BEACHHEAD_USER.to_owned()
}

fn default_beachhead_groups() -> Vec<String> {
    vec![String::from("default"), String::from("beachhead")]
}

const fn default_ip_version() -> u8 {
    4
}

fn default_direction() -> String {
    String::from("ingress")
}

fn default_ethertype() -> String {
    String::from("IPv4")
}

/// Root of the environment document.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Document {
    /// Prefix for generated instance names.
    #[serde(default = "default_instance_prefix")]
    pub instance_name_prefix: String,
    /// Environments keyed by name.
    #[serde(default)]
    pub environments: BTreeMap<String, Environment>,
    /// Compute roles keyed by name; each lists its instances per environment.
    #[serde(default)]
    pub roles: BTreeMap<String, RoleSpec>,
}

impl Default for Document {
    fn default() -> Self {
        Self {
            instance_name_prefix: default_instance_prefix(),
            environments: BTreeMap::new(),
            roles: BTreeMap::new(),
        }
    }
}

impl Document {
    /// Parses a document from JSON text.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the text does not match the
    /// document shape.
    pub fn from_json(path: &Utf8Path, contents: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(contents).map_err(|err| ConfigError::Parse {
            path: path.to_path_buf(),
            message: err.to_string(),
        })
    }

    /// Reads and parses the document at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] when the file cannot be read and
    /// [`ConfigError::Parse`] when it is malformed.
    pub fn load(path: &Utf8Path) -> Result<Self, ConfigError> {
        let contents = read_document(path)?;
        Self::from_json(path, &contents)
    }

    /// Looks up an environment by name.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownEnvironment`] listing the defined names.
    pub fn environment(&self, name: &str) -> Result<&Environment, ConfigError> {
        self.environments
            .get(name)
            .ok_or_else(|| ConfigError::UnknownEnvironment {
                name: name.to_owned(),
                available: self
                    .environments
                    .keys()
                    .map(String::as_str)
                    .collect::<Vec<_>>()
                    .join(", "),
            })
    }

    /// Name given to instance `number` of `role` in `environment`.
    ///
    /// ```
    /// let document = contractor::config::Document::default();
    /// assert_eq!(document.instance_name("prod", "az2", "web", 7), "dns-prodaz2-web0007");
    /// ```
    #[must_use]
    pub fn instance_name(&self, environment: &str, az: &str, role: &str, number: u32) -> String {
        format!(
            "{}{environment}{az}-{role}{number:04}",
            self.instance_name_prefix
        )
    }
}

fn read_document(path: &Utf8Path) -> Result<String, ConfigError> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    let file_name = path.file_name().ok_or_else(|| ConfigError::Read {
        path: path.to_path_buf(),
        message: String::from("path has no file name"),
    })?;

    let dir = Dir::open_ambient_dir(parent, ambient_authority()).map_err(|err| ConfigError::Read {
        path: parent.to_path_buf(),
        message: err.to_string(),
    })?;
    dir.read_to_string(file_name)
        .map_err(|err| ConfigError::Read {
            path: path.to_path_buf(),
            message: err.to_string(),
        })
}

/// Desired state of one environment.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct Environment {
    /// Provider credentials; required only when talking to a real cloud.
    #[serde(default)]
    pub credentials: Option<Credentials>,
    /// Routers keyed by name.
    #[serde(default)]
    pub routers: BTreeMap<String, RouterSpec>,
    /// Networks keyed by name, each with its subnets.
    #[serde(default)]
    pub networks: BTreeMap<String, NetworkSpec>,
    /// Security groups keyed by name.
    #[serde(default)]
    pub security_groups: BTreeMap<String, SecurityGroupSpec>,
    /// Keypairs keyed by name.
    #[serde(default)]
    pub keypairs: BTreeMap<String, KeypairSpec>,
    /// Bootstrap host used to reach private networks.
    #[serde(default)]
    pub beachhead: Option<BeachheadSpec>,
}

impl Environment {
    /// Returns the credentials section.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingCredentials`] when absent.
    pub fn credentials(&self, environment: &str) -> Result<&Credentials, ConfigError> {
        self.credentials
            .as_ref()
            .ok_or_else(|| ConfigError::MissingCredentials {
                environment: environment.to_owned(),
            })
    }

    /// Every configured subnet as `(network, subnet, spec)`.
    pub fn subnets(&self) -> impl Iterator<Item = (&str, &str, &SubnetSpec)> {
        self.networks.iter().flat_map(|(network, spec)| {
            spec.subnets
                .iter()
                .map(move |(subnet, subnet_spec)| (network.as_str(), subnet.as_str(), subnet_spec))
        })
    }
}

/// Keystone v2.0 password credentials.
#[derive(Clone, Default, Deserialize, PartialEq, Eq)]
pub struct Credentials {
    /// Identity endpoint, for example `https://identity.example/v2.0`.
    pub auth_url: String,
    /// User name; preferred over `user_id` when both are set.
    #[serde(default)]
    pub username: Option<String>,
    /// User identifier.
    #[serde(default)]
    pub user_id: Option<String>,
    /// Password.
    pub password: String,
    /// Project (tenant) name; preferred over `project_id`.
    #[serde(default)]
    pub project_name: Option<String>,
    /// Project (tenant) identifier.
    #[serde(default)]
    pub project_id: Option<String>,
    /// Region used to pick endpoints from the service catalogue.
    #[serde(default)]
    pub region_name: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("auth_url", &self.auth_url)
            .field("username", &self.username)
            .field("user_id", &self.user_id)
            .field("password", &"<redacted>")
            .field("project_name", &self.project_name)
            .field("project_id", &self.project_id)
            .field("region_name", &self.region_name)
            .finish()
    }
}

/// Router definition.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct RouterSpec {
    /// Gateway settings passed through to the provider verbatim.
    #[serde(default)]
    pub external_gateway_info: Option<Value>,
    /// Names of subnets to attach during commission.
    #[serde(default)]
    pub interfaces: Vec<String>,
}

/// Network definition.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct NetworkSpec {
    /// Subnets keyed by name.
    #[serde(default)]
    pub subnets: BTreeMap<String, SubnetSpec>,
}

/// Subnet definition.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct SubnetSpec {
    /// Address range, for example `10.0.0.0/24`.
    pub cidr: String,
    /// IP version; defaults to 4.
    #[serde(default = "default_ip_version")]
    pub ip_version: u8,
    /// Explicit gateway address.
    #[serde(default)]
    pub gateway_ip: Option<String>,
    /// DNS servers handed out by DHCP.
    #[serde(default)]
    pub dns_nameservers: Vec<String>,
}

/// Security group definition.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct SecurityGroupSpec {
    /// Free-form description.
    #[serde(default)]
    pub description: Option<String>,
    /// Rules created together with the group.
    #[serde(default)]
    pub rules: Vec<RuleSpec>,
}

/// Security group rule definition.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct RuleSpec {
    /// `ingress` (default) or `egress`.
    #[serde(default = "default_direction")]
    pub direction: String,
    /// `IPv4` (default) or `IPv6`.
    #[serde(default = "default_ethertype")]
    pub ethertype: String,
    /// Protocol such as `tcp`; any protocol when absent.
    #[serde(default)]
    pub protocol: Option<String>,
    /// Lower port bound.
    #[serde(default)]
    pub port_range_min: Option<u16>,
    /// Upper port bound.
    #[serde(default)]
    pub port_range_max: Option<u16>,
    /// Source prefix, for example `0.0.0.0/0`.
    #[serde(default)]
    pub remote_ip_prefix: Option<String>,
}

/// Keypair definition.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct KeypairSpec {
    /// Public key to import; the provider generates one when absent.
    #[serde(default)]
    pub public_key: Option<String>,
}

/// Beachhead host definition.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct BeachheadSpec {
    /// Image name.
    pub image: String,
    /// Flavor name.
    pub flavor: String,
    /// Pool the floating IP is allocated from.
    #[serde(default = "default_floating_ip_pool")]
    pub floating_ip_pool: String,
    /// Security groups applied to the host.
    #[serde(default = "default_beachhead_groups")]
    pub security_groups: Vec<String>,
    /// Login user on the image.
    #[serde(default = "default_beachhead_user")]
    pub user: String,
}

/// Compute role definition.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct RoleSpec {
    /// Image name.
    #[serde(default)]
    pub image: Option<String>,
    /// Flavor name.
    #[serde(default)]
    pub flavor: Option<String>,
    /// Keypair injected into instances; the beachhead keypair when absent.
    #[serde(default)]
    pub keypair: Option<String>,
    /// Login user for provisioning; `ubuntu` when absent.
    #[serde(default)]
    pub user: Option<String>,
    /// Command run on each new instance through the beachhead tunnel.
    /// `{name}`, `{role}` and `{environment}` are substituted per instance.
    #[serde(default)]
    pub provisioner: Option<Vec<String>>,
    /// Security groups applied to instances.
    #[serde(default)]
    pub security_groups: Vec<String>,
    /// Instance slots keyed by environment name.
    #[serde(default)]
    pub instances: BTreeMap<String, Vec<InstanceSlot>>,
}

/// One numbered instance of a role.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct InstanceSlot {
    /// Ordinal used in the instance name.
    pub number: u32,
    /// Availability zone; defaults to `az1`.
    #[serde(default = "default_az")]
    pub az: String,
    /// Network attachments.
    #[serde(default)]
    pub nics: Vec<NicSpec>,
}

/// Network attachment of an instance.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct NicSpec {
    /// Network name.
    pub network: String,
    /// Fixed address on that network.
    #[serde(default)]
    pub fixed_ip: Option<String>,
    /// Floating address to associate after boot.
    #[serde(default)]
    pub floating_ip: Option<String>,
}
