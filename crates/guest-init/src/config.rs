//! Image configuration: what to run, as whom, and how to reach the network.
//!
//! Read once at boot from a fixed JSON document and never written back.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Deserializer};
use tracing::{info, warn};

use crate::error::{InitError, InitResult};

/// Default image configuration location inside the guest.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/guest-init/image.json";

/// Search path injected when the image does not set `PATH`.
pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

pub(crate) const DEFAULT_DHCP_TIMEOUT_SECS: u64 = 10;
pub(crate) const DEFAULT_DHCP_RETRIES: u32 = 3;

#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ImageConfiguration {
    pub entrypoint: Entrypoint,
    pub cmd: String,
    #[serde(alias = "workDir")]
    pub work_dir: String,
    pub accounts: Accounts,
    #[serde(deserialize_with = "null_as_default")]
    pub environment: BTreeMap<String, String>,
    pub network: NetworkConfig,
}

#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Entrypoint {
    pub command: String,
}

#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Accounts {
    #[serde(alias = "runAs")]
    pub run_as: String,
    #[serde(deserialize_with = "null_as_default")]
    pub users: Vec<User>,
    pub unmatched_gid: UnmatchedGid,
}

#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct User {
    pub username: String,
    pub uid: u32,
    pub gid: u32,
}

/// Group used when `run-as` is a bare uid with no matching user record.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnmatchedGid {
    /// gid 0.
    #[default]
    Root,
    /// gid equal to the numeric uid.
    Uid,
}

/// Address configuration strategy for the primary link.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NetworkMode {
    /// Loopback only.
    None,
    Static,
    #[default]
    Dhcpv4,
    Dhcpv4v6,
    Netboot,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct NetworkConfig {
    pub mode: NetworkMode,
    pub timeout_secs: u64,
    pub retries: u32,
    /// CIDR address for `static` mode, e.g. `10.0.2.15/24`.
    pub address: Option<String>,
    pub gateway: Option<String>,
    #[serde(deserialize_with = "null_as_default")]
    pub dns: Vec<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            mode: NetworkMode::default(),
            timeout_secs: DEFAULT_DHCP_TIMEOUT_SECS,
            retries: DEFAULT_DHCP_RETRIES,
            address: None,
            gateway: None,
            dns: Vec::new(),
        }
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Option::<T>::deserialize(deserializer).map(Option::unwrap_or_default)
}

/// Load the image configuration from `path`.
///
/// A missing or unreadable file is logged and replaced by the zero-value
/// configuration so the guest still boots far enough to be debugged. A file
/// that exists but does not parse aborts boot.
pub fn load(path: &Path) -> InitResult<ImageConfiguration> {
    let config = match std::fs::read_to_string(path) {
        Ok(content) => parse(&content).map_err(|source| InitError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })?,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot read image config, using defaults");
            ImageConfiguration::default().with_defaults()
        }
    };
    info!(path = %path.display(), "image config loaded");
    Ok(config)
}

fn parse(content: &str) -> Result<ImageConfiguration, serde_json::Error> {
    let config: ImageConfiguration = serde_json::from_str(content)?;
    Ok(config.with_defaults())
}

impl ImageConfiguration {
    /// Fill in values the workload environment always carries.
    pub fn with_defaults(mut self) -> Self {
        self.environment
            .entry("PATH".to_string())
            .or_insert_with(|| DEFAULT_PATH.to_string());
        self
    }
}
