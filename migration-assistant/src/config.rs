// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Configuration for an audit run.
//!
//! Every field has a default, so an empty (or absent) file is valid.

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use serde_with::DurationSeconds;
use std::time::Duration;
use thiserror::Error;

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub directory: DirectoryConfig,
    pub fleet: FleetConfig,
    pub transport: TransportConfig,
    pub policy: CheckPolicy,
}

impl Config {
    /// Load a `Config` from the given TOML file
    pub fn from_file<P: AsRef<Utf8Path>>(
        path: P,
    ) -> Result<Config, ConfigError> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|error| {
            ConfigError::Io { error, path: path.to_owned() }
        })?;
        toml::from_str(&data).map_err(|error| ConfigError::Parse {
            error,
            path: path.to_owned(),
        })
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {path}")]
    Io {
        #[source]
        error: std::io::Error,
        path: Utf8PathBuf,
    },
    #[error("Failed to parse config file: {path}")]
    Parse {
        #[source]
        error: toml::de::Error,
        path: Utf8PathBuf,
    },
}

/// Where to find the instance directory.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct DirectoryConfig {
    /// Semantic MediaWiki API endpoint
    pub url: String,
    pub verify_tls: bool,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "timeout_secs")]
    pub timeout: Duration,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        DirectoryConfig {
            url: "https://wikitech.wikimedia.org/w/api.php".to_string(),
            verify_tls: false,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Which instances to audit.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct FleetConfig {
    /// Name prefixes of centrally managed instances, never audited
    pub exclude_prefixes: Vec<String>,
    /// Instance names or `name.datacenter` keys to skip
    pub ignore: Vec<String>,
    /// Appended to `name.datacenter` to form the host name
    pub domain_suffix: String,
}

impl Default for FleetConfig {
    fn default() -> Self {
        FleetConfig {
            exclude_prefixes: vec!["tools".to_string()],
            ignore: Vec::new(),
            domain_suffix: "wmflabs".to_string(),
        }
    }
}

/// How to reach instances.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransportConfig {
    pub ssh_program: String,
    /// Jump host all connections go through
    pub gateway: Option<String>,
    pub user: Option<String>,
    pub identity_file: Option<Utf8PathBuf>,
    pub forward_agent: bool,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "connect_timeout_secs")]
    pub connect_timeout: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "command_timeout_secs")]
    pub command_timeout: Duration,
    /// Total attempts at the connectivity probe before giving up on a host
    pub connection_attempts: u32,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "retry_interval_secs")]
    pub retry_interval: Duration,
    /// Maximum number of instances audited at once
    pub parallelism: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            ssh_program: "ssh".to_string(),
            gateway: Some("bastion.wmflabs.org".to_string()),
            user: None,
            identity_file: Some(Utf8PathBuf::from("~/.ssh/id_rsa")),
            forward_agent: true,
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(60),
            connection_attempts: 3,
            retry_interval: Duration::from_secs(1),
            parallelism: 8,
        }
    }
}

/// How severe a home directory outside shared storage is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Fail,
    Warning,
}

/// Thresholds and expectations used by the check battery.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CheckPolicy {
    /// The centrally operated puppet master every instance should use
    pub control_plane_host: String,
    /// How long ago the last puppet run may have been
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "puppet_freshness_secs")]
    pub puppet_freshness: Duration,
    pub home_mount_severity: Severity,
}

impl Default for CheckPolicy {
    fn default() -> Self {
        CheckPolicy {
            control_plane_host: "virt0.wikimedia.org".to_string(),
            puppet_freshness: Duration::from_secs(24 * 60 * 60),
            home_mount_severity: Severity::Fail,
        }
    }
}
