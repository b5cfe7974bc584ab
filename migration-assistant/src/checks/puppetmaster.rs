// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Instances must use the central puppet master, not one of their own.

use super::{probe, Check};
use crate::instance::{CheckName, Finding};
use crate::transport::{CommandOptions, Transport, TransportError};
use async_trait::async_trait;

pub const NAME: CheckName = CheckName::new("self-hosted-puppetmaster");

pub const PUPPET_CONF: &str = "/etc/puppet/puppet.conf";

pub struct SelfHostedPuppetmaster {
    control_plane_host: String,
    command: String,
}

impl SelfHostedPuppetmaster {
    pub fn new(control_plane_host: &str) -> Self {
        SelfHostedPuppetmaster::with_config_path(
            control_plane_host,
            PUPPET_CONF,
        )
    }

    /// Read the agent configuration from `path` instead of the usual place.
    pub fn with_config_path(control_plane_host: &str, path: &str) -> Self {
        // `cat` exits non-zero on a missing or unreadable file, which
        // surfaces as a failed probe rather than an empty configuration.
        let command = format!("cat {}", shell_words::quote(path));
        SelfHostedPuppetmaster {
            control_plane_host: control_plane_host.to_string(),
            command,
        }
    }
}

/// Values of every `server = ...` setting in a puppet.conf.
fn configured_servers(conf: &str) -> Vec<&str> {
    conf.lines()
        .map(|line| line.split('#').next().unwrap_or_default().trim())
        .filter_map(|line| line.split_once('='))
        .filter(|(key, _)| key.trim() == "server")
        .map(|(_, value)| value.trim())
        .collect()
}

fn classify(conf: &str, control_plane_host: &str) -> Finding {
    let servers = configured_servers(conf);
    let elsewhere: Vec<&str> = servers
        .iter()
        .copied()
        .filter(|server| *server != control_plane_host)
        .collect();

    if !elsewhere.is_empty() {
        Finding::fail(format!(
            "running a self-hosted puppet master (server set to {})",
            elsewhere.join(", ")
        ))
    } else if servers.is_empty() {
        Finding::fail(format!(
            "no puppet master configured; expected {}",
            control_plane_host
        ))
    } else {
        Finding::pass("not using a self-hosted puppet master")
    }
}

#[async_trait]
impl Check for SelfHostedPuppetmaster {
    fn name(&self) -> CheckName {
        NAME
    }

    async fn run(
        &self,
        host: &str,
        transport: &dyn Transport,
    ) -> Result<Finding, TransportError> {
        let output =
            probe(transport, host, &self.command, CommandOptions::PLAIN).await?;
        Ok(output
            .map(|conf| classify(&conf, &self.control_plane_host))
            .unwrap_or_else(Finding::from))
    }
}
