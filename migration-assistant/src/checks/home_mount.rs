// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The home directory should be mounted from shared (NFS) storage.

use super::{probe, Check, CheckDegraded};
use crate::config::Severity;
use crate::instance::{CheckName, Finding};
use crate::transport::{CommandOptions, Transport, TransportError};
use async_trait::async_trait;

pub const NAME: CheckName = CheckName::new("shared-storage-for-home");

pub const COMMAND: &str = "df -P \"$HOME\"";

/// Network filesystems report their source as `server:/path`.
const NETWORK_PATH_DELIMITER: char = ':';

pub struct SharedStorageForHome {
    severity: Severity,
}

impl SharedStorageForHome {
    pub fn new(severity: Severity) -> Self {
        SharedStorageForHome { severity }
    }
}

fn classify(output: &str, severity: Severity) -> Result<Finding, CheckDegraded> {
    // Skip the header; the first field of the next line is the mount source.
    let source = output
        .lines()
        .nth(1)
        .and_then(|line| line.split_whitespace().next())
        .ok_or_else(|| {
            CheckDegraded::Malformed(format!("df printed {:?}", output.trim()))
        })?;

    if source.contains(NETWORK_PATH_DELIMITER) {
        return Ok(Finding::pass(format!(
            "home folder is on shared storage ({})",
            source
        )));
    }
    let detail = format!(
        "home folder is not on shared storage (mounted from {})",
        source
    );
    Ok(match severity {
        Severity::Fail => Finding::fail(detail),
        Severity::Warning => Finding::warning(detail),
    })
}

#[async_trait]
impl Check for SharedStorageForHome {
    fn name(&self) -> CheckName {
        NAME
    }

    async fn run(
        &self,
        host: &str,
        transport: &dyn Transport,
    ) -> Result<Finding, TransportError> {
        let output =
            probe(transport, host, COMMAND, CommandOptions::PLAIN).await?;
        Ok(output
            .and_then(|o| classify(&o, self.severity))
            .unwrap_or_else(Finding::from))
    }
}
