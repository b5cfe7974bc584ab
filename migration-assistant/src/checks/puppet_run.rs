// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Puppet must have run recently, so the instance can be rebuilt from its
//! manifests on the other side.

use super::{probe, Check, CheckDegraded};
use crate::instance::{CheckName, Finding};
use crate::transport::{CommandOptions, Transport, TransportError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

pub const NAME: CheckName = CheckName::new("last-puppet-run");

pub const RUN_SUMMARY_PATH: &str = "/var/lib/puppet/state/last_run_summary.yaml";

/// Source of "now".
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(Utc::now)
}

pub struct LastPuppetRun {
    threshold: Duration,
    clock: Clock,
}

impl LastPuppetRun {
    pub fn new(threshold: Duration, clock: Clock) -> Self {
        LastPuppetRun { threshold, clock }
    }
}

/// Extract `time.last_run` (seconds since the epoch) from a run summary.
///
/// Returns `Ok(None)` if the summary parses but carries no usable timestamp.
fn last_run_epoch(summary: &str) -> Result<Option<f64>, CheckDegraded> {
    let doc: serde_yaml::Value =
        serde_yaml::from_str(summary).map_err(CheckDegraded::Yaml)?;
    if !doc.is_mapping() {
        return Err(CheckDegraded::Malformed(
            "run summary is not a mapping".to_string(),
        ));
    }
    let epoch = doc
        .get("time")
        .and_then(|time| time.get("last_run"))
        .and_then(|last_run| last_run.as_f64());
    Ok(epoch.filter(|e| *e > 0.0))
}

fn classify(
    summary: &str,
    now: DateTime<Utc>,
    threshold: Duration,
) -> Result<Finding, CheckDegraded> {
    let Some(epoch) = last_run_epoch(summary)? else {
        return Ok(Finding::fail(
            "could not determine the last time puppet was run",
        ));
    };

    // Sub-second precision doesn't matter here.
    let elapsed_secs = now.timestamp() - epoch as i64;
    let elapsed = Duration::from_secs(u64::try_from(elapsed_secs).unwrap_or(0));
    if elapsed > threshold {
        Ok(Finding::fail(format!(
            "the last puppet run was {} ago, please run puppet",
            humantime::format_duration(elapsed)
        )))
    } else {
        Ok(Finding::pass(format!(
            "puppet is up-to-date (last run {} ago)",
            humantime::format_duration(elapsed)
        )))
    }
}

#[async_trait]
impl Check for LastPuppetRun {
    fn name(&self) -> CheckName {
        NAME
    }

    async fn run(
        &self,
        host: &str,
        transport: &dyn Transport,
    ) -> Result<Finding, TransportError> {
        let command = format!("cat {}", RUN_SUMMARY_PATH);
        let output =
            probe(transport, host, &command, CommandOptions::ELEVATED).await?;
        let now = (self.clock)();
        Ok(output
            .and_then(|summary| classify(&summary, now, self.threshold))
            .unwrap_or_else(Finding::from))
    }
}
