// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The battery of read-only diagnostic checks run against each instance.
//!
//! Every check follows the same shape: run one or more probe commands
//! through the [`Transport`], then classify what came back.  Classification
//! is kept in plain functions so it can be tested without a transport.
//!
//! A check distinguishes three kinds of trouble:
//!
//! - the host went away mid-check: returned as a [`TransportError`] for the
//!   coordinator to deal with;
//! - the probe ran but told us nothing useful (non-zero exit, garbage
//!   output, missing artifact): a [`CheckDegraded`], reported as a WARNING;
//! - the probe ran and the instance is not ready: a FAIL or WARNING
//!   [`Finding`].

use crate::config::CheckPolicy;
use crate::instance::{CheckName, Finding};
use crate::transport::{CommandOptions, Transport, TransportError};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

pub mod database;
pub mod home_mount;
pub mod home_usage;
pub mod puppet_run;
pub mod puppetmaster;

pub use puppet_run::{system_clock, Clock};

/// A single diagnostic probe.
#[async_trait]
pub trait Check: Send + Sync {
    fn name(&self) -> CheckName;

    /// Run the check against the instance with key `host`.
    ///
    /// Only connection-level failures are returned as errors; everything
    /// else is folded into the returned [`Finding`].
    async fn run(
        &self,
        host: &str,
        transport: &dyn Transport,
    ) -> Result<Finding, TransportError>;
}

/// A probe ran, but its result can't be trusted.
#[derive(Debug, Error)]
pub enum CheckDegraded {
    #[error(
        "probe exited with status {}: {stderr}",
        .status.map(|s| s.to_string()).unwrap_or_else(|| "none".to_string())
    )]
    ProbeFailed { status: Option<i32>, stderr: String },

    #[error("unexpected output: {0}")]
    Malformed(String),

    #[error("malformed puppet run summary")]
    Yaml(#[source] serde_yaml::Error),
}

impl From<CheckDegraded> for Finding {
    fn from(degraded: CheckDegraded) -> Finding {
        Finding::warning(format!(
            "could not verify: {}",
            display_error_chain::DisplayErrorChain::new(&degraded)
        ))
    }
}

/// Run `command`, separating "the host is gone" from "the command failed".
///
/// The outer `Result` carries connection-level failures; the inner one
/// carries a non-zero exit of the command itself.
pub(crate) async fn probe(
    transport: &dyn Transport,
    host: &str,
    command: &str,
    options: CommandOptions,
) -> Result<Result<String, CheckDegraded>, TransportError> {
    match transport.run_command(host, command, options).await {
        Ok(stdout) => Ok(Ok(stdout)),
        Err(TransportError::CommandFailed { status, stderr, .. }) => {
            Ok(Err(CheckDegraded::ProbeFailed { status, stderr }))
        }
        Err(error) => Err(error),
    }
}

/// An ordered list of checks.
#[derive(Clone, Default)]
pub struct CheckBattery {
    checks: Vec<Arc<dyn Check>>,
}

impl CheckBattery {
    pub fn new() -> CheckBattery {
        CheckBattery::default()
    }

    /// The five canonical migration checks, in presentation order.
    pub fn standard(policy: &CheckPolicy, clock: Clock) -> CheckBattery {
        CheckBattery::new()
            .with(puppetmaster::SelfHostedPuppetmaster::new(
                &policy.control_plane_host,
            ))
            .with(puppet_run::LastPuppetRun::new(
                policy.puppet_freshness,
                clock,
            ))
            .with(home_usage::LocalStorageInHome)
            .with(home_mount::SharedStorageForHome::new(
                policy.home_mount_severity,
            ))
            .with(database::DatabaseUsage)
    }

    /// Append `check` to the battery.
    ///
    /// # Panics
    ///
    /// Panics if a check with the same name is already present.
    pub fn with<C: Check + 'static>(mut self, check: C) -> CheckBattery {
        assert!(
            !self.checks.iter().any(|c| c.name() == check.name()),
            "duplicate check name: {}",
            check.name()
        );
        self.checks.push(Arc::new(check));
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Check>> {
        self.checks.iter()
    }

    pub fn names(&self) -> Vec<CheckName> {
        self.checks.iter().map(|c| c.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.checks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }
}
