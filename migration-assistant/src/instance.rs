// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Instances under audit and the per-check state recorded against them.

use indexmap::IndexMap;
use serde::Serialize;
use std::fmt;

/// Stable identity of an instance: `name.datacenter`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct InstanceKey(String);

impl InstanceKey {
    pub fn new(name: &str, datacenter: &str) -> InstanceKey {
        InstanceKey(format!("{}.{}", name, datacenter))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Name of a check, unique within a battery.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct CheckName(&'static str);

impl CheckName {
    pub const fn new(name: &'static str) -> CheckName {
        CheckName(name)
    }

    pub fn as_str(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for CheckName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Whether we were able to reach an instance.
///
/// This starts out `Unknown` and is decided exactly once, by the connection
/// gate, the first time any check is attempted against the instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Connectivity {
    Unknown,
    Reachable,
    Unreachable,
}

/// Result of one check against one instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckOutcome {
    /// The check has not run against this instance.
    Unset,
    Pass,
    Fail,
    Warning,
}

impl CheckOutcome {
    /// Returns true for outcomes that count as a problem for migration.
    pub fn is_problem(&self) -> bool {
        matches!(self, CheckOutcome::Fail | CheckOutcome::Warning)
    }
}

impl fmt::Display for CheckOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CheckOutcome::Unset => "UNSET",
            CheckOutcome::Pass => "OK",
            CheckOutcome::Fail => "FAIL",
            CheckOutcome::Warning => "WARNING",
        };
        f.write_str(s)
    }
}

/// An outcome together with the operator-facing explanation for it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Finding {
    pub outcome: CheckOutcome,
    pub detail: String,
}

impl Finding {
    pub fn pass(detail: impl Into<String>) -> Finding {
        Finding { outcome: CheckOutcome::Pass, detail: detail.into() }
    }

    pub fn fail(detail: impl Into<String>) -> Finding {
        Finding { outcome: CheckOutcome::Fail, detail: detail.into() }
    }

    pub fn warning(detail: impl Into<String>) -> Finding {
        Finding { outcome: CheckOutcome::Warning, detail: detail.into() }
    }
}

/// One virtual machine under audit.
#[derive(Clone, Debug, Serialize)]
pub struct Instance {
    key: InstanceKey,
    name: String,
    project: String,
    datacenter: String,
    connectivity: Connectivity,
    findings: IndexMap<CheckName, Finding>,
}

impl Instance {
    pub fn new(name: &str, project: &str, datacenter: &str) -> Instance {
        Instance {
            key: InstanceKey::new(name, datacenter),
            name: name.to_string(),
            project: project.to_string(),
            datacenter: datacenter.to_string(),
            connectivity: Connectivity::Unknown,
            findings: IndexMap::new(),
        }
    }

    pub fn key(&self) -> &InstanceKey {
        &self.key
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn datacenter(&self) -> &str {
        &self.datacenter
    }

    pub fn connectivity(&self) -> Connectivity {
        self.connectivity
    }

    /// Decide connectivity for this instance.
    ///
    /// Only the first decision sticks: once the status is `Reachable` or
    /// `Unreachable`, later calls leave it alone.  Returns the status in
    /// effect after the call.
    pub fn decide_connectivity(&mut self, status: Connectivity) -> Connectivity {
        if self.connectivity == Connectivity::Unknown {
            self.connectivity = status;
        }
        self.connectivity
    }

    /// Returns the outcome recorded for `check`, or `Unset`.
    pub fn outcome(&self, check: CheckName) -> CheckOutcome {
        self.findings
            .get(&check)
            .map(|f| f.outcome)
            .unwrap_or(CheckOutcome::Unset)
    }

    pub fn finding(&self, check: CheckName) -> Option<&Finding> {
        self.findings.get(&check)
    }

    /// Findings in the order the checks ran.
    pub fn findings(&self) -> impl Iterator<Item = (CheckName, &Finding)> {
        self.findings.iter().map(|(name, f)| (*name, f))
    }

    /// Record the result of a check.
    ///
    /// Outcomes can only be recorded against a reachable instance; for any
    /// other connectivity the finding is dropped and `false` is returned.
    pub fn record(&mut self, check: CheckName, finding: Finding) -> bool {
        if self.connectivity != Connectivity::Reachable
            || finding.outcome == CheckOutcome::Unset
        {
            return false;
        }
        self.findings.insert(check, finding);
        true
    }
}
