// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Building the set of instances under audit from directory data.

use crate::config::FleetConfig;
use crate::instance::{Instance, InstanceKey};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use slog::{debug, info, warn, Logger};
use std::fmt;
use thiserror::Error;

/// An instance as reported by the instance directory, before filtering.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct RawInstanceRecord {
    pub name: String,
    pub project: String,
    pub datacenter: String,
}

impl RawInstanceRecord {
    pub fn new(name: &str, project: &str, datacenter: &str) -> Self {
        RawInstanceRecord {
            name: name.to_string(),
            project: project.to_string(),
            datacenter: datacenter.to_string(),
        }
    }

    /// Returns true if the name and datacenter can safely become part of a
    /// hostname handed to `ssh`.
    fn is_addressable(&self) -> bool {
        is_host_label(&self.name) && is_host_label(&self.datacenter)
    }
}

/// Directory data is not trusted: anything that could be read as an option
/// or break out of a hostname is refused.
fn is_host_label(s: &str) -> bool {
    !s.is_empty()
        && !s.starts_with('-')
        && s.chars().all(|c| {
            c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.'
        })
}

/// A single reason to leave an instance out of the audit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExclusionRule {
    /// Names starting with this prefix are centrally managed.
    NamePrefix(String),
    /// This exact instance name (or `name.datacenter` key) is ignored.
    Ignored(String),
}

impl ExclusionRule {
    fn matches(&self, record: &RawInstanceRecord) -> bool {
        match self {
            ExclusionRule::NamePrefix(prefix) => {
                record.name.starts_with(prefix.as_str())
            }
            ExclusionRule::Ignored(name) => {
                record.name == *name
                    || InstanceKey::new(&record.name, &record.datacenter)
                        .as_str()
                        == name
            }
        }
    }
}

impl fmt::Display for ExclusionRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExclusionRule::NamePrefix(prefix) => {
                write!(f, "name starts with {:?}", prefix)
            }
            ExclusionRule::Ignored(name) => {
                write!(f, "{:?} is on the ignore list", name)
            }
        }
    }
}

/// The set of rules used to drop instances from the audit.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExclusionPolicy {
    rules: Vec<ExclusionRule>,
}

impl ExclusionPolicy {
    pub fn new(rules: Vec<ExclusionRule>) -> ExclusionPolicy {
        ExclusionPolicy { rules }
    }

    pub fn from_config(config: &FleetConfig) -> ExclusionPolicy {
        let rules = config
            .exclude_prefixes
            .iter()
            .map(|p| ExclusionRule::NamePrefix(p.clone()))
            .chain(
                config.ignore.iter().map(|n| ExclusionRule::Ignored(n.clone())),
            )
            .collect();
        ExclusionPolicy { rules }
    }

    /// Returns the first rule excluding `record`, if any.
    pub fn excludes(&self, record: &RawInstanceRecord) -> Option<&ExclusionRule> {
        self.rules.iter().find(|rule| rule.matches(record))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error(
    "no instances to audit: the directory listed {listed} instance(s), \
     none of which survived filtering"
)]
pub struct EmptyFleetError {
    pub listed: usize,
}

/// The instances under audit, keyed by `name.datacenter`, in the order the
/// directory reported them.
#[derive(Clone, Debug, Default)]
pub struct Registry {
    instances: IndexMap<InstanceKey, Instance>,
}

impl Registry {
    /// Build the registry from raw directory records.
    ///
    /// Records matching `policy` are dropped, as are records whose name or
    /// datacenter is not a plausible host label, and repeated keys (the first
    /// occurrence wins).
    pub fn build(
        log: &Logger,
        records: Vec<RawInstanceRecord>,
        policy: &ExclusionPolicy,
    ) -> Result<Registry, EmptyFleetError> {
        let listed = records.len();
        let mut instances = IndexMap::new();
        for record in records {
            if !record.is_addressable() {
                warn!(
                    log,
                    "skipping instance with unusable name";
                    "name" => ?record.name,
                    "datacenter" => ?record.datacenter,
                    "project" => &record.project,
                );
                continue;
            }
            if let Some(rule) = policy.excludes(&record) {
                debug!(
                    log,
                    "skipping instance";
                    "name" => &record.name,
                    "datacenter" => &record.datacenter,
                    "reason" => %rule,
                );
                continue;
            }
            let instance = Instance::new(
                &record.name,
                &record.project,
                &record.datacenter,
            );
            if instances.contains_key(instance.key()) {
                debug!(log, "duplicate instance"; "key" => %instance.key());
                continue;
            }
            instances.insert(instance.key().clone(), instance);
        }

        if instances.is_empty() {
            return Err(EmptyFleetError { listed });
        }
        info!(
            log,
            "built instance registry";
            "listed" => listed,
            "audited" => instances.len(),
        );
        Ok(Registry { instances })
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn get(&self, key: &InstanceKey) -> Option<&Instance> {
        self.instances.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Instance> {
        self.instances.values()
    }

    pub(crate) fn take_instances(&mut self) -> Vec<Instance> {
        std::mem::take(&mut self.instances).into_values().collect()
    }

    pub(crate) fn restore_instances(&mut self, instances: Vec<Instance>) {
        self.instances = instances
            .into_iter()
            .map(|instance| (instance.key().clone(), instance))
            .collect();
    }
}
