// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Turning recorded outcomes into per-instance verdicts.

use crate::instance::{CheckName, CheckOutcome, Connectivity, Instance};
use crate::registry::Registry;
use serde::Serialize;
use std::fmt;

/// The verdict for a single instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    /// Reachable, and every check passed.
    Ready,
    /// Reachable, and at least one check failed or warned.
    NotReady { problems: Vec<Problem> },
    /// We could not connect, so nothing else is known.
    Unreachable,
    /// The audit did not finish (interrupted, or the worker died).
    Incomplete,
}

impl Verdict {
    pub fn is_ready(&self) -> bool {
        matches!(self, Verdict::Ready)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Problem {
    pub check: CheckName,
    pub outcome: CheckOutcome,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CheckReport {
    pub check: CheckName,
    pub outcome: CheckOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct InstanceReport {
    pub key: String,
    pub name: String,
    pub project: String,
    pub datacenter: String,
    pub connectivity: Connectivity,
    pub checks: Vec<CheckReport>,
    /// One for an unreachable instance, plus one per FAIL or WARNING.
    pub problem_count: usize,
    #[serde(flatten)]
    pub verdict: Verdict,
}

impl InstanceReport {
    fn from_instance(instance: &Instance, checks: &[CheckName]) -> Self {
        let reports: Vec<CheckReport> = checks
            .iter()
            .map(|&check| CheckReport {
                check,
                outcome: instance.outcome(check),
                detail: instance.finding(check).map(|f| f.detail.clone()),
            })
            .collect();
        let problems: Vec<Problem> = reports
            .iter()
            .filter(|r| r.outcome.is_problem())
            .map(|r| Problem {
                check: r.check,
                outcome: r.outcome,
                detail: r.detail.clone().unwrap_or_default(),
            })
            .collect();

        let connectivity = instance.connectivity();
        let problem_count = problems.len()
            + usize::from(connectivity == Connectivity::Unreachable);
        let verdict = match connectivity {
            Connectivity::Unreachable => Verdict::Unreachable,
            Connectivity::Unknown => Verdict::Incomplete,
            Connectivity::Reachable if !problems.is_empty() => {
                Verdict::NotReady { problems }
            }
            Connectivity::Reachable
                if reports.iter().any(|r| r.outcome == CheckOutcome::Unset) =>
            {
                Verdict::Incomplete
            }
            Connectivity::Reachable => Verdict::Ready,
        };

        InstanceReport {
            key: instance.key().to_string(),
            name: instance.name().to_string(),
            project: instance.project().to_string(),
            datacenter: instance.datacenter().to_string(),
            connectivity,
            checks: reports,
            problem_count,
            verdict,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.verdict.is_ready()
    }
}

impl fmt::Display for InstanceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (project {}): ", self.key, self.project)?;
        match &self.verdict {
            Verdict::Ready => writeln!(f, "ready for migration"),
            Verdict::Unreachable => writeln!(
                f,
                "could not connect; please fix connectivity first and rerun"
            ),
            Verdict::Incomplete => {
                writeln!(f, "audit incomplete; rerun to get a verdict")
            }
            Verdict::NotReady { problems } => {
                writeln!(
                    f,
                    "not ready for migration, {} problem(s)",
                    self.problem_count
                )?;
                for (i, problem) in problems.iter().enumerate() {
                    writeln!(
                        f,
                        "    Problem {}: {} [{}] {}",
                        i + 1,
                        problem.check,
                        problem.outcome,
                        problem.detail
                    )?;
                }
                Ok(())
            }
        }
    }
}

/// The outcome of a whole audit run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub instances: Vec<InstanceReport>,
    pub unreachable: usize,
}

impl RunSummary {
    pub fn all_ready(&self) -> bool {
        self.instances.iter().all(InstanceReport::is_ready)
    }

    pub fn ready_count(&self) -> usize {
        self.instances.iter().filter(|i| i.is_ready()).count()
    }

    pub fn get(&self, key: &str) -> Option<&InstanceReport> {
        self.instances.iter().find(|i| i.key == key)
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for instance in &self.instances {
            write!(f, "{}", instance)?;
        }
        let ready = self.ready_count();
        writeln!(
            f,
            "{} of {} instance(s) ready for migration, {} not ready \
             ({} unreachable)",
            ready,
            self.instances.len(),
            self.instances.len() - ready,
            self.unreachable
        )
    }
}

/// Compute verdicts for every instance in `registry`, listing `checks` in
/// the given order.
///
/// This is a pure function of the recorded state.
pub fn summarize(registry: &Registry, checks: &[CheckName]) -> RunSummary {
    let instances: Vec<InstanceReport> = registry
        .iter()
        .map(|instance| InstanceReport::from_instance(instance, checks))
        .collect();
    let unreachable = instances
        .iter()
        .filter(|i| i.connectivity == Connectivity::Unreachable)
        .count();
    RunSummary { instances, unreachable }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::instance::Finding;
    use crate::registry::{ExclusionPolicy, RawInstanceRecord};
    use assert_matches::assert_matches;
    use slog::{o, Logger};

    const FIRST: CheckName = CheckName::new("first");
    const SECOND: CheckName = CheckName::new("second");
    const CHECKS: &[CheckName] = &[FIRST, SECOND];

    fn instance() -> Instance {
        Instance::new("limn0", "analytics", "pmtpa")
    }

    #[test]
    fn test_ready() {
        let mut instance = instance();
        instance.decide_connectivity(Connectivity::Reachable);
        instance.record(FIRST, Finding::pass("fine"));
        instance.record(SECOND, Finding::pass("also fine"));
        let report = InstanceReport::from_instance(&instance, CHECKS);
        assert_eq!(report.problem_count, 0);
        assert!(report.is_ready());
        assert_eq!(
            report.to_string(),
            "limn0.pmtpa (project analytics): ready for migration\n"
        );
    }

    #[test]
    fn test_problems_are_enumerated_in_battery_order() {
        let mut instance = instance();
        instance.decide_connectivity(Connectivity::Reachable);
        instance.record(SECOND, Finding::warning("hmm"));
        instance.record(FIRST, Finding::fail("broken"));
        let report = InstanceReport::from_instance(&instance, CHECKS);
        assert_eq!(report.problem_count, 2);
        assert_matches!(&report.verdict, Verdict::NotReady { problems } => {
            assert_eq!(problems[0].check, FIRST);
            assert_eq!(problems[1].check, SECOND);
        });
        let text = report.to_string();
        assert!(text.contains("Problem 1: first [FAIL] broken"));
        assert!(text.contains("Problem 2: second [WARNING] hmm"));
    }

    #[test]
    fn test_unreachable_counts_as_one_problem() {
        let mut instance = instance();
        instance.decide_connectivity(Connectivity::Unreachable);
        let report = InstanceReport::from_instance(&instance, CHECKS);
        assert_eq!(report.problem_count, 1);
        assert_eq!(report.verdict, Verdict::Unreachable);
        assert!(report
            .checks
            .iter()
            .all(|c| c.outcome == CheckOutcome::Unset));
    }

    #[test]
    fn test_unfinished_audits_are_incomplete() {
        let report = InstanceReport::from_instance(&instance(), CHECKS);
        assert_eq!(report.verdict, Verdict::Incomplete);
        assert_eq!(report.problem_count, 0);

        let mut instance = instance();
        instance.decide_connectivity(Connectivity::Reachable);
        instance.record(FIRST, Finding::pass("fine"));
        let report = InstanceReport::from_instance(&instance, CHECKS);
        assert_eq!(report.verdict, Verdict::Incomplete);
        assert!(!report.is_ready());
    }

    #[test]
    fn test_summary() {
        let log = Logger::root(slog::Discard, o!());
        let registry = Registry::build(
            &log,
            vec![
                RawInstanceRecord::new("limn0", "analytics", "pmtpa"),
                RawInstanceRecord::new("kripke", "analytics", "pmtpa"),
            ],
            &ExclusionPolicy::default(),
        )
        .unwrap();
        let summary = summarize(&registry, CHECKS);
        assert_eq!(summary.instances.len(), 2);
        assert_eq!(summary.unreachable, 0);
        assert!(!summary.all_ready());
        assert!(summary.to_string().ends_with(
            "0 of 2 instance(s) ready for migration, 2 not ready \
             (0 unreachable)\n"
        ));

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["instances"][0]["key"], "limn0.pmtpa");
        assert_eq!(json["instances"][0]["verdict"], "incomplete");
        assert_eq!(json["instances"][0]["checks"][1]["outcome"], "unset");
    }
}
