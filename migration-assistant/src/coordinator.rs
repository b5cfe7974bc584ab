// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Driving the check battery across the fleet.
//!
//! Each instance is audited by its own tokio task, which owns the
//! [`Instance`] for the duration of the audit and hands it back when done.
//! Nothing is shared between instances, so one instance's failures can never
//! leak into another's results.

use crate::checks::{CheckBattery, Clock};
use crate::config::Config;
use crate::directory::{DirectoryError, InstanceDirectory};
use crate::gate::ConnectionGate;
use crate::instance::{
    CheckName, CheckOutcome, Connectivity, Finding, Instance,
};
use crate::registry::{EmptyFleetError, ExclusionPolicy, Registry};
use crate::report::{summarize, RunSummary};
use crate::transport::{BoxedTransport, Remote, Retry};
use display_error_chain::DisplayErrorChain;
use slog::{error, info, o, warn, Logger};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Everything an audit run needs, passed explicitly to every worker.
#[derive(Clone)]
pub struct RunContext {
    log: Logger,
    /// Used by the gate, which does its own retrying.
    transport: BoxedTransport,
    /// Used by checks: `transport` with transient failures retried.
    check_transport: BoxedTransport,
    battery: CheckBattery,
    gate: ConnectionGate,
    parallelism: usize,
    cancel: CancellationToken,
}

impl RunContext {
    pub fn new(
        log: &Logger,
        transport: BoxedTransport,
        battery: CheckBattery,
        gate: ConnectionGate,
        parallelism: usize,
    ) -> RunContext {
        let check_transport: BoxedTransport = Arc::new(Retry::new(
            log,
            Arc::clone(&transport),
            gate.attempts(),
            gate.retry_interval(),
        ));
        RunContext {
            log: log.new(o!("component" => "RunCoordinator")),
            transport,
            check_transport,
            battery,
            gate,
            parallelism: parallelism.max(1),
            cancel: CancellationToken::new(),
        }
    }

    /// Build a context from configuration, running commands through
    /// `transport` with the configured timeout.
    pub fn from_config(
        log: &Logger,
        config: &Config,
        transport: BoxedTransport,
        clock: Clock,
    ) -> RunContext {
        let remote =
            Remote::new(log, transport, config.transport.command_timeout);
        let gate = ConnectionGate::new(
            log,
            config.transport.connection_attempts,
            config.transport.retry_interval,
        );
        RunContext::new(
            log,
            Arc::new(remote),
            CheckBattery::standard(&config.policy, clock),
            gate,
            config.transport.parallelism,
        )
    }

    pub fn battery(&self) -> &CheckBattery {
        &self.battery
    }

    /// Cancelling this token stops new probes from being issued.  Probes
    /// already in flight run to completion (or to their timeout).
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("failed to list instances")]
    Directory(#[from] DirectoryError),

    #[error(transparent)]
    EmptyFleet(#[from] EmptyFleetError),
}

/// List the instances `identity` administers, audit all of them, and
/// summarize the results.
pub async fn audit_fleet(
    ctx: &RunContext,
    directory: &dyn InstanceDirectory,
    identity: &str,
    exclusions: &ExclusionPolicy,
) -> Result<RunSummary, AuditError> {
    let records = directory.list_instances(identity).await?;
    let mut registry = Registry::build(&ctx.log, records, exclusions)?;
    execute(ctx, &mut registry).await;
    Ok(summarize(&registry, &ctx.battery.names()))
}

/// Run the battery against every instance in `registry`.
pub async fn execute(ctx: &RunContext, registry: &mut Registry) {
    let instances = registry.take_instances();
    info!(
        ctx.log,
        "auditing instances";
        "count" => instances.len(),
        "checks" => ctx.battery.len(),
        "parallelism" => ctx.parallelism,
    );

    // A worker that dies leaves its instance as it found it.
    let mut slots = instances.clone();
    let semaphore = Arc::new(Semaphore::new(ctx.parallelism));
    let mut workers = JoinSet::new();
    for (index, mut instance) in instances.into_iter().enumerate() {
        let ctx = ctx.clone();
        let semaphore = Arc::clone(&semaphore);
        workers.spawn(async move {
            // Hold onto the permit until the audit finishes
            let permit = semaphore
                .acquire_owned()
                .await
                .expect("we never close the semaphore");
            audit_instance(&ctx, &mut instance).await;
            drop(permit);
            (index, instance)
        });
    }

    while let Some(result) = workers.join_next().await {
        match result {
            Ok((index, instance)) => slots[index] = instance,
            Err(error) => {
                error!(
                    ctx.log,
                    "instance audit task failed";
                    "error" => %DisplayErrorChain::new(&error),
                );
            }
        }
    }
    registry.restore_instances(slots);
}

async fn audit_instance(ctx: &RunContext, instance: &mut Instance) {
    let log = ctx.log.new(o!("instance" => instance.key().to_string()));
    let transport = &*ctx.transport;

    if ctx.cancel.is_cancelled() {
        warn!(log, "audit interrupted before instance was contacted");
        return;
    }
    if ctx.gate.ensure_connected(instance, transport).await
        != Connectivity::Reachable
    {
        warn!(
            log,
            "there were problems connecting to this instance; please fix \
             those first and then rerun"
        );
        return;
    }

    for check in ctx.battery.iter() {
        if ctx.cancel.is_cancelled() {
            warn!(log, "audit interrupted; remaining checks skipped");
            return;
        }
        // Memoized: this only ever probes once.
        if ctx.gate.ensure_connected(instance, transport).await
            != Connectivity::Reachable
        {
            return;
        }

        let finding = match check
            .run(instance.key().as_str(), &*ctx.check_transport)
            .await
        {
            Ok(finding) => finding,
            Err(error) => Finding::warning(format!(
                "could not verify: {}",
                DisplayErrorChain::new(&error)
            )),
        };
        log_finding(&log, check.name(), &finding);
        instance.record(check.name(), finding);
    }
}

fn log_finding(log: &Logger, check: CheckName, finding: &Finding) {
    match finding.outcome {
        CheckOutcome::Pass => {
            info!(
                log, "{} [{}]", finding.detail, finding.outcome;
                "check" => %check,
            );
        }
        CheckOutcome::Fail | CheckOutcome::Warning | CheckOutcome::Unset => {
            warn!(
                log, "{} [{}]", finding.detail, finding.outcome;
                "check" => %check,
            );
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::checks::{home_usage, Check};
    use crate::fakes::{FakeResponse, FakeTransport, ANY_HOST};
    use crate::registry::RawInstanceRecord;
    use crate::report::Verdict;
    use crate::transport::{Transport, TransportError};
    use async_trait::async_trait;
    use std::time::Duration;

    const EXPLODES: CheckName = CheckName::new("explodes");

    /// Takes down the worker auditing `host`; passes everywhere else.
    struct ExplodesOn {
        host: &'static str,
    }

    #[async_trait]
    impl Check for ExplodesOn {
        fn name(&self) -> CheckName {
            EXPLODES
        }

        async fn run(
            &self,
            host: &str,
            _transport: &dyn Transport,
        ) -> Result<Finding, TransportError> {
            if host == self.host {
                panic!("check blew up on {}", host);
            }
            Ok(Finding::pass("fine"))
        }
    }

    fn log() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    fn context(
        fake: &Arc<FakeTransport>,
        battery: CheckBattery,
    ) -> RunContext {
        let gate = ConnectionGate::new(&log(), 2, Duration::from_millis(1));
        let transport = fake.clone().as_transport();
        RunContext::new(&log(), transport, battery, gate, 2)
    }

    fn registry(names: &[&str]) -> Registry {
        let records = names
            .iter()
            .map(|name| RawInstanceRecord::new(name, "analytics", "pmtpa"))
            .collect();
        Registry::build(&log(), records, &ExclusionPolicy::default()).unwrap()
    }

    #[tokio::test]
    async fn test_connection_lost_mid_check_is_contained() {
        let fake = FakeTransport::new();
        fake.respond(
            "a.pmtpa",
            home_usage::COMMAND,
            FakeResponse::ConnectionLost,
        );
        fake.respond(
            ANY_HOST,
            home_usage::COMMAND,
            FakeResponse::output(""),
        );
        let ctx = context(
            &fake,
            CheckBattery::new().with(home_usage::LocalStorageInHome),
        );
        let mut registry = registry(&["a", "b"]);
        execute(&ctx, &mut registry).await;

        let keys: Vec<_> =
            registry.iter().map(|i| i.key().to_string()).collect();
        assert_eq!(keys, ["a.pmtpa", "b.pmtpa"]);

        let a = registry.iter().next().unwrap();
        assert_eq!(a.connectivity(), Connectivity::Reachable);
        assert_eq!(a.outcome(home_usage::NAME), CheckOutcome::Warning);
        let b = registry.iter().nth(1).unwrap();
        assert_eq!(b.outcome(home_usage::NAME), CheckOutcome::Pass);
    }

    #[tokio::test]
    async fn test_dropped_connection_is_retried_within_a_check() {
        let fake = FakeTransport::healthy();
        fake.interrupt("a.pmtpa", home_usage::COMMAND, 1);
        let ctx = context(
            &fake,
            CheckBattery::new().with(home_usage::LocalStorageInHome),
        );
        let mut registry = registry(&["a"]);
        execute(&ctx, &mut registry).await;

        let a = registry.iter().next().unwrap();
        assert_eq!(a.outcome(home_usage::NAME), CheckOutcome::Pass);
        assert_eq!(fake.count_matching("a.pmtpa", home_usage::COMMAND), 2);
        assert_eq!(fake.probe_count("a.pmtpa"), 1);
    }

    #[tokio::test]
    async fn test_panicking_worker_leaves_instance_incomplete() {
        let fake = FakeTransport::healthy();
        let battery = CheckBattery::new()
            .with(ExplodesOn { host: "a.pmtpa" })
            .with(home_usage::LocalStorageInHome);
        let ctx = context(&fake, battery);
        let mut registry = registry(&["a", "b"]);
        execute(&ctx, &mut registry).await;

        let keys: Vec<_> =
            registry.iter().map(|i| i.key().to_string()).collect();
        assert_eq!(keys, ["a.pmtpa", "b.pmtpa"]);

        // The dead worker's instance is handed back untouched.
        let a = registry.iter().next().unwrap();
        assert_eq!(a.connectivity(), Connectivity::Unknown);
        assert_eq!(a.outcome(EXPLODES), CheckOutcome::Unset);
        let b = registry.iter().nth(1).unwrap();
        assert_eq!(b.outcome(EXPLODES), CheckOutcome::Pass);
        assert_eq!(b.outcome(home_usage::NAME), CheckOutcome::Pass);

        let summary = summarize(&registry, &ctx.battery().names());
        assert_eq!(summary.instances[0].verdict, Verdict::Incomplete);
        assert_eq!(summary.instances[1].verdict, Verdict::Ready);
        assert!(!summary.all_ready());
    }

    #[tokio::test]
    async fn test_cancelled_run_issues_no_probes() {
        let fake = FakeTransport::healthy();
        let ctx = context(
            &fake,
            CheckBattery::new().with(home_usage::LocalStorageInHome),
        );
        ctx.cancellation_token().cancel();
        let mut registry = registry(&["a", "b", "c"]);
        execute(&ctx, &mut registry).await;

        assert!(fake.calls().is_empty());
        assert!(registry
            .iter()
            .all(|i| i.connectivity() == Connectivity::Unknown));
    }
}
