// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end audits against a scripted transport.

use assert_matches::assert_matches;
use chrono::{DateTime, TimeZone, Utc};
use migration_assistant::checks::{
    home_mount, home_usage, puppet_run, system_clock, Clock,
};
use migration_assistant::directory::StaticDirectory;
use migration_assistant::fakes::{FakeResponse, FakeTransport};
use migration_assistant::registry::RawInstanceRecord;
use migration_assistant::report::RunSummary;
use migration_assistant::{
    audit_fleet, AuditError, CheckOutcome, Config, Connectivity,
    EmptyFleetError, ExclusionPolicy, RunContext, Verdict,
};
use slog::{o, Logger};
use std::sync::Arc;
use std::time::Duration;

fn log() -> Logger {
    Logger::root(slog::Discard, o!())
}

fn config() -> Config {
    let mut config = Config::default();
    config.transport.retry_interval = Duration::from_millis(1);
    config
}

fn context(fake: &Arc<FakeTransport>, clock: Clock) -> RunContext {
    let transport = fake.clone().as_transport();
    RunContext::from_config(&log(), &config(), transport, clock)
}

async fn audit(
    fake: &Arc<FakeTransport>,
    records: Vec<RawInstanceRecord>,
) -> RunSummary {
    let ctx = context(fake, system_clock());
    let policy = ExclusionPolicy::from_config(&config().fleet);
    audit_fleet(&ctx, &StaticDirectory::new(records), "someone", &policy)
        .await
        .expect("audit succeeds")
}

fn analytics(name: &str) -> RawInstanceRecord {
    RawInstanceRecord::new(name, "analytics", "pmtpa")
}

const LOCAL_HOME: &str =
    "Filesystem 1024-blocks Used Available Capacity Mounted on\n\
     /dev/vda1 10188088 3323736 6323680 35% /\n";

#[tokio::test]
async fn test_limn0_with_local_home_is_not_ready() {
    let fake = FakeTransport::healthy();
    fake.respond(
        "limn0.pmtpa",
        home_mount::COMMAND,
        FakeResponse::output(LOCAL_HOME),
    );

    let summary = audit(&fake, vec![analytics("limn0")]).await;
    let limn0 = summary.get("limn0.pmtpa").unwrap();
    assert_eq!(limn0.connectivity, Connectivity::Reachable);
    assert_eq!(limn0.problem_count, 1);
    assert_matches!(&limn0.verdict, Verdict::NotReady { problems } => {
        assert_eq!(problems.len(), 1);
        assert_eq!(problems[0].check, home_mount::NAME);
        assert_eq!(problems[0].outcome, CheckOutcome::Fail);
    });
    assert!(!summary.all_ready());
    assert!(summary
        .to_string()
        .contains("Problem 1: shared-storage-for-home [FAIL]"));
}

#[tokio::test]
async fn test_instances_are_isolated() {
    let fake = FakeTransport::healthy();
    fake.unreachable("kripke.pmtpa");

    let summary =
        audit(&fake, vec![analytics("kripke"), analytics("limn0")]).await;
    let keys: Vec<_> =
        summary.instances.iter().map(|i| i.key.as_str()).collect();
    assert_eq!(keys, ["kripke.pmtpa", "limn0.pmtpa"]);

    let kripke = summary.get("kripke.pmtpa").unwrap();
    assert_eq!(kripke.verdict, Verdict::Unreachable);
    assert_eq!(kripke.problem_count, 1);
    assert!(kripke.checks.iter().all(|c| c.outcome == CheckOutcome::Unset));
    assert_eq!(kripke.checks.len(), 5);

    let limn0 = summary.get("limn0.pmtpa").unwrap();
    assert_eq!(limn0.verdict, Verdict::Ready);
    assert_eq!(limn0.problem_count, 0);
    assert_eq!(summary.unreachable, 1);

    // Only connectivity probes ever went to the unreachable instance.
    let attempts = config().transport.connection_attempts as usize;
    assert_eq!(fake.calls_to("kripke.pmtpa").len(), attempts);
}

#[tokio::test]
async fn test_connectivity_is_probed_once_per_instance() {
    let fake = FakeTransport::healthy();
    let summary =
        audit(&fake, vec![analytics("limn0"), analytics("kripke")]).await;
    assert!(summary.all_ready());
    assert_eq!(fake.probe_count("limn0.pmtpa"), 1);
    assert_eq!(fake.probe_count("kripke.pmtpa"), 1);
}

#[tokio::test]
async fn test_transient_connection_failures_are_retried() {
    let fake = FakeTransport::healthy();
    fake.flaky("limn0.pmtpa", 2);

    let summary = audit(&fake, vec![analytics("limn0")]).await;
    assert_eq!(fake.probe_count("limn0.pmtpa"), 3);
    assert!(summary.all_ready());
}

#[tokio::test]
async fn test_empty_fleet_contacts_nobody() {
    let fake = FakeTransport::healthy();
    let ctx = context(&fake, system_clock());
    let policy = ExclusionPolicy::from_config(&config().fleet);
    let directory = StaticDirectory::new(vec![
        RawInstanceRecord::new("tools-login", "tools", "pmtpa"),
        RawInstanceRecord::new("tools-exec-01", "tools", "eqiad"),
    ]);

    let error = audit_fleet(&ctx, &directory, "someone", &policy)
        .await
        .unwrap_err();
    assert_matches!(
        error,
        AuditError::EmptyFleet(EmptyFleetError { listed: 2 })
    );
    assert!(fake.calls().is_empty());
}

#[tokio::test]
async fn test_connection_lost_mid_battery() {
    let fake = FakeTransport::healthy();
    fake.respond(
        "limn0.pmtpa",
        home_usage::COMMAND,
        FakeResponse::ConnectionLost,
    );

    let summary = audit(&fake, vec![analytics("limn0")]).await;
    let limn0 = summary.get("limn0.pmtpa").unwrap();
    assert_eq!(limn0.connectivity, Connectivity::Reachable);
    assert_eq!(limn0.problem_count, 1);
    let outcomes: Vec<_> = limn0.checks.iter().map(|c| c.outcome).collect();
    assert_eq!(
        outcomes,
        [
            CheckOutcome::Pass,
            CheckOutcome::Pass,
            CheckOutcome::Warning,
            CheckOutcome::Pass,
            CheckOutcome::Pass,
        ]
    );
}

#[tokio::test]
async fn test_puppet_freshness_boundary() {
    let now: DateTime<Utc> =
        Utc.with_ymd_and_hms(2014, 6, 1, 12, 0, 0).unwrap();
    let threshold = config().policy.puppet_freshness.as_secs() as i64;
    let clock: Clock = Arc::new(move || now);

    for (age, expected) in [
        (threshold, CheckOutcome::Pass),
        (threshold + 1, CheckOutcome::Fail),
    ] {
        let fake = FakeTransport::healthy();
        fake.respond(
            "limn0.pmtpa",
            puppet_run::RUN_SUMMARY_PATH,
            FakeResponse::output(format!(
                "---\n  time:\n    last_run: {}\n",
                now.timestamp() - age
            )),
        );
        let ctx = context(&fake, clock.clone());
        let summary = audit_fleet(
            &ctx,
            &StaticDirectory::new(vec![analytics("limn0")]),
            "someone",
            &ExclusionPolicy::default(),
        )
        .await
        .unwrap();
        let limn0 = summary.get("limn0.pmtpa").unwrap();
        let check =
            limn0.checks.iter().find(|c| c.check == puppet_run::NAME).unwrap();
        assert_eq!(check.outcome, expected, "age {}s", age);
    }
}

#[tokio::test]
async fn test_json_summary() {
    let fake = FakeTransport::healthy();
    fake.unreachable("kripke.pmtpa");
    let summary = audit(&fake, vec![analytics("kripke")]).await;

    let json = serde_json::to_value(&summary).unwrap();
    assert_eq!(json["unreachable"], 1);
    assert_eq!(json["instances"][0]["verdict"], "unreachable");
    assert_eq!(json["instances"][0]["problem_count"], 1);
    assert_eq!(
        json["instances"][0]["checks"][0]["check"],
        "self-hosted-puppetmaster"
    );
}
