// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Deciding, once per instance, whether it can be reached at all.

use crate::instance::{Connectivity, Instance};
use crate::transport::{CommandOptions, Transport, TransportError};
use backoff::future::retry_notify;
use backoff::{Error as BackoffError, ExponentialBackoff};
use display_error_chain::DisplayErrorChain;
use slog::{info, warn, Logger};
use std::time::Duration;

/// Side-effect free command used to find out whether a host answers.
pub const PROBE_COMMAND: &str = "true";

/// Backoff used between attempts: doubling from `interval`, capped at eight
/// times it.  Attempt counting is left to the caller.
pub(crate) fn retry_policy(interval: Duration) -> ExponentialBackoff {
    ExponentialBackoff {
        current_interval: interval,
        initial_interval: interval,
        multiplier: 2.0,
        max_interval: interval * 8,
        max_elapsed_time: None,
        ..ExponentialBackoff::default()
    }
}

/// Guards every check against an instance behind a single, memoized
/// connectivity decision.
#[derive(Clone, Debug)]
pub struct ConnectionGate {
    log: Logger,
    attempts: u32,
    retry_interval: Duration,
}

impl ConnectionGate {
    /// `attempts` is the total number of probes sent before a host is
    /// declared unreachable (at least one is always sent).
    pub fn new(log: &Logger, attempts: u32, retry_interval: Duration) -> Self {
        ConnectionGate {
            log: log.new(slog::o!("component" => "ConnectionGate")),
            attempts: attempts.max(1),
            retry_interval,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn retry_interval(&self) -> Duration {
        self.retry_interval
    }

    /// Returns the connectivity of `instance`, probing it first if that has
    /// not been decided yet.
    ///
    /// Transient connection failures are retried up to the configured number
    /// of attempts.  A probe that reaches the host but exits non-zero still
    /// counts as reachable.
    pub async fn ensure_connected(
        &self,
        instance: &mut Instance,
        transport: &dyn Transport,
    ) -> Connectivity {
        if instance.connectivity() != Connectivity::Unknown {
            return instance.connectivity();
        }

        let host = instance.key().to_string();
        let max_attempts = self.attempts;
        let mut attempt = 0;
        let probe = || {
            attempt += 1;
            let this_attempt = attempt;
            let host = host.as_str();
            async move {
                match transport
                    .run_command(host, PROBE_COMMAND, CommandOptions::PLAIN)
                    .await
                {
                    Ok(_) => Ok(()),
                    Err(e) if !e.is_connection_failure() => Ok(()),
                    Err(e) if e.is_transient() && this_attempt < max_attempts => {
                        Err(BackoffError::transient(e))
                    }
                    Err(e) => Err(BackoffError::permanent(e)),
                }
            }
        };
        let log_failure = |error: TransportError, delay: Duration| {
            warn!(
                self.log,
                "connectivity probe failed, will retry";
                "instance" => &host,
                "delay" => ?delay,
                "error" => %DisplayErrorChain::new(&error),
            );
        };

        let policy = retry_policy(self.retry_interval);
        let status = match retry_notify(policy, probe, log_failure).await {
            Ok(()) => {
                info!(self.log, "instance is reachable"; "instance" => &host);
                Connectivity::Reachable
            }
            Err(error) => {
                warn!(
                    self.log,
                    "could not connect to instance";
                    "instance" => &host,
                    "error" => %DisplayErrorChain::new(&error),
                );
                Connectivity::Unreachable
            }
        };
        instance.decide_connectivity(status)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fakes::FakeTransport;

    fn gate(attempts: u32) -> ConnectionGate {
        let log = Logger::root(slog::Discard, slog::o!());
        ConnectionGate::new(&log, attempts, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_probe_is_memoized() {
        let fake = FakeTransport::new();
        let gate = gate(3);
        let mut instance = Instance::new("limn0", "analytics", "pmtpa");
        for _ in 0..5 {
            assert_eq!(
                gate.ensure_connected(&mut instance, &*fake).await,
                Connectivity::Reachable
            );
        }
        assert_eq!(fake.probe_count("limn0.pmtpa"), 1);
    }

    #[tokio::test]
    async fn test_unreachable_after_attempts_exhausted() {
        let fake = FakeTransport::new();
        fake.unreachable("limn0.pmtpa");
        let gate = gate(3);
        let mut instance = Instance::new("limn0", "analytics", "pmtpa");
        assert_eq!(
            gate.ensure_connected(&mut instance, &*fake).await,
            Connectivity::Unreachable
        );
        assert_eq!(fake.probe_count("limn0.pmtpa"), 3);

        // The verdict sticks, and no more probes go out.
        assert_eq!(
            gate.ensure_connected(&mut instance, &*fake).await,
            Connectivity::Unreachable
        );
        assert_eq!(fake.probe_count("limn0.pmtpa"), 3);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let fake = FakeTransport::new();
        fake.flaky("limn0.pmtpa", 2);
        let gate = gate(3);
        let mut instance = Instance::new("limn0", "analytics", "pmtpa");
        assert_eq!(
            gate.ensure_connected(&mut instance, &*fake).await,
            Connectivity::Reachable
        );
        assert_eq!(fake.probe_count("limn0.pmtpa"), 3);
    }

    #[tokio::test]
    async fn test_retry_budget_is_bounded() {
        let fake = FakeTransport::new();
        fake.flaky("limn0.pmtpa", 2);
        let gate = gate(2);
        let mut instance = Instance::new("limn0", "analytics", "pmtpa");
        assert_eq!(
            gate.ensure_connected(&mut instance, &*fake).await,
            Connectivity::Unreachable
        );
        assert_eq!(fake.probe_count("limn0.pmtpa"), 2);
    }
}
