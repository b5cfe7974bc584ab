// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A scripted [`Transport`] for tests and offline runs.

use crate::checks;
use crate::config::CheckPolicy;
use crate::gate::PROBE_COMMAND;
use crate::transport::{
    BoxedTransport, CommandOptions, Transport, TransportError,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Matches any host in [`FakeTransport::respond`].
pub const ANY_HOST: &str = "*";

/// What the fake does when it sees a matching command.
#[derive(Clone, Debug)]
pub enum FakeResponse {
    /// The command succeeds, printing this to stdout.
    Output(String),
    /// The command runs and exits with `status`.
    Exit { status: i32, stderr: String },
    /// The connection drops while the command is running.
    ConnectionLost,
    /// The command never finishes within `Duration`.
    Hang(Duration),
}

impl FakeResponse {
    pub fn output(s: impl Into<String>) -> FakeResponse {
        FakeResponse::Output(s.into())
    }

    pub fn exit(status: i32) -> FakeResponse {
        FakeResponse::Exit { status, stderr: String::new() }
    }
}

/// A command observed by the fake.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FakeCall {
    pub host: String,
    pub command: String,
    pub elevated: bool,
}

#[derive(Clone, Copy, Debug)]
enum Reachability {
    Up,
    Down,
    /// Fails to connect this many more times, then comes up.
    Flaky(u32),
}

#[derive(Default)]
struct FakeState {
    reachability: HashMap<String, Reachability>,
    /// (host, needle, response), searched in order of registration.
    responses: Vec<(String, String, FakeResponse)>,
    /// (host, needle, remaining): matching commands lose their connection
    /// while `remaining` is non-zero.
    interruptions: Vec<(String, String, u32)>,
    calls: Vec<FakeCall>,
}

/// A transport which answers commands from a script.
///
/// Hosts are reachable unless marked otherwise.  A command is answered by the
/// first registered response whose host matches (or is [`ANY_HOST`]) and
/// whose needle is a substring of the command; host-specific responses are
/// consulted before [`ANY_HOST`] ones.  The connectivity probe always
/// succeeds on a reachable host.  Unscripted commands exit with status 127.
pub struct FakeTransport {
    state: Mutex<FakeState>,
}

impl FakeTransport {
    pub fn new() -> Arc<FakeTransport> {
        Arc::new(FakeTransport { state: Mutex::new(FakeState::default()) })
    }

    /// A fake on which every host passes every check in the default battery.
    pub fn healthy() -> Arc<FakeTransport> {
        let fake = FakeTransport::new();
        fake.respond(
            ANY_HOST,
            checks::puppetmaster::PUPPET_CONF,
            FakeResponse::output(format!(
                "[main]\nlogdir = /var/log/puppet\n\n[agent]\nserver = {}\n",
                CheckPolicy::default().control_plane_host
            )),
        );
        fake.respond(
            ANY_HOST,
            checks::puppet_run::RUN_SUMMARY_PATH,
            FakeResponse::output(format!(
                "---\n  time:\n    last_run: {}\n",
                Utc::now().timestamp() - 2 * 60 * 60
            )),
        );
        fake.respond(
            ANY_HOST,
            checks::home_usage::COMMAND,
            FakeResponse::output(""),
        );
        fake.respond(
            ANY_HOST,
            checks::home_mount::COMMAND,
            FakeResponse::output(
                "Filesystem 1024-blocks Used Available Capacity Mounted on\n\
                 labstore.svc.eqiad.wmnet:/project/home 1048576 2048 1046528 1% /home\n",
            ),
        );
        fake.respond(
            ANY_HOST,
            checks::database::INSTALLED_COMMAND,
            FakeResponse::exit(1),
        );
        fake
    }

    /// Perform some type coercion to access a commonly-used trait object.
    pub fn as_transport(self: Arc<Self>) -> BoxedTransport {
        self
    }

    pub fn unreachable(&self, host: &str) {
        self.state
            .lock()
            .unwrap()
            .reachability
            .insert(host.to_string(), Reachability::Down);
    }

    /// `host` refuses the next `failures` connections, then behaves normally.
    pub fn flaky(&self, host: &str, failures: u32) {
        self.state
            .lock()
            .unwrap()
            .reachability
            .insert(host.to_string(), Reachability::Flaky(failures));
    }

    /// The next `times` commands on `host` containing `needle` lose their
    /// connection; later ones get their scripted response.
    pub fn interrupt(&self, host: &str, needle: &str, times: u32) {
        self.state.lock().unwrap().interruptions.push((
            host.to_string(),
            needle.to_string(),
            times,
        ));
    }

    pub fn respond(&self, host: &str, needle: &str, response: FakeResponse) {
        self.state.lock().unwrap().responses.push((
            host.to_string(),
            needle.to_string(),
            response,
        ));
    }

    /// Every command observed so far, in order.
    pub fn calls(&self) -> Vec<FakeCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn calls_to(&self, host: &str) -> Vec<FakeCall> {
        self.calls().into_iter().filter(|c| c.host == host).collect()
    }

    /// Commands sent to `host` containing `needle`.
    pub fn count_matching(&self, host: &str, needle: &str) -> usize {
        self.calls_to(host)
            .iter()
            .filter(|c| c.command.contains(needle))
            .count()
    }

    /// Number of connectivity probes sent to `host`.
    pub fn probe_count(&self, host: &str) -> usize {
        self.calls_to(host)
            .iter()
            .filter(|c| c.command == PROBE_COMMAND)
            .count()
    }

    fn lookup(&self, host: &str, command: &str) -> Option<FakeResponse> {
        let state = self.state.lock().unwrap();
        let find = |wanted: &str| {
            state
                .responses
                .iter()
                .find(|(h, needle, _)| {
                    h == wanted && command.contains(needle.as_str())
                })
                .map(|(_, _, response)| response.clone())
        };
        find(host).or_else(|| find(ANY_HOST))
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn run_command(
        &self,
        host: &str,
        command: &str,
        options: CommandOptions,
    ) -> Result<String, TransportError> {
        let (connected, interrupted) = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(FakeCall {
                host: host.to_string(),
                command: command.to_string(),
                elevated: options.elevated,
            });
            let connected = match state.reachability.get_mut(host) {
                None | Some(Reachability::Up) => true,
                Some(Reachability::Down) => false,
                Some(Reachability::Flaky(remaining)) => {
                    if *remaining == 0 {
                        true
                    } else {
                        *remaining -= 1;
                        false
                    }
                }
            };
            let interruption = state.interruptions.iter_mut().find(
                |(h, needle, remaining)| {
                    *remaining > 0
                        && h == host
                        && command.contains(needle.as_str())
                },
            );
            let interrupted = match interruption {
                Some((_, _, remaining)) if connected => {
                    *remaining -= 1;
                    true
                }
                _ => false,
            };
            (connected, interrupted)
        };
        if !connected {
            return Err(TransportError::Connection {
                host: host.to_string(),
                message: "Connection timed out during banner exchange"
                    .to_string(),
            });
        }
        if interrupted {
            return Err(TransportError::Connection {
                host: host.to_string(),
                message: "Connection reset by peer".to_string(),
            });
        }
        if command == PROBE_COMMAND {
            return Ok(String::new());
        }

        let response =
            self.lookup(host, command).unwrap_or_else(|| FakeResponse::Exit {
                status: 127,
                stderr: format!("no scripted response for [{}]", command),
            });
        match response {
            FakeResponse::Output(stdout) => Ok(stdout),
            FakeResponse::Exit { status: 0, .. } => Ok(String::new()),
            FakeResponse::Exit { status, stderr } => {
                Err(TransportError::CommandFailed {
                    host: host.to_string(),
                    command: command.to_string(),
                    status: Some(status),
                    stdout: String::new(),
                    stderr,
                })
            }
            FakeResponse::ConnectionLost => Err(TransportError::Connection {
                host: host.to_string(),
                message: "Connection reset by peer".to_string(),
            }),
            FakeResponse::Hang(duration) => {
                tokio::time::sleep(duration).await;
                Ok(String::new())
            }
        }
    }
}
