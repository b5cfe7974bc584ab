// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Running commands on remote instances.
//!
//! - In production, this is an [`SshTransport`], which shells out to the
//!   system `ssh` client.
//! - Under test, a [`crate::fakes::FakeTransport`] answers from a script.
//!
//! Either way, callers go through [`Remote`], which applies the command
//! timeout and logs every command.  Check commands additionally go through
//! [`Retry`], so a dropped connection is retried like the connectivity
//! probe is.

use crate::config::TransportConfig;
use crate::gate::retry_policy;
use async_trait::async_trait;
use backoff::future::retry_notify;
use backoff::Error as BackoffError;
use camino::Utf8PathBuf;
use display_error_chain::DisplayErrorChain;
use slog::{debug, warn, Logger};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Exit status `ssh` uses for its own failures (as opposed to the remote
/// command's).
const SSH_ERROR_STATUS: i32 = 255;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CommandOptions {
    /// Run with elevated privileges (via `sudo`)
    pub elevated: bool,
}

impl CommandOptions {
    pub const PLAIN: CommandOptions = CommandOptions { elevated: false };
    pub const ELEVATED: CommandOptions = CommandOptions { elevated: true };
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect to {host}: {message}")]
    Connection { host: String, message: String },

    #[error("command on {host} timed out after {timeout:?}")]
    Timeout { host: String, timeout: Duration },

    #[error(
        "command [{command}] on {host} failed with status {}: {stderr}",
        .status.map(|s| s.to_string()).unwrap_or_else(|| "none".to_string())
    )]
    CommandFailed {
        host: String,
        command: String,
        status: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error("failed to start [{program}]")]
    Spawn {
        program: String,
        #[source]
        err: std::io::Error,
    },
}

impl TransportError {
    /// Returns true if this error means the host could not be reached at all,
    /// rather than the command failing once it got there.
    pub fn is_connection_failure(&self) -> bool {
        !matches!(self, TransportError::CommandFailed { .. })
    }

    /// Returns true if trying again might help.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::Connection { .. } | TransportError::Timeout { .. }
        )
    }
}

/// Describes something that can run a command on an instance and hand back
/// its standard output.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Runs `command` on the instance identified by `host` (an instance key,
    /// `name.datacenter`).
    ///
    /// A command that runs but exits non-zero is reported as
    /// [`TransportError::CommandFailed`].
    async fn run_command(
        &self,
        host: &str,
        command: &str,
        options: CommandOptions,
    ) -> Result<String, TransportError>;
}

/// Describes the commonly-used "safe-to-reference" type describing the
/// Transport as a trait object.
pub type BoxedTransport = Arc<dyn Transport>;

/// Wraps a [`Transport`], bounding every command by a timeout and logging it.
pub struct Remote {
    log: Logger,
    inner: BoxedTransport,
    timeout: Duration,
    counter: AtomicU64,
}

impl Remote {
    pub fn new(log: &Logger, inner: BoxedTransport, timeout: Duration) -> Self {
        Remote {
            log: log.new(slog::o!("component" => "Remote")),
            inner,
            timeout,
            counter: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl Transport for Remote {
    async fn run_command(
        &self,
        host: &str,
        command: &str,
        options: CommandOptions,
    ) -> Result<String, TransportError> {
        let id = self.counter.fetch_add(1, Ordering::SeqCst);
        debug!(
            self.log,
            "running remote command";
            "id" => id,
            "host" => host,
            "command" => command,
            "elevated" => options.elevated,
        );
        let start = Instant::now();
        let result = match tokio::time::timeout(
            self.timeout,
            self.inner.run_command(host, command, options),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout {
                host: host.to_string(),
                timeout: self.timeout,
            }),
        };
        debug!(
            self.log,
            "finished remote command";
            "id" => id,
            "host" => host,
            "result" => if result.is_ok() { "OK" } else { "ERROR" },
            "elapsed" => ?start.elapsed(),
        );
        result
    }
}

/// Wraps a [`Transport`], retrying commands that fail for transient,
/// connection-level reasons.
///
/// A command is sent at most `attempts` times.  Commands that ran and exited
/// non-zero are never retried.
pub struct Retry {
    log: Logger,
    inner: BoxedTransport,
    attempts: u32,
    retry_interval: Duration,
}

impl Retry {
    pub fn new(
        log: &Logger,
        inner: BoxedTransport,
        attempts: u32,
        retry_interval: Duration,
    ) -> Self {
        Retry {
            log: log.new(slog::o!("component" => "Retry")),
            inner,
            attempts: attempts.max(1),
            retry_interval,
        }
    }
}

#[async_trait]
impl Transport for Retry {
    async fn run_command(
        &self,
        host: &str,
        command: &str,
        options: CommandOptions,
    ) -> Result<String, TransportError> {
        let max_attempts = self.attempts;
        let mut attempt = 0;
        let run = || {
            attempt += 1;
            let this_attempt = attempt;
            async move {
                match self.inner.run_command(host, command, options).await {
                    Ok(stdout) => Ok(stdout),
                    Err(e)
                        if e.is_transient() && this_attempt < max_attempts =>
                    {
                        Err(BackoffError::transient(e))
                    }
                    Err(e) => Err(BackoffError::permanent(e)),
                }
            }
        };
        let log_failure = |error: TransportError, delay: Duration| {
            warn!(
                self.log,
                "remote command failed, will retry";
                "host" => host,
                "command" => command,
                "delay" => ?delay,
                "error" => %DisplayErrorChain::new(&error),
            );
        };
        retry_notify(retry_policy(self.retry_interval), run, log_failure).await
    }
}

/// Runs commands through the system `ssh` client.
pub struct SshTransport {
    program: String,
    gateway: Option<String>,
    user: Option<String>,
    identity_file: Option<Utf8PathBuf>,
    forward_agent: bool,
    connect_timeout: Duration,
    domain_suffix: String,
}

impl SshTransport {
    pub fn new(config: &TransportConfig, domain_suffix: &str) -> Self {
        SshTransport {
            program: config.ssh_program.clone(),
            gateway: config.gateway.clone().filter(|g| !g.is_empty()),
            user: config.user.clone().filter(|u| !u.is_empty()),
            identity_file: config.identity_file.as_ref().map(expand_home),
            forward_agent: config.forward_agent,
            connect_timeout: config.connect_timeout,
            domain_suffix: domain_suffix.to_string(),
        }
    }

    pub fn as_transport(self) -> BoxedTransport {
        Arc::new(self)
    }

    fn hostname(&self, host: &str) -> String {
        if self.domain_suffix.is_empty() {
            host.to_string()
        } else {
            format!("{}.{}", host, self.domain_suffix)
        }
    }

    /// Arguments passed to `ssh` to run `command` on `host`.
    fn args(
        &self,
        host: &str,
        command: &str,
        options: CommandOptions,
    ) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            "LogLevel=ERROR".to_string(),
        ];
        if self.forward_agent {
            args.push("-A".to_string());
        }
        if let Some(gateway) = &self.gateway {
            args.push("-J".to_string());
            args.push(gateway.clone());
        }
        if let Some(identity_file) = &self.identity_file {
            args.push("-i".to_string());
            args.push(identity_file.to_string());
        }
        if let Some(user) = &self.user {
            args.push("-l".to_string());
            args.push(user.clone());
        }
        // Nothing after "--" is parsed as an option, the destination
        // included.
        args.push("--".to_string());
        args.push(self.hostname(host));
        args.push(remote_command(command, options));
        args
    }
}

/// Wraps `command` for privileged execution when asked to.
fn remote_command(command: &str, options: CommandOptions) -> String {
    if options.elevated {
        format!("sudo -n sh -c {}", shell_words::quote(command))
    } else {
        command.to_string()
    }
}

fn expand_home(path: &Utf8PathBuf) -> Utf8PathBuf {
    match (path.strip_prefix("~"), std::env::var("HOME")) {
        (Ok(rest), Ok(home)) => Utf8PathBuf::from(home).join(rest),
        _ => path.clone(),
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn run_command(
        &self,
        host: &str,
        command: &str,
        options: CommandOptions,
    ) -> Result<String, TransportError> {
        let output = tokio::process::Command::new(&self.program)
            .args(self.args(host, command, options))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|err| TransportError::Spawn {
                program: self.program.clone(),
                err,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        match output.status.code() {
            Some(0) => Ok(stdout),
            Some(SSH_ERROR_STATUS) => Err(TransportError::Connection {
                host: host.to_string(),
                message: stderr,
            }),
            status => Err(TransportError::CommandFailed {
                host: host.to_string(),
                command: command.to_string(),
                status,
                stdout,
                stderr,
            }),
        }
    }
}
