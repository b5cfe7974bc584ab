// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Audit the Labs instances you administer for migration readiness.

use anyhow::Context;
use camino::Utf8PathBuf;
use clap::Parser;
use display_error_chain::DisplayErrorChain;
use migration_assistant::checks::system_clock;
use migration_assistant::cmd::{fatal, CmdError};
use migration_assistant::directory::{
    InstanceDirectory, StaticDirectory, WikitechDirectory,
};
use migration_assistant::fakes::FakeTransport;
use migration_assistant::transport::{BoxedTransport, SshTransport};
use migration_assistant::{
    audit_fleet, AuditError, Config, ExclusionPolicy, RunContext,
};
use slog::{info, o, warn, Drain, Level, Logger};
use slog_term::{FullFormat, TermDecorator};

#[derive(Debug, Parser)]
#[clap(
    name = "migration-assistant",
    about = "Check whether your Labs instances are ready to move datacenters"
)]
struct Args {
    /// Wikitech user name; every instance in this user's projects is audited
    #[clap(short, long, env = "WIKI_USERNAME")]
    user: Option<String>,

    /// Path to a TOML configuration file
    #[clap(short, long, env = "MIGRATION_ASSISTANT_CONFIG")]
    config: Option<Utf8PathBuf>,

    /// Audit only the built-in test instance, skipping the directory
    #[clap(long)]
    debug: bool,

    /// Answer every command from canned healthy responses instead of ssh
    #[clap(long)]
    simulate: bool,

    /// Print the summary as JSON
    #[clap(long)]
    json: bool,

    /// Minimum level of log messages to print
    #[clap(long, value_parser = parse_log_level)]
    log_level: Option<Level>,

    /// ssh jump host (pass an empty string to connect directly)
    #[clap(long)]
    gateway: Option<String>,

    /// Number of instances audited at once
    #[clap(long)]
    parallelism: Option<usize>,
}

fn parse_log_level(s: &str) -> Result<Level, String> {
    s.parse().map_err(|()| format!("unknown log level {:?}", s))
}

fn main() {
    sigpipe::reset();
    match do_run() {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(cmd_error) => fatal(cmd_error),
    }
}

/// Returns whether every audited instance is ready.
fn do_run() -> Result<bool, CmdError> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .map_err(|e| CmdError::Failure(anyhow::Error::new(e)))?,
        None => Config::default(),
    };
    if let Some(gateway) = &args.gateway {
        config.transport.gateway = Some(gateway.clone());
    }
    if let Some(parallelism) = args.parallelism {
        if parallelism == 0 {
            return Err(CmdError::Usage(
                "--parallelism must be at least 1".to_string(),
            ));
        }
        config.transport.parallelism = parallelism;
    }
    let identity = match (&args.user, args.debug) {
        (Some(user), _) => user.clone(),
        (None, true) => String::new(),
        (None, false) => {
            return Err(CmdError::Usage(
                "a wikitech user name is required (--user or \
                 WIKI_USERNAME)"
                    .to_string(),
            ));
        }
    };

    let level = args
        .log_level
        .unwrap_or(if args.debug { Level::Debug } else { Level::Info });
    let decorator = TermDecorator::new().stderr().build();
    let drain = FullFormat::new(decorator).build().fuse();
    let drain = slog::LevelFilter::new(drain, level).fuse();
    let (drain, _guard) = slog_async::Async::new(drain).build_with_guard();
    let log = Logger::root(drain.fuse(), o!());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")
        .map_err(CmdError::Failure)?;
    let result = runtime.block_on(run(&log, &args, &config, &identity));
    // Let in-flight ssh children be killed before the logger goes away.
    drop(runtime);
    result
}

async fn run(
    log: &Logger,
    args: &Args,
    config: &Config,
    identity: &str,
) -> Result<bool, CmdError> {
    let transport: BoxedTransport = if args.simulate {
        info!(log, "simulating: no remote commands will be run");
        FakeTransport::healthy().as_transport()
    } else {
        SshTransport::new(&config.transport, &config.fleet.domain_suffix)
            .as_transport()
    };
    let ctx = RunContext::from_config(log, config, transport, system_clock());

    let cancel = ctx.cancellation_token();
    let interrupt_log = log.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!(
                interrupt_log,
                "interrupted; waiting for commands in flight to finish"
            );
            cancel.cancel();
        }
    });

    let directory: Box<dyn InstanceDirectory> = if args.debug {
        Box::new(StaticDirectory::debug_fleet())
    } else {
        Box::new(
            WikitechDirectory::new(log, &config.directory)
                .context("failed to set up instance directory")
                .map_err(CmdError::Failure)?,
        )
    };
    let exclusions = ExclusionPolicy::from_config(&config.fleet);

    let summary =
        match audit_fleet(&ctx, &*directory, identity, &exclusions).await {
            Ok(summary) => summary,
            Err(AuditError::EmptyFleet(error)) => {
                return Err(CmdError::Failure(anyhow::anyhow!(
                    "not able to parse the instance directory or you are \
                     not an administrator of any instance ({})",
                    error
                )));
            }
            Err(error) => {
                return Err(CmdError::Failure(anyhow::anyhow!(
                    "{}",
                    DisplayErrorChain::new(&error)
                )));
            }
        };

    if args.json {
        let json = serde_json::to_string_pretty(&summary)
            .context("failed to serialize summary")
            .map_err(CmdError::Failure)?;
        println!("{}", json);
    } else {
        print!("{}", summary);
    }
    Ok(summary.all_ready())
}
