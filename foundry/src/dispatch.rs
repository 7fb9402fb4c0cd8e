// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Command-line dispatch for the `foundry` binary.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use foundry_common::FileKv;
use foundry_orchestrator::hooks::{HookProbe, HookProvisioner, HookRunner};
use foundry_orchestrator::{
    Orchestrator, PhaseId, Profile, RunLock, RunOptions, StateStore,
};
use slog::{Drain, Logger, warn};
use slog_error_chain::InlineErrorChain;
use tokio::sync::watch;

use crate::output;

/// Exit code for requests rejected before anything ran: an unparseable
/// profile, an unknown phase, an unsatisfied prerequisite of a
/// requested subset.
const INVALID_REQUEST_EXIT_CODE: u8 = 2;

/// Exit code when an invocation executed but not every requested phase
/// came out satisfied.
const FAILURE_EXIT_CODE: u8 = 1;

/// Drive a cluster deployment through its phases.
#[derive(Debug, Parser)]
#[command(version)]
pub struct FoundryApp {
    #[clap(flatten)]
    global: GlobalOpts,

    #[clap(subcommand)]
    subcommand: FoundryCommand,
}

#[derive(Debug, Args)]
struct GlobalOpts {
    /// Directory holding deployment state, the run lock, and logs.
    #[clap(
        long,
        env = "FOUNDRY_STATE_DIR",
        default_value = "/var/lib/foundry",
        global = true
    )]
    state_dir: Utf8PathBuf,

    /// Log file; defaults to foundry.log under the state directory.
    #[clap(long, global = true)]
    log_file: Option<Utf8PathBuf>,
}

impl FoundryApp {
    pub fn setup_log(&self) -> Result<Logger> {
        let path = match &self.global.log_file {
            Some(path) => path.clone(),
            None => self.global.state_dir.join("foundry.log"),
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("cannot create log directory {parent}")
            })?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .with_context(|| format!("cannot open log file {path}"))?;

        let file_decorator = slog_term::PlainDecorator::new(file);
        let file_drain =
            slog_term::FullFormat::new(file_decorator).build().fuse();

        let stderr_decorator = slog_term::TermDecorator::new().build();
        let stderr_drain =
            slog_term::FullFormat::new(stderr_decorator).build().fuse();
        let mut builder = slog_envlogger::LogBuilder::new(stderr_drain);
        if let Ok(s) = std::env::var("RUST_LOG") {
            builder = builder.parse(&s);
        } else {
            // Info on stderr by default; the file gets everything.
            builder = builder.filter(None, slog::FilterLevel::Info);
        }
        let stderr_drain = builder.build();

        let drain = slog::Duplicate::new(file_drain, stderr_drain).fuse();
        let drain = slog_async::Async::new(drain).build().fuse();
        Ok(Logger::root(drain, slog::o!(FileKv)))
    }

    /// Executes the app.
    pub async fn exec(self, log: &Logger) -> Result<ExitCode> {
        match self.subcommand {
            FoundryCommand::Run(opts) => opts.exec(log, &self.global).await,
            FoundryCommand::Status(opts) => {
                opts.exec(log, &self.global).await
            }
            FoundryCommand::Destroy(opts) => {
                opts.exec(log, &self.global).await
            }
        }
    }
}

#[derive(Debug, Subcommand)]
enum FoundryCommand {
    /// Bring phases to their desired state.
    Run(RunOpts),
    /// Show stored records and a live classification for every phase.
    Status(StatusOpts),
    /// Tear phases down in reverse dependency order.
    Destroy(DestroyOpts),
}

#[derive(Debug, Args)]
struct ProfileOpts {
    /// Deployment profile (TOML).
    #[clap(long, value_name = "PATH")]
    profile: Utf8PathBuf,
}

#[derive(Debug, Args)]
struct RunOpts {
    #[clap(flatten)]
    profile: ProfileOpts,

    /// Phases to run; all of them when omitted.
    phases: Vec<PhaseId>,

    /// Rebuild the named phases even where probes report satisfied.
    #[clap(long, requires = "phases")]
    force: bool,

    /// Run the named phases in isolation, without validating or gating
    /// on their prerequisites.
    #[clap(long)]
    skip_prereq_check: bool,

    /// Print what would be done without executing anything.
    #[clap(long)]
    dry_run: bool,
}

impl RunOpts {
    fn options(&self) -> RunOptions {
        RunOptions {
            phases: self.phases.clone(),
            force: self.force,
            skip_prereq_check: self.skip_prereq_check,
        }
    }

    async fn exec(self, log: &Logger, global: &GlobalOpts) -> Result<ExitCode> {
        let profile = match Profile::from_file(&self.profile.profile) {
            Ok(profile) => profile,
            Err(err) => return invalid_request(&err),
        };
        let orchestrator = build_orchestrator(log, &profile);
        let options = self.options();

        if self.dry_run {
            // Preview only: no lock, no mutation.
            let store = StateStore::load(log, &global.state_dir).await;
            let plans =
                match orchestrator.plan(&profile, &store, &options).await {
                    Ok(plans) => plans,
                    Err(err) if err.is_invalid_request() => {
                        return invalid_request(&err);
                    }
                    Err(err) => return Err(err).context("dry run failed"),
                };
            output::print_plans(&plans);
            return Ok(ExitCode::SUCCESS);
        }

        let _lock = RunLock::acquire(log, &global.state_dir)
            .context("cannot start the run")?;
        let mut store = StateStore::load(log, &global.state_dir).await;
        let cancel = cancel_on_interrupt(log);
        let report = match orchestrator
            .run(&profile, &mut store, &options, cancel)
            .await
        {
            Ok(report) => report,
            Err(err) if err.is_invalid_request() => {
                return invalid_request(&err);
            }
            Err(err) => return Err(err).context("run failed"),
        };
        if let Err(err) = report.persist(&global.state_dir).await {
            warn!(
                log, "cannot persist last-run report";
                "err" => InlineErrorChain::new(&err),
            );
        }
        output::print_report(&report);
        Ok(exit_for(&report))
    }
}

#[derive(Debug, Args)]
struct StatusOpts {
    #[clap(flatten)]
    profile: ProfileOpts,
}

impl StatusOpts {
    async fn exec(self, log: &Logger, global: &GlobalOpts) -> Result<ExitCode> {
        let profile = match Profile::from_file(&self.profile.profile) {
            Ok(profile) => profile,
            Err(err) => return invalid_request(&err),
        };
        let orchestrator = build_orchestrator(log, &profile);
        let store = StateStore::load(log, &global.state_dir).await;
        let status = orchestrator
            .status(&profile, &store)
            .await
            .context("status failed")?;
        output::print_status(&status);
        Ok(ExitCode::SUCCESS)
    }
}

#[derive(Debug, Args)]
struct DestroyOpts {
    #[clap(flatten)]
    profile: ProfileOpts,

    /// Phases to destroy, dependents included; all of them when omitted.
    phases: Vec<PhaseId>,
}

impl DestroyOpts {
    async fn exec(self, log: &Logger, global: &GlobalOpts) -> Result<ExitCode> {
        let profile = match Profile::from_file(&self.profile.profile) {
            Ok(profile) => profile,
            Err(err) => return invalid_request(&err),
        };
        let orchestrator = build_orchestrator(log, &profile);
        let _lock = RunLock::acquire(log, &global.state_dir)
            .context("cannot start the teardown")?;
        let mut store = StateStore::load(log, &global.state_dir).await;
        let cancel = cancel_on_interrupt(log);
        let report = orchestrator
            .destroy(&profile, &mut store, &self.phases, cancel)
            .await
            .context("destroy failed")?;
        if let Err(err) = report.persist(&global.state_dir).await {
            warn!(
                log, "cannot persist last-run report";
                "err" => InlineErrorChain::new(&err),
            );
        }
        output::print_report(&report);
        Ok(exit_for(&report))
    }
}

fn build_orchestrator(log: &Logger, profile: &Profile) -> Orchestrator {
    let dir = profile.provisioner.dir.clone();
    let provisioner =
        Arc::new(HookProvisioner::new(HookRunner::new(dir.clone())));
    let probe = Arc::new(HookProbe::new(HookRunner::new(dir)));
    Orchestrator::new(log, provisioner, probe)
}

fn exit_for(report: &foundry_orchestrator::RunReport) -> ExitCode {
    if report.all_succeeded() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(FAILURE_EXIT_CODE)
    }
}

fn invalid_request(err: &dyn std::error::Error) -> Result<ExitCode> {
    eprintln!("foundry: {}", InlineErrorChain::new(err));
    Ok(ExitCode::from(INVALID_REQUEST_EXIT_CODE))
}

/// The first interrupt asks the orchestrator to wind down, leaving
/// in-flight actions their grace period; a second interrupt exits on
/// the spot (128 + SIGINT).
fn cancel_on_interrupt(log: &Logger) -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    let log = log.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!(log, "interrupt received; draining in-flight actions");
        tx.send_replace(true);
        if tokio::signal::ctrl_c().await.is_ok() {
            std::process::exit(130);
        }
    });
    rx
}
