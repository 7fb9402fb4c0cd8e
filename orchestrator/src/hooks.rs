// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The production provisioner: hook executables in a directory.
//!
//! A profile points at a directory of executables, one per action name
//! (`foundation-create`, `infrastructure-probe`, ...).  A hook receives
//! the action's JSON parameters on stdin and `FOUNDRY_PHASE`,
//! `FOUNDRY_RESOURCE`, `FOUNDRY_ACTION` in its environment.  Exit 0 is
//! success; exit 75 (EX_TEMPFAIL) is a failure worth retrying; any other
//! exit is fatal.  A probe hook prints its observation on the first line
//! of stdout; a create/repair hook may print `id <resource-id>` there to
//! have the external id recorded.
//!
//! Hooks are spawned with `kill_on_drop`, so a caller that abandons an
//! invocation (timeout, cancellation) takes the child process down with
//! it rather than leaving it running unsupervised.

use std::io::ErrorKind;
use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use camino::Utf8PathBuf;
use slog::{Logger, debug};
use slog_error_chain::InlineErrorChain;
use tokio::io::AsyncWriteExt;

use crate::probe::{Probe, ProbeError, ProbeOutcome};
use crate::provision::{Action, ActionResult, Provisioner, ProvisionerError};

/// EX_TEMPFAIL, from sysexits.h.
const EXIT_TRANSIENT: i32 = 75;

/// How much combined hook output to keep for records and reports.
const OUTPUT_TAIL_BYTES: usize = 4096;

/// Spawns hook executables and captures their output.
#[derive(Clone, Debug)]
pub struct HookRunner {
    dir: Utf8PathBuf,
}

struct HookOutput {
    status: std::process::ExitStatus,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl HookRunner {
    pub fn new(dir: Utf8PathBuf) -> HookRunner {
        HookRunner { dir }
    }

    fn hook_path(&self, action: &Action) -> Utf8PathBuf {
        self.dir.join(action.name())
    }

    async fn run(
        &self,
        log: &Logger,
        action: &Action,
    ) -> Result<HookOutput, ProvisionerError> {
        let path = self.hook_path(action);
        if !path.exists() {
            return Err(ProvisionerError::MissingHook { path });
        }
        let params = serde_json::to_vec(&action.parameters)
            .expect("JSON values always serialize");

        let mut command = tokio::process::Command::new(&path);
        command
            .env("FOUNDRY_PHASE", action.phase.as_str())
            .env("FOUNDRY_RESOURCE", &action.resource)
            .env("FOUNDRY_ACTION", action.name())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(log, "running hook: {}", path; "action" => %action);
        let start = Instant::now();
        let mut child = command.spawn().map_err(|err| {
            ProvisionerError::Spawn { path: path.clone(), err }
        })?;

        // Feed stdin while draining stdout/stderr: a hook that fills the
        // output pipe before reading its parameters must not deadlock
        // against us filling the stdin pipe with a large parameter set.
        let mut stdin = child.stdin.take().expect("child stdin is piped");
        let feed = async {
            let written = stdin.write_all(&params).await;
            // Closing stdin is the hook's EOF.
            drop(stdin);
            match written {
                // A hook is free to exit without reading its parameters.
                Err(err) if err.kind() == ErrorKind::BrokenPipe => Ok(()),
                other => other,
            }
        };
        let (fed, output) = tokio::join!(feed, child.wait_with_output());
        fed.map_err(|err| ProvisionerError::Io { path: path.clone(), err })?;
        let output = output.map_err(|err| {
            ProvisionerError::Io { path: path.clone(), err }
        })?;
        debug!(
            log,
            "hook exited with {} ({:?})",
            output.status,
            Instant::now().saturating_duration_since(start);
            "action" => %action,
        );
        Ok(HookOutput {
            status: output.status,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

/// [`HookRunner`] as a [`Provisioner`].
#[derive(Clone, Debug)]
pub struct HookProvisioner {
    runner: HookRunner,
}

impl HookProvisioner {
    pub fn new(runner: HookRunner) -> HookProvisioner {
        HookProvisioner { runner }
    }
}

#[async_trait]
impl Provisioner for HookProvisioner {
    async fn invoke(
        &self,
        log: &Logger,
        action: &Action,
    ) -> Result<ActionResult, ProvisionerError> {
        let output = self.runner.run(log, action).await?;
        let detail = output_tail(&output.stdout, &output.stderr);
        Ok(match output.status.code() {
            Some(0) => ActionResult {
                ok: true,
                detail,
                transient: false,
                resource_id: parse_resource_id(&output.stdout),
            },
            Some(EXIT_TRANSIENT) => ActionResult {
                ok: false,
                detail,
                transient: true,
                resource_id: None,
            },
            // Any other exit code, and death by signal.
            _ => ActionResult {
                ok: false,
                detail,
                transient: false,
                resource_id: None,
            },
        })
    }
}

/// [`HookRunner`] as a [`Probe`].
#[derive(Clone, Debug)]
pub struct HookProbe {
    runner: HookRunner,
}

impl HookProbe {
    pub fn new(runner: HookRunner) -> HookProbe {
        HookProbe { runner }
    }
}

#[async_trait]
impl Probe for HookProbe {
    async fn probe(
        &self,
        log: &Logger,
        action: &Action,
    ) -> Result<ProbeOutcome, ProbeError> {
        let probe_error = |reason: String| ProbeError {
            action: action.to_string(),
            reason,
        };
        let output =
            self.runner.run(log, action).await.map_err(|err| {
                probe_error(InlineErrorChain::new(&err).to_string())
            })?;
        if !output.status.success() {
            return Err(probe_error(format!(
                "hook exited with {}: {}",
                output.status,
                output_tail(&output.stdout, &output.stderr),
            )));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let line = stdout.lines().next().unwrap_or("");
        ProbeOutcome::parse_report(line).ok_or_else(|| {
            probe_error(format!("unintelligible probe report {line:?}"))
        })
    }
}

/// Extracts the external resource id from a successful hook's first
/// stdout line (`id <resource-id>`).
fn parse_resource_id(stdout: &[u8]) -> Option<String> {
    let stdout = String::from_utf8_lossy(stdout);
    let id = stdout.lines().next()?.strip_prefix("id ")?.trim();
    if id.is_empty() { None } else { Some(id.to_string()) }
}

/// Combines captured stdout and stderr, keeping at most the last
/// [`OUTPUT_TAIL_BYTES`] bytes.  Failures usually explain themselves at
/// the end of their output.
fn output_tail(stdout: &[u8], stderr: &[u8]) -> String {
    let mut combined = String::new();
    for (stream, bytes) in [("stdout", stdout), ("stderr", stderr)] {
        if !bytes.is_empty() {
            if !combined.is_empty() {
                combined.push('\n');
            }
            combined.push_str(stream);
            combined.push_str(": ");
            combined.push_str(String::from_utf8_lossy(bytes).trim_end());
        }
    }
    if combined.len() > OUTPUT_TAIL_BYTES {
        let mut cut = combined.len() - OUTPUT_TAIL_BYTES;
        while !combined.is_char_boundary(cut) {
            cut += 1;
        }
        let tail = combined.split_off(cut);
        return format!("({cut} bytes trimmed) {tail}");
    }
    combined
}
