// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Durable record of what has been deployed.
//!
//! The state store is the orchestrator's only memory between invocations.
//! It is deliberately small: one record per (phase, resource key) holding
//! the external resource id, the params digest the resource was built
//! against, and the last observed status.  It is bookkeeping, not truth;
//! the reconciler always confirms against a live probe before trusting a
//! `satisfied` record.

use std::collections::BTreeMap;
use std::io::Write;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use foundry_common::ledger;
use foundry_common::ledger::{Generation, Ledger, Ledgerable};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use slog::{Logger, debug, info, o};
use thiserror::Error;

use crate::config::ParamsDigest;
use crate::phases::PhaseId;

pub const STATE_FILENAME: &str = "deployment.json";
pub const LOCK_FILENAME: &str = "foundry.lock";

/// Last observed status of one resource.
#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Satisfied,
    Missing,
    Drifted,
    Failed,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Satisfied => "satisfied",
            RecordStatus::Missing => "missing",
            RecordStatus::Drifted => "drifted",
            RecordStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One persisted resource record.
///
/// Fields added in later versions must take `#[serde(default)]` so state
/// written by older binaries keeps loading; unknown fields in newer
/// documents are ignored on load for the same reason.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ResourceRecord {
    /// Identifier assigned by the external system (a VM id, a template
    /// id), reported by the create/repair hook.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    /// Digest of the profile parameters this resource was last brought in
    /// line with.
    pub digest: ParamsDigest,
    pub status: RecordStatus,
    pub last_updated: DateTime<Utc>,
    /// Wall-clock milliseconds the last action took; zero for records
    /// that were adopted without running an action.
    #[serde(default)]
    pub last_duration_ms: u64,
    /// Failure detail from the most recent action, cleared on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// The persisted document: everything known about one deployment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DeploymentState {
    pub generation: Generation,
    /// Name of the profile that last ran against this state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_name: Option<String>,
    #[serde(default)]
    pub records: BTreeMap<PhaseId, BTreeMap<String, ResourceRecord>>,
}

impl Default for DeploymentState {
    fn default() -> Self {
        DeploymentState {
            generation: Generation::new(),
            profile_name: None,
            records: BTreeMap::new(),
        }
    }
}

impl Ledgerable for DeploymentState {
    fn is_newer_than(&self, other: &Self) -> bool {
        self.generation > other.generation
    }
    fn generation_bump(&mut self) {
        self.generation = self.generation.next();
    }
}

/// Owns the deployment state for the duration of one invocation.
///
/// Mutations mark the store dirty; [`StateStore::save`] commits only when
/// dirty, so an invocation that changes nothing leaves the on-disk
/// document untouched, byte for byte.
pub struct StateStore {
    log: Logger,
    ledger: Ledger<DeploymentState>,
    dirty: bool,
}

impl StateStore {
    /// Loads persisted state from `state_dir`, starting empty if no usable
    /// document exists.  Never fails: a first run has nothing to load.
    pub async fn load(log: &Logger, state_dir: &Utf8Path) -> StateStore {
        let log = log.new(o!("component" => "StateStore"));
        let path = state_dir.join(STATE_FILENAME);
        let ledger = match Ledger::new(&log, vec![path.clone()]).await {
            Some(ledger) => ledger,
            None => {
                info!(
                    log,
                    "no deployment state on disk; starting empty";
                    "path" => %path,
                );
                Ledger::new_with(&log, vec![path], DeploymentState::default())
            }
        };
        StateStore { log, ledger, dirty: false }
    }

    pub fn state(&self) -> &DeploymentState {
        self.ledger.data()
    }

    pub fn record(
        &self,
        phase: PhaseId,
        key: &str,
    ) -> Option<&ResourceRecord> {
        self.state().records.get(&phase)?.get(key)
    }

    /// All records for `phase`, in key order.
    pub fn phase_records(
        &self,
        phase: PhaseId,
    ) -> impl Iterator<Item = (&String, &ResourceRecord)> {
        self.state().records.get(&phase).into_iter().flatten()
    }

    /// Inserts or replaces the record for `(phase, key)`.  Writing a value
    /// identical to the stored one is not a change and does not dirty the
    /// store.
    pub fn upsert(&mut self, phase: PhaseId, key: &str, record: ResourceRecord) {
        let records =
            self.ledger.data_mut().records.entry(phase).or_default();
        if records.get(key) == Some(&record) {
            return;
        }
        records.insert(key.to_string(), record);
        self.dirty = true;
    }

    /// Removes the record for `(phase, key)`, dropping the phase's map
    /// entirely once its last record is gone.
    pub fn remove(
        &mut self,
        phase: PhaseId,
        key: &str,
    ) -> Option<ResourceRecord> {
        let state = self.ledger.data_mut();
        let records = state.records.get_mut(&phase)?;
        let removed = records.remove(key)?;
        if records.is_empty() {
            state.records.remove(&phase);
        }
        self.dirty = true;
        Some(removed)
    }

    pub fn set_profile_name(&mut self, name: &str) {
        let state = self.ledger.data_mut();
        if state.profile_name.as_deref() != Some(name) {
            state.profile_name = Some(name.to_string());
            self.dirty = true;
        }
    }

    #[cfg(test)]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Commits the state if anything changed since load.
    pub async fn save(&mut self) -> Result<(), ledger::Error> {
        if !self.dirty {
            debug!(self.log, "deployment state unchanged; not committing");
            return Ok(());
        }
        self.ledger.commit().await?;
        self.dirty = false;
        info!(
            self.log,
            "deployment state committed";
            "generation" => %self.state().generation,
        );
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error(
        "another invocation is already running against this state \
         directory (lock file {path} exists)"
    )]
    AlreadyRunning { path: Utf8PathBuf },
    #[error("cannot create lock file {path}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
}

/// Exclusive lock over one state directory, held for the life of a
/// mutating invocation and released on drop.
///
/// The lock is a `create_new` file containing the holder's pid and start
/// time, which is what an operator wants to see when a run refuses to
/// start.  There is no cross-host coordination; the state directory is
/// local by design.
#[derive(Debug)]
pub struct RunLock {
    path: Utf8PathBuf,
}

impl RunLock {
    pub fn acquire(
        log: &Logger,
        state_dir: &Utf8Path,
    ) -> Result<RunLock, LockError> {
        std::fs::create_dir_all(state_dir).map_err(|err| LockError::Io {
            path: state_dir.to_owned(),
            err,
        })?;
        let path = state_dir.join(LOCK_FILENAME);
        let io_err = |err| LockError::Io { path: path.clone(), err };
        match std::fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)
        {
            Ok(mut file) => {
                writeln!(
                    file,
                    "{} {}",
                    std::process::id(),
                    Utc::now().to_rfc3339()
                )
                .map_err(io_err)?;
                info!(log, "acquired run lock"; "path" => %path);
                Ok(RunLock { path })
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(LockError::AlreadyRunning { path })
            }
            Err(err) => Err(io_err(err)),
        }
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        // Best effort; a stale lock after a crash is removed by hand.
        let _ = std::fs::remove_file(&self.path);
    }
}
