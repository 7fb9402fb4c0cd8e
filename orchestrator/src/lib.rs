// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Phase-oriented bring-up and teardown of self-hosted workload
//! clusters.
//!
//! A deployment is modeled as five phases with explicit dependencies,
//! each owning a set of externally provisioned resources.  The actual
//! provisioning lives in per-phase hook executables; this crate decides
//! what needs to run, runs it with timeouts and retries, verifies the
//! result against the live world, and records what it learned so the
//! next invocation can pick up from there.

pub mod config;
pub mod driver;
pub mod executor;
pub mod graph;
pub mod hooks;
pub mod phases;
pub mod probe;
pub mod provision;
pub mod reconcile;
pub mod report;
pub mod state;

#[cfg(test)]
mod fake;

pub use config::{Profile, ProfileError};
pub use driver::{Orchestrator, OrchestratorError, RunOptions, RunStep};
pub use phases::PhaseId;
pub use report::RunReport;
pub use state::{LockError, RunLock, StateStore};
