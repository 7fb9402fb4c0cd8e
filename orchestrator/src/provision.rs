// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The uniform contract between the orchestrator and external
//! provisioners.
//!
//! Every mutation of the outside world, whatever tool ends up performing
//! it, goes through one shape: an [`Action`] in, an [`ActionResult`] out.
//! The orchestrator neither knows nor cares whether an action talks to a
//! virtualization API, an image builder, or a configuration-management
//! tool; it only cares whether the action succeeded and, if not, whether
//! retrying could help.

use std::fmt;

use async_trait::async_trait;
use camino::Utf8PathBuf;
use serde_json::Value;
use slog::Logger;
use thiserror::Error;

use crate::phases::PhaseId;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ActionKind {
    Create,
    Repair,
    Destroy,
    Probe,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Create => "create",
            ActionKind::Repair => "repair",
            ActionKind::Destroy => "destroy",
            ActionKind::Probe => "probe",
        }
    }
}

/// One invocation against an external provisioner.
///
/// `parameters` is the profile slice relevant to the resource, forwarded
/// verbatim; anything sensitive inside it passes through opaquely.
#[derive(Clone, Debug)]
pub struct Action {
    pub phase: PhaseId,
    pub kind: ActionKind,
    /// Resource key within the phase (`control-01`, `golden-image`, ...).
    pub resource: String,
    pub parameters: Value,
}

impl Action {
    pub fn new<R: Into<String>>(
        phase: PhaseId,
        kind: ActionKind,
        resource: R,
        parameters: Value,
    ) -> Action {
        Action { phase, kind, resource: resource.into(), parameters }
    }

    /// The action's name, which is also the hook executable implementing
    /// it: `foundation-create`, `infrastructure-probe`, ...
    pub fn name(&self) -> String {
        format!("{}-{}", self.phase, self.kind.as_str())
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.resource)
    }
}

/// What a provisioner reported for one completed invocation.
#[derive(Clone, Debug)]
pub struct ActionResult {
    pub ok: bool,
    /// Tail of the provisioner's output, for the run report and logs.
    pub detail: String,
    /// On failure, whether retrying might succeed.
    pub transient: bool,
    /// External resource id announced by a successful create/repair.
    pub resource_id: Option<String>,
}

#[derive(Debug, Error)]
pub enum ProvisionerError {
    #[error("no hook for this action: {path} does not exist")]
    MissingHook { path: Utf8PathBuf },
    #[error("failed to launch hook {path}")]
    Spawn {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("i/o error talking to hook {path}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
}

impl ProvisionerError {
    /// Whether this error could plausibly clear up on retry.  A missing
    /// hook will stay missing; spawn and pipe errors can be momentary.
    pub fn is_transient(&self) -> bool {
        match self {
            ProvisionerError::MissingHook { .. } => false,
            ProvisionerError::Spawn { .. } | ProvisionerError::Io { .. } => {
                true
            }
        }
    }
}

/// Runs actions against the outside world.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Runs `action` to completion.  An `Err` means the provisioner
    /// itself could not be exercised; a completed action that failed is
    /// an `Ok` result with `ok == false`.
    async fn invoke(
        &self,
        log: &Logger,
        action: &Action,
    ) -> Result<ActionResult, ProvisionerError>;
}
