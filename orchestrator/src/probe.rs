// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Read-only observation of external resources.
//!
//! A probe answers one question about one resource: does it exist, and if
//! so, does it still match what the profile asked for?  Probes are safe to
//! repeat and never mutate anything; the reconciler leans on that to call
//! them as often as it likes, including immediately after an action to
//! confirm the action really worked.

use async_trait::async_trait;
use slog::Logger;
use thiserror::Error;

use crate::provision::Action;

/// What a probe observed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Present and matching the desired configuration.
    Satisfied,
    /// Not present at all.
    Missing,
    /// Present but diverged from the desired configuration.
    Drifted {
        /// Human-oriented description of the divergence.
        detail: String,
    },
}

impl ProbeOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ProbeOutcome::Satisfied => "satisfied",
            ProbeOutcome::Missing => "missing",
            ProbeOutcome::Drifted { .. } => "drifted",
        }
    }

    /// Parses a probe hook's report line: `satisfied`, `missing`, or
    /// `drifted` optionally followed by detail text.
    pub fn parse_report(line: &str) -> Option<ProbeOutcome> {
        let line = line.trim();
        match line {
            "satisfied" => Some(ProbeOutcome::Satisfied),
            "missing" => Some(ProbeOutcome::Missing),
            "drifted" => {
                Some(ProbeOutcome::Drifted { detail: String::new() })
            }
            _ => {
                let detail = line.strip_prefix("drifted ")?;
                Some(ProbeOutcome::Drifted {
                    detail: detail.trim().to_string(),
                })
            }
        }
    }
}

/// A failed attempt to observe; not a classification.
///
/// The reconciler treats this as transient for a bounded window and then
/// gives up loudly, rather than guessing at the resource's condition.
#[derive(Clone, Debug, Error)]
#[error("probe {action} could not determine resource state: {reason}")]
pub struct ProbeError {
    pub action: String,
    pub reason: String,
}

/// Observes the live condition of resources.
#[async_trait]
pub trait Probe: Send + Sync {
    /// Reports the current condition of the resource named by `action`
    /// (whose kind is always [`ActionKind::Probe`]).
    ///
    /// [`ActionKind::Probe`]: crate::provision::ActionKind::Probe
    async fn probe(
        &self,
        log: &Logger,
        action: &Action,
    ) -> Result<ProbeOutcome, ProbeError>;
}
