// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The fixed set of deployment phases and their execution parameters.
//!
//! Phases are defined once, at compile time.  Nothing in the system creates
//! or destroys a phase at runtime; profiles only vary the resources each
//! phase manages.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use foundry_common::backoff::ExponentialBackoff;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;

/// Identifies one deployment phase.
///
/// The derived `Ord` follows declaration order, which is also a valid
/// execution order for the production graph; execution ordering is always
/// computed from [`PhaseSpec::prerequisites`], never from `Ord`.
#[derive(
    Copy,
    Clone,
    Debug,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
    JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum PhaseId {
    /// Validates the hosting environment (connectivity, capacity, images
    /// available to build from).
    Foundation,
    /// Builds or imports the golden node image.
    Image,
    /// Provisions the cluster nodes themselves.
    Infrastructure,
    /// Bootstraps the workload orchestrator across the provisioned nodes.
    Bootstrap,
    /// Layers platform services on top of the bootstrapped cluster.
    Platform,
}

impl PhaseId {
    /// Every phase, in declaration order.
    pub const ALL: [PhaseId; 5] = [
        PhaseId::Foundation,
        PhaseId::Image,
        PhaseId::Infrastructure,
        PhaseId::Bootstrap,
        PhaseId::Platform,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseId::Foundation => "foundation",
            PhaseId::Image => "image",
            PhaseId::Infrastructure => "infrastructure",
            PhaseId::Bootstrap => "bootstrap",
            PhaseId::Platform => "platform",
        }
    }
}

impl fmt::Display for PhaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, thiserror::Error)]
#[error(
    "unknown phase {0:?} (expected one of: foundation, image, \
     infrastructure, bootstrap, platform)"
)]
pub struct UnknownPhase(String);

impl FromStr for PhaseId {
    type Err = UnknownPhase;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "foundation" => Ok(PhaseId::Foundation),
            "image" => Ok(PhaseId::Image),
            "infrastructure" => Ok(PhaseId::Infrastructure),
            "bootstrap" => Ok(PhaseId::Bootstrap),
            "platform" => Ok(PhaseId::Platform),
            _ => Err(UnknownPhase(s.to_string())),
        }
    }
}

/// Retry budget for one action: a bounded number of attempts with
/// exponentially backed-off delays in between.
#[derive(Copy, Clone, Debug)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Produces the backoff schedule for one action's attempts.  The
    /// executor enforces `max_attempts`; the schedule itself never gives
    /// up, so `max_elapsed_time` is unset.
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.initial_delay,
            initial_interval: self.initial_delay,
            multiplier: 2.0,
            max_interval: self.max_delay,
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

/// Static execution parameters for one phase.
#[derive(Clone, Debug)]
pub struct PhaseSpec {
    pub id: PhaseId,
    /// Phases that must be satisfied before this one may execute.
    pub prerequisites: &'static [PhaseId],
    /// Hard deadline for a single action attempt against this phase's
    /// resources.
    pub timeout: Duration,
    pub retry: RetryPolicy,
    /// Whether a dedicated repair hook exists.  Phases without one are
    /// repaired by re-running create.
    pub has_repair: bool,
    /// Whether a destroy hook exists.  Phases without one (foundation)
    /// tear nothing down; their records are dropped directly.
    pub has_destroy: bool,
}

/// The production phase table.  Timeouts and attempt budgets follow the
/// operational envelope of the tools the hooks wrap: image builds and
/// cluster bootstrap take tens of minutes, node provisioning takes a few,
/// environment validation is near-instant.
pub static PHASES: [PhaseSpec; 5] = [
    PhaseSpec {
        id: PhaseId::Foundation,
        prerequisites: &[],
        timeout: Duration::from_secs(60),
        retry: RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(15),
        },
        has_repair: false,
        has_destroy: false,
    },
    PhaseSpec {
        id: PhaseId::Image,
        prerequisites: &[PhaseId::Foundation],
        timeout: Duration::from_secs(30 * 60),
        retry: RetryPolicy {
            max_attempts: 2,
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
        },
        has_repair: false,
        has_destroy: true,
    },
    PhaseSpec {
        id: PhaseId::Infrastructure,
        prerequisites: &[PhaseId::Foundation, PhaseId::Image],
        timeout: Duration::from_secs(10 * 60),
        retry: RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
        },
        has_repair: true,
        has_destroy: true,
    },
    PhaseSpec {
        id: PhaseId::Bootstrap,
        prerequisites: &[PhaseId::Infrastructure],
        timeout: Duration::from_secs(30 * 60),
        retry: RetryPolicy {
            max_attempts: 2,
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
        },
        has_repair: true,
        has_destroy: true,
    },
    PhaseSpec {
        id: PhaseId::Platform,
        prerequisites: &[PhaseId::Bootstrap],
        timeout: Duration::from_secs(5 * 60),
        retry: RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
        },
        has_repair: true,
        has_destroy: true,
    },
];

/// Looks up the static spec for `id`.
pub fn phase_spec(id: PhaseId) -> &'static PhaseSpec {
    PHASES.iter().find(|spec| spec.id == id).expect("all phases are in PHASES")
}
