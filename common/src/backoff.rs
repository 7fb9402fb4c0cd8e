// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Module providing utilities for retrying operations with exponential backoff.

use std::time::Duration;

pub use ::backoff::Error as BackoffError;
pub use ::backoff::future::{retry, retry_notify};
pub use ::backoff::{ExponentialBackoff, Notify, backoff::Backoff};

/// Return a backoff policy for spacing out retries of a provisioner action.
///
/// The task executor bounds the number of attempts itself, so this policy
/// never gives up on its own.
pub fn retry_policy_action() -> ::backoff::ExponentialBackoff {
    const INITIAL_INTERVAL: Duration = Duration::from_secs(1);
    const MAX_INTERVAL: Duration = Duration::from_secs(60);
    policy_with_max(INITIAL_INTERVAL, MAX_INTERVAL, None)
}

/// Return a backoff policy for retrying a probe that could not determine the
/// state of a resource.
///
/// Probe failures are only treated as transient for a bounded window; once
/// the policy's elapsed budget runs out the caller escalates rather than
/// looping forever on an unanswerable question.
pub fn retry_policy_probe() -> ::backoff::ExponentialBackoff {
    const INITIAL_INTERVAL: Duration = Duration::from_millis(250);
    const MAX_INTERVAL: Duration = Duration::from_secs(5);
    const MAX_ELAPSED: Duration = Duration::from_secs(30);
    policy_with_max(INITIAL_INTERVAL, MAX_INTERVAL, Some(MAX_ELAPSED))
}

fn policy_with_max(
    initial_interval: Duration,
    max_interval: Duration,
    max_elapsed_time: Option<Duration>,
) -> ::backoff::ExponentialBackoff {
    let current_interval = initial_interval;
    ::backoff::ExponentialBackoff {
        current_interval,
        initial_interval,
        multiplier: 2.0,
        max_interval,
        max_elapsed_time,
        ..backoff::ExponentialBackoff::default()
    }
}
