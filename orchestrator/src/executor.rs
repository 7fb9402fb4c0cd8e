// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Drives one action to completion within a timeout and retry budget.
//!
//! The executor owns the difference between "failed" and "failed for
//! now": transient failures are retried with backed-off delays up to the
//! phase's attempt budget, fatal failures stop immediately.  Each attempt
//! runs under a hard deadline; when it expires the in-flight invocation
//! is dropped, which kills the underlying hook process.

use std::sync::Arc;
use std::time::{Duration, Instant};

use foundry_common::backoff::Backoff;
use slog::{Logger, info, warn};
use slog_error_chain::InlineErrorChain;

use crate::phases::RetryPolicy;
use crate::provision::{Action, Provisioner};

/// The result of driving one action through however many attempts the
/// retry policy allowed.
#[derive(Clone, Debug)]
pub struct ExecutionOutcome {
    pub ok: bool,
    pub attempts: usize,
    /// Total wall-clock time across all attempts, including delays.
    pub duration: Duration,
    /// Output tail or error description from the deciding attempt.
    pub detail: String,
    /// External resource id announced by a successful action.
    pub resource_id: Option<String>,
    /// On failure: whether the deciding failure was fatal, as opposed to
    /// the budget running out on transient failures.
    pub fatal: bool,
}

enum Verdict {
    Success { detail: String, resource_id: Option<String> },
    Transient(String),
    Fatal(String),
}

#[derive(Clone)]
pub struct TaskExecutor {
    provisioner: Arc<dyn Provisioner>,
}

impl TaskExecutor {
    pub fn new(provisioner: Arc<dyn Provisioner>) -> TaskExecutor {
        TaskExecutor { provisioner }
    }

    pub async fn execute(
        &self,
        log: &Logger,
        action: &Action,
        timeout: Duration,
        retry: &RetryPolicy,
    ) -> ExecutionOutcome {
        let start = Instant::now();
        let mut backoff = retry.backoff();
        let mut attempt = 0;
        loop {
            attempt += 1;
            info!(
                log, "executing action";
                "action" => %action,
                "attempt" => attempt,
                "max_attempts" => retry.max_attempts,
                "timeout" => ?timeout,
            );
            let attempt_start = Instant::now();
            let invocation = self.provisioner.invoke(log, action);
            let verdict = match tokio::time::timeout(timeout, invocation)
                .await
            {
                Err(_) => {
                    // Dropping the invocation kills the hook process.
                    warn!(
                        log, "action timed out; hook killed";
                        "action" => %action,
                        "timeout" => ?timeout,
                    );
                    Verdict::Transient(format!("timed out after {timeout:?}"))
                }
                Ok(Err(err)) => {
                    let reason = InlineErrorChain::new(&err).to_string();
                    if err.is_transient() {
                        Verdict::Transient(reason)
                    } else {
                        Verdict::Fatal(reason)
                    }
                }
                Ok(Ok(result)) if result.ok => Verdict::Success {
                    detail: result.detail,
                    resource_id: result.resource_id,
                },
                Ok(Ok(result)) if result.transient => {
                    Verdict::Transient(nonempty(result.detail))
                }
                Ok(Ok(result)) => Verdict::Fatal(nonempty(result.detail)),
            };
            let elapsed = attempt_start.elapsed();

            match verdict {
                Verdict::Success { detail, resource_id } => {
                    info!(
                        log, "action succeeded";
                        "action" => %action,
                        "attempt" => attempt,
                        "duration" => ?elapsed,
                    );
                    return ExecutionOutcome {
                        ok: true,
                        attempts: attempt,
                        duration: start.elapsed(),
                        detail,
                        resource_id,
                        fatal: false,
                    };
                }
                Verdict::Fatal(detail) => {
                    warn!(
                        log, "action failed; not retryable";
                        "action" => %action,
                        "attempt" => attempt,
                        "duration" => ?elapsed,
                        "detail" => %detail,
                    );
                    return ExecutionOutcome {
                        ok: false,
                        attempts: attempt,
                        duration: start.elapsed(),
                        detail,
                        resource_id: None,
                        fatal: true,
                    };
                }
                Verdict::Transient(detail) => {
                    if attempt >= retry.max_attempts {
                        warn!(
                            log, "action failed; attempt budget exhausted";
                            "action" => %action,
                            "attempts" => attempt,
                            "detail" => %detail,
                        );
                        return ExecutionOutcome {
                            ok: false,
                            attempts: attempt,
                            duration: start.elapsed(),
                            detail,
                            resource_id: None,
                            fatal: false,
                        };
                    }
                    let delay =
                        backoff.next_backoff().unwrap_or(retry.max_delay);
                    warn!(
                        log, "action failed; will retry";
                        "action" => %action,
                        "attempt" => attempt,
                        "retry_after" => ?delay,
                        "detail" => %detail,
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

fn nonempty(detail: String) -> String {
    if detail.is_empty() { "hook produced no output".to_string() } else { detail }
}
