// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The orchestrator: drives phases from classification to completion.
//!
//! Each phase goes through the same cycle: classify against the live
//! world, execute whatever work came out of that (one task per resource,
//! concurrently), confirm every action with an independent probe, and
//! commit the updated records before moving on.  A phase failure halts
//! everything downstream of it; everything already recorded stays
//! recorded, so the next invocation picks up where this one stopped.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use foundry_common::ledger;
use serde_json::json;
use slog::{Logger, info, o, warn};
use slog_error_chain::InlineErrorChain;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};

use crate::config::{ParamsDigest, Profile, ResourceSpec};
use crate::executor::TaskExecutor;
use crate::graph::PhaseGraph;
use crate::phases::{PHASES, PhaseId, PhaseSpec, RetryPolicy, phase_spec};
use crate::probe::{Probe, ProbeOutcome};
use crate::provision::{Action, ActionKind, Provisioner};
use crate::reconcile::{
    ClassifyOptions, Decision, PhasePlan, ReconcileError, Reconciler,
    ResourceWork, phase_satisfied_per_records,
};
use crate::report::{Disposition, PhaseOutcome, ResourceOutcome, RunReport};
use crate::state::{RecordStatus, ResourceRecord, StateStore};

/// Grace period granted to in-flight actions after a cancellation
/// request before they are killed.
const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(5);

/// Where a run currently is.  UIs subscribe via
/// [`Orchestrator::progress`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunStep {
    Idle,
    Classifying(PhaseId),
    Executing(PhaseId),
    Destroying(PhaseId),
    Complete,
}

#[derive(Clone, Debug, Default)]
pub struct RunOptions {
    /// Phases named by the operator; empty means every phase.
    pub phases: Vec<PhaseId>,
    /// Rebuild the named phases even where probes report satisfied.
    pub force: bool,
    /// Run the named phases in isolation: no prerequisite validation,
    /// no gating, and one phase's failure does not halt the others.
    pub skip_prereq_check: bool,
}

impl RunOptions {
    /// Rejects option combinations that are never meaningful.
    pub fn validate(&self) -> Result<(), OrchestratorError> {
        if self.force && self.phases.is_empty() {
            return Err(OrchestratorError::InvalidRequest {
                reason: "--force requires naming the phases to rebuild"
                    .to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(
        "prerequisite {prerequisite} of requested phase {phase} is not \
         satisfied; run it first or pass --skip-prereq-check"
    )]
    PrerequisiteNotSatisfied { phase: PhaseId, prerequisite: PhaseId },

    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    #[error("cannot persist deployment state")]
    State(#[from] ledger::Error),
}

impl OrchestratorError {
    /// True for errors in the request itself, raised before anything
    /// ran; the CLI maps these to a distinct exit code.
    pub fn is_invalid_request(&self) -> bool {
        matches!(
            self,
            OrchestratorError::PrerequisiteNotSatisfied { .. }
                | OrchestratorError::InvalidRequest { .. }
        )
    }
}

/// Point-in-time view of one phase: its stored records joined with a
/// live classification.
#[derive(Clone, Debug)]
pub struct PhaseStatus {
    pub phase: PhaseId,
    pub decision: Decision,
    pub resources: Vec<ResourceStatus>,
}

#[derive(Clone, Debug)]
pub struct ResourceStatus {
    pub key: String,
    pub work: ResourceWork,
    pub stored_status: Option<RecordStatus>,
    pub resource_id: Option<String>,
    pub last_updated: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug)]
pub struct StatusReport {
    pub profile: String,
    pub phases: Vec<PhaseStatus>,
}

/// One unit of work handed to a per-resource task.
struct WorkItem {
    key: String,
    action: Action,
    /// Parameters for the post-action confirmation probe.
    probe_params: serde_json::Value,
    goal: Goal,
    prior_resource_id: Option<String>,
    /// Disposition to report if the item succeeds.
    success: Disposition,
}

enum Goal {
    /// The confirmation probe must report satisfied; success records
    /// the digest.
    Materialize { digest: ParamsDigest },
    /// The confirmation probe must report missing; success drops the
    /// record.
    Remove,
}

/// State-store change a finished task asks for.
enum RecordOp {
    Upsert(ResourceRecord),
    Remove,
    Keep,
}

struct PhaseRun {
    outcome: PhaseOutcome,
    interrupted: bool,
}

pub struct Orchestrator {
    log: Logger,
    graph: PhaseGraph,
    reconciler: Reconciler,
    executor: TaskExecutor,
    progress: watch::Sender<RunStep>,
    cancel_grace: Duration,
}

impl Orchestrator {
    pub fn new(
        log: &Logger,
        provisioner: Arc<dyn Provisioner>,
        probe: Arc<dyn Probe>,
    ) -> Orchestrator {
        let (progress, _) = watch::channel(RunStep::Idle);
        Orchestrator {
            log: log.new(o!("component" => "Orchestrator")),
            graph: PhaseGraph::production(),
            reconciler: Reconciler::new(probe),
            executor: TaskExecutor::new(provisioner),
            progress,
            cancel_grace: DEFAULT_CANCEL_GRACE,
        }
    }

    /// Progress receiver for UIs and tests.
    pub fn progress(&self) -> watch::Receiver<RunStep> {
        self.progress.subscribe()
    }

    /// Runs phases to satisfaction: classify, execute, confirm, record.
    ///
    /// Flipping `cancel` to true stops new work from starting; in-flight
    /// actions get a grace period to finish before they are killed.
    /// Results already confirmed are committed either way.
    pub async fn run(
        &self,
        profile: &Profile,
        store: &mut StateStore,
        options: &RunOptions,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<RunReport, OrchestratorError> {
        options.validate()?;
        let requested: Vec<PhaseId> = if options.phases.is_empty() {
            PhaseId::ALL.to_vec()
        } else {
            self.graph.order_isolated(&options.phases)
        };
        if !options.skip_prereq_check {
            self.validate_assumed_satisfied(profile, store, &requested)?;
        }

        store.set_profile_name(&profile.name);
        let classify = ClassifyOptions {
            force: options.force,
            skip_prereq_check: options.skip_prereq_check,
        };
        info!(
            self.log, "run starting";
            "profile" => %profile.name,
            "phases" => ?requested,
            "force" => options.force,
            "isolated" => options.skip_prereq_check,
        );

        let mut report = RunReport::new(&profile.name);
        let mut halted: Option<String> = None;
        for phase_id in requested {
            if *cancel.borrow() && halted.is_none() {
                halted = Some("interrupted".to_string());
            }
            if let Some(reason) = &halted {
                report.push(PhaseOutcome {
                    phase: phase_id,
                    disposition: Disposition::Aborted,
                    duration_ms: 0,
                    resources: Vec::new(),
                    error: Some(reason.clone()),
                });
                continue;
            }

            let PhaseRun { outcome, interrupted } = self
                .run_phase(profile, store, &classify, phase_id, &mut cancel)
                .await;
            store.save().await?;
            if interrupted {
                halted = Some("interrupted".to_string());
            } else if !outcome.disposition.is_success()
                && !options.skip_prereq_check
            {
                halted = Some(format!("halted by failure of {phase_id}"));
            }
            report.push(outcome);
        }
        report.finish();
        self.progress.send_replace(RunStep::Complete);
        info!(self.log, "run finished"; "ok" => report.all_succeeded());
        Ok(report)
    }

    /// What a run with `options` would do, without executing anything.
    ///
    /// Prerequisite gating is off: the preview assumes earlier phases
    /// will have completed by the time later ones run.
    pub async fn plan(
        &self,
        profile: &Profile,
        store: &StateStore,
        options: &RunOptions,
    ) -> Result<Vec<PhasePlan>, OrchestratorError> {
        options.validate()?;
        let requested: Vec<PhaseId> = if options.phases.is_empty() {
            PhaseId::ALL.to_vec()
        } else {
            self.graph.order_isolated(&options.phases)
        };
        let classify = ClassifyOptions {
            force: options.force,
            skip_prereq_check: true,
        };
        let mut plans = Vec::new();
        for phase_id in requested {
            let plan = self
                .reconciler
                .classify(
                    &self.log,
                    &self.graph,
                    phase_spec(phase_id),
                    profile,
                    store,
                    &classify,
                )
                .await?;
            plans.push(plan);
        }
        Ok(plans)
    }

    /// Classifies every phase without executing anything.
    ///
    /// Gating is off here too: status answers "what would each phase
    /// need", which is worth knowing even for phases blocked today.
    pub async fn status(
        &self,
        profile: &Profile,
        store: &StateStore,
    ) -> Result<StatusReport, OrchestratorError> {
        let classify =
            ClassifyOptions { force: false, skip_prereq_check: true };
        let mut phases = Vec::new();
        for spec in &PHASES {
            let plan = self
                .reconciler
                .classify(
                    &self.log, &self.graph, spec, profile, store, &classify,
                )
                .await?;
            let resources = plan
                .resources
                .iter()
                .map(|resource| {
                    let record = store.record(plan.phase, &resource.key);
                    ResourceStatus {
                        key: resource.key.clone(),
                        work: resource.work.clone(),
                        stored_status: record.map(|r| r.status),
                        resource_id: record
                            .and_then(|r| r.resource_id.clone()),
                        last_updated: record.map(|r| r.last_updated),
                    }
                })
                .collect();
            phases.push(PhaseStatus {
                phase: plan.phase,
                decision: plan.decision,
                resources,
            });
        }
        Ok(StatusReport { profile: profile.name.clone(), phases })
    }

    /// Tears phases down in reverse dependency order.  Destroying a
    /// phase implies destroying its dependents first, and a failure
    /// halts the teardown short of the phases beneath it.
    pub async fn destroy(
        &self,
        profile: &Profile,
        store: &mut StateStore,
        phases: &[PhaseId],
        mut cancel: watch::Receiver<bool>,
    ) -> Result<RunReport, OrchestratorError> {
        let requested: Vec<PhaseId> = if phases.is_empty() {
            PhaseId::ALL.to_vec()
        } else {
            phases.to_vec()
        };
        let order = self.graph.reverse_order(&requested);
        info!(
            self.log, "destroy starting";
            "profile" => %profile.name,
            "phases" => ?order,
        );

        let mut report = RunReport::new(&profile.name);
        let mut halted: Option<String> = None;
        for phase_id in order {
            let spec = phase_spec(phase_id);
            if *cancel.borrow() && halted.is_none() {
                halted = Some("interrupted".to_string());
            }
            if let Some(reason) = &halted {
                report.push(PhaseOutcome {
                    phase: phase_id,
                    disposition: Disposition::Aborted,
                    duration_ms: 0,
                    resources: Vec::new(),
                    error: Some(reason.clone()),
                });
                continue;
            }

            let records: Vec<(String, Option<String>)> = store
                .phase_records(phase_id)
                .map(|(key, record)| {
                    (key.clone(), record.resource_id.clone())
                })
                .collect();
            if records.is_empty() {
                report.push(PhaseOutcome {
                    phase: phase_id,
                    disposition: Disposition::Skipped,
                    duration_ms: 0,
                    resources: Vec::new(),
                    error: None,
                });
                continue;
            }

            let started = Instant::now();
            let outcome = if !spec.has_destroy {
                // Nothing external to tear down; the records go away on
                // their own.
                info!(
                    self.log, "phase has no destroy hook; dropping records";
                    "phase" => %phase_id,
                );
                let resources = records
                    .iter()
                    .map(|(key, _)| ResourceOutcome {
                        key: key.clone(),
                        disposition: Disposition::Destroyed,
                        attempts: 0,
                        duration_ms: 0,
                        error: None,
                    })
                    .collect();
                for (key, _) in &records {
                    store.remove(phase_id, key);
                }
                PhaseOutcome {
                    phase: phase_id,
                    disposition: Disposition::Destroyed,
                    duration_ms: elapsed_ms(started),
                    resources,
                    error: None,
                }
            } else {
                self.progress.send_replace(RunStep::Destroying(phase_id));
                let items = records
                    .into_iter()
                    .map(|(key, resource_id)| {
                        let params =
                            json!({ "resource_id": resource_id.clone() });
                        WorkItem {
                            key: key.clone(),
                            action: Action::new(
                                phase_id,
                                ActionKind::Destroy,
                                key,
                                params.clone(),
                            ),
                            probe_params: params,
                            goal: Goal::Remove,
                            prior_resource_id: resource_id,
                            success: Disposition::Destroyed,
                        }
                    })
                    .collect();
                let (resources, interrupted) =
                    self.run_items(spec, items, store, &mut cancel).await;
                let failed =
                    resources.iter().any(|r| !r.disposition.is_success());
                if interrupted {
                    halted = Some("interrupted".to_string());
                } else if failed {
                    halted =
                        Some(format!("halted by failure of {phase_id}"));
                }
                PhaseOutcome {
                    phase: phase_id,
                    disposition: if failed {
                        Disposition::Failed
                    } else {
                        Disposition::Destroyed
                    },
                    duration_ms: elapsed_ms(started),
                    error: failed
                        .then(|| {
                            resources
                                .iter()
                                .find_map(|r| r.error.clone())
                        })
                        .flatten(),
                    resources,
                }
            };
            report.push(outcome);
            store.save().await?;
        }
        report.finish();
        self.progress.send_replace(RunStep::Complete);
        Ok(report)
    }

    /// An explicitly requested subset leans on its omitted
    /// prerequisites already being satisfied; verify that before
    /// touching anything.
    fn validate_assumed_satisfied(
        &self,
        profile: &Profile,
        store: &StateStore,
        requested: &[PhaseId],
    ) -> Result<(), OrchestratorError> {
        let requested_set: BTreeSet<PhaseId> =
            requested.iter().copied().collect();
        for phase in self.graph.order(requested) {
            if requested_set.contains(&phase)
                || phase_satisfied_per_records(store, profile, phase)
            {
                continue;
            }
            // Name a requested phase that needs the unsatisfied
            // prerequisite; at least one does or the closure would not
            // contain it.
            let dependent = requested
                .iter()
                .copied()
                .find(|r| self.graph.closure(&[*r]).contains(&phase))
                .unwrap_or(phase);
            return Err(OrchestratorError::PrerequisiteNotSatisfied {
                phase: dependent,
                prerequisite: phase,
            });
        }
        Ok(())
    }

    async fn run_phase(
        &self,
        profile: &Profile,
        store: &mut StateStore,
        classify: &ClassifyOptions,
        phase_id: PhaseId,
        cancel: &mut watch::Receiver<bool>,
    ) -> PhaseRun {
        let spec = phase_spec(phase_id);
        let started = Instant::now();
        self.progress.send_replace(RunStep::Classifying(phase_id));
        let plan = match self
            .reconciler
            .classify(&self.log, &self.graph, spec, profile, store, classify)
            .await
        {
            Ok(plan) => plan,
            Err(err) => {
                warn!(
                    self.log, "phase classification failed";
                    "phase" => %phase_id,
                    "err" => InlineErrorChain::new(&err),
                );
                return PhaseRun {
                    outcome: PhaseOutcome {
                        phase: phase_id,
                        disposition: Disposition::Failed,
                        duration_ms: elapsed_ms(started),
                        resources: Vec::new(),
                        error: Some(InlineErrorChain::new(&err).to_string()),
                    },
                    interrupted: false,
                };
            }
        };

        match &plan.decision {
            Decision::Skip => {
                self.adopt_up_to_date(store, &plan);
                info!(
                    self.log, "phase already satisfied";
                    "phase" => %phase_id,
                );
                PhaseRun {
                    outcome: PhaseOutcome {
                        phase: phase_id,
                        disposition: Disposition::Skipped,
                        duration_ms: elapsed_ms(started),
                        resources: Vec::new(),
                        error: None,
                    },
                    interrupted: false,
                }
            }
            Decision::Abort { reason } => {
                warn!(
                    self.log, "phase aborted";
                    "phase" => %phase_id,
                    "reason" => %reason,
                );
                PhaseRun {
                    outcome: PhaseOutcome {
                        phase: phase_id,
                        disposition: Disposition::Aborted,
                        duration_ms: elapsed_ms(started),
                        resources: Vec::new(),
                        error: Some(reason.clone()),
                    },
                    interrupted: false,
                }
            }
            Decision::Create | Decision::Repair => {
                let success = if matches!(plan.decision, Decision::Create) {
                    Disposition::Created
                } else {
                    Disposition::Repaired
                };
                self.adopt_up_to_date(store, &plan);
                info!(
                    self.log, "phase needs work";
                    "phase" => %phase_id,
                    "decision" => plan.decision.label(),
                    "resources" => plan
                        .resources
                        .iter()
                        .filter(|r| r.work != ResourceWork::UpToDate)
                        .count(),
                );
                self.progress.send_replace(RunStep::Executing(phase_id));
                let items = build_work_items(spec, &plan, store);
                let (resources, interrupted) =
                    self.run_items(spec, items, store, cancel).await;
                let failed =
                    resources.iter().any(|r| !r.disposition.is_success());
                let error = if interrupted {
                    Some("interrupted".to_string())
                } else if failed {
                    resources.iter().find_map(|r| r.error.clone())
                } else {
                    None
                };
                PhaseRun {
                    outcome: PhaseOutcome {
                        phase: phase_id,
                        disposition: if failed {
                            Disposition::Failed
                        } else {
                            success
                        },
                        duration_ms: elapsed_ms(started),
                        resources,
                        error,
                    },
                    interrupted,
                }
            }
        }
    }

    /// Rewrites records whose stored status went stale: the live probe
    /// said satisfied, so a record claiming otherwise adopts what is
    /// actually there.
    fn adopt_up_to_date(&self, store: &mut StateStore, plan: &PhasePlan) {
        for resource in &plan.resources {
            if resource.work != ResourceWork::UpToDate {
                continue;
            }
            let Some(record) = store.record(plan.phase, &resource.key)
            else {
                continue;
            };
            if record.status == RecordStatus::Satisfied {
                continue;
            }
            info!(
                self.log, "adopting resource confirmed healthy";
                "phase" => %plan.phase,
                "resource" => resource.key.as_str(),
                "stored_status" => record.status.as_str(),
            );
            let mut updated = record.clone();
            updated.status = RecordStatus::Satisfied;
            updated.last_updated = Utc::now();
            updated.detail = None;
            store.upsert(plan.phase, &resource.key, updated);
        }
    }

    /// Executes work items concurrently, one task per resource, applying
    /// record changes as tasks finish.  On cancellation, in-flight tasks
    /// get the grace period to wrap up before being aborted; aborting a
    /// task kills the hook under it.
    async fn run_items(
        &self,
        spec: &PhaseSpec,
        items: Vec<WorkItem>,
        store: &mut StateStore,
        cancel: &mut watch::Receiver<bool>,
    ) -> (Vec<ResourceOutcome>, bool) {
        let phase = spec.id;
        let mut join_set = JoinSet::new();
        let mut pending: BTreeSet<String> = BTreeSet::new();
        for item in items {
            pending.insert(item.key.clone());
            let log = self.log.new(o!(
                "phase" => phase.to_string(),
                "resource" => item.key.clone(),
            ));
            let executor = self.executor.clone();
            let reconciler = self.reconciler.clone();
            let timeout = spec.timeout;
            let retry = spec.retry;
            join_set.spawn(async move {
                execute_item(log, executor, reconciler, item, timeout, retry)
                    .await
            });
        }

        let mut outcomes = Vec::new();
        let mut interrupted = false;
        while !join_set.is_empty() {
            tokio::select! {
                joined = join_set.join_next() => {
                    let Some(result) = joined else { break };
                    apply_task_result(
                        &self.log,
                        phase,
                        store,
                        &mut pending,
                        &mut outcomes,
                        result,
                    );
                }
                _ = cancel_requested(cancel), if !interrupted => {
                    interrupted = true;
                    warn!(
                        self.log,
                        "cancellation requested; draining in-flight actions";
                        "phase" => %phase,
                        "grace" => ?self.cancel_grace,
                    );
                    break;
                }
            }
        }

        if interrupted && !join_set.is_empty() {
            let deadline = Instant::now() + self.cancel_grace;
            loop {
                let left =
                    deadline.saturating_duration_since(Instant::now());
                match tokio::time::timeout(left, join_set.join_next()).await
                {
                    Ok(None) => break,
                    Ok(Some(result)) => apply_task_result(
                        &self.log,
                        phase,
                        store,
                        &mut pending,
                        &mut outcomes,
                        result,
                    ),
                    Err(_) => {
                        warn!(
                            self.log,
                            "grace period expired; killing remaining \
                             actions";
                            "phase" => %phase,
                            "remaining" => join_set.len(),
                        );
                        join_set.abort_all();
                        while let Some(result) = join_set.join_next().await
                        {
                            apply_task_result(
                                &self.log,
                                phase,
                                store,
                                &mut pending,
                                &mut outcomes,
                                result,
                            );
                        }
                        break;
                    }
                }
            }
        }

        // Anything still pending never produced a result.
        for key in pending {
            outcomes.push(ResourceOutcome {
                key,
                disposition: Disposition::Aborted,
                attempts: 0,
                duration_ms: 0,
                error: Some("interrupted".to_string()),
            });
        }
        (outcomes, interrupted)
    }
}

/// Expands a phase plan into executable work items.  Repair falls back
/// to create for phases without a repair hook; surplus resources become
/// destroys keyed by their recorded external id.
fn build_work_items(
    spec: &PhaseSpec,
    plan: &PhasePlan,
    store: &StateStore,
) -> Vec<WorkItem> {
    let mut items = Vec::new();
    for resource in &plan.resources {
        let prior_resource_id = store
            .record(plan.phase, &resource.key)
            .and_then(|record| record.resource_id.clone());
        match &resource.work {
            ResourceWork::UpToDate => {}
            ResourceWork::Create | ResourceWork::Repair { .. } => {
                let Some(params) = resource.params.clone() else {
                    continue;
                };
                let is_create =
                    matches!(resource.work, ResourceWork::Create);
                let (kind, success) = if is_create {
                    (ActionKind::Create, Disposition::Created)
                } else if spec.has_repair {
                    (ActionKind::Repair, Disposition::Repaired)
                } else {
                    // No repair hook: recreate in place.
                    (ActionKind::Create, Disposition::Repaired)
                };
                let digest = ParamsDigest::of(&params);
                items.push(WorkItem {
                    key: resource.key.clone(),
                    action: Action::new(
                        plan.phase,
                        kind,
                        resource.key.clone(),
                        params.clone(),
                    ),
                    probe_params: params,
                    goal: Goal::Materialize { digest },
                    prior_resource_id,
                    success,
                });
            }
            ResourceWork::Retire => {
                let params =
                    json!({ "resource_id": prior_resource_id.clone() });
                items.push(WorkItem {
                    key: resource.key.clone(),
                    action: Action::new(
                        plan.phase,
                        ActionKind::Destroy,
                        resource.key.clone(),
                        params.clone(),
                    ),
                    probe_params: params,
                    goal: Goal::Remove,
                    prior_resource_id,
                    success: Disposition::Destroyed,
                });
            }
        }
    }
    items
}

/// Runs one work item end to end: the action through the executor, then
/// a confirmation probe.  An action only counts once the live world
/// agrees it took.
async fn execute_item(
    log: Logger,
    executor: TaskExecutor,
    reconciler: Reconciler,
    item: WorkItem,
    timeout: Duration,
    retry: RetryPolicy,
) -> (String, ResourceOutcome, RecordOp) {
    let execution =
        executor.execute(&log, &item.action, timeout, &retry).await;
    let duration_ms = execution.duration.as_millis() as u64;
    if !execution.ok {
        let op = match &item.goal {
            Goal::Materialize { digest } => {
                RecordOp::Upsert(ResourceRecord {
                    resource_id: execution
                        .resource_id
                        .clone()
                        .or_else(|| item.prior_resource_id.clone()),
                    digest: digest.clone(),
                    status: RecordStatus::Failed,
                    last_updated: Utc::now(),
                    last_duration_ms: duration_ms,
                    detail: Some(execution.detail.clone()),
                })
            }
            // A failed retire keeps its record; the resource may well
            // still exist.
            Goal::Remove => RecordOp::Keep,
        };
        let outcome = ResourceOutcome {
            key: item.key.clone(),
            disposition: Disposition::Failed,
            attempts: execution.attempts,
            duration_ms,
            error: Some(execution.detail),
        };
        return (item.key, outcome, op);
    }

    let confirm = ResourceSpec {
        phase: item.action.phase,
        key: item.key.clone(),
        params: item.probe_params.clone(),
    };
    let confirmed = match reconciler.probe_with_retries(&log, &confirm).await
    {
        Err(err) => Err(err.to_string()),
        Ok(outcome) => {
            let met = match item.goal {
                Goal::Materialize { .. } => {
                    outcome == ProbeOutcome::Satisfied
                }
                Goal::Remove => outcome == ProbeOutcome::Missing,
            };
            if met {
                Ok(())
            } else {
                Err(format!(
                    "action succeeded but the resource then probed {}",
                    outcome.label(),
                ))
            }
        }
    };

    match confirmed {
        Ok(()) => match item.goal {
            Goal::Materialize { digest } => {
                let resource_id =
                    execution.resource_id.or(item.prior_resource_id);
                info!(
                    log, "resource satisfied";
                    "resource_id" => ?resource_id,
                    "attempts" => execution.attempts,
                );
                let record = ResourceRecord {
                    resource_id,
                    digest,
                    status: RecordStatus::Satisfied,
                    last_updated: Utc::now(),
                    last_duration_ms: duration_ms,
                    detail: None,
                };
                let outcome = ResourceOutcome {
                    key: item.key.clone(),
                    disposition: item.success,
                    attempts: execution.attempts,
                    duration_ms,
                    error: None,
                };
                (item.key, outcome, RecordOp::Upsert(record))
            }
            Goal::Remove => {
                info!(log, "resource removed");
                let outcome = ResourceOutcome {
                    key: item.key.clone(),
                    disposition: Disposition::Destroyed,
                    attempts: execution.attempts,
                    duration_ms,
                    error: None,
                };
                (item.key, outcome, RecordOp::Remove)
            }
        },
        Err(reason) => {
            warn!(
                log, "post-action confirmation failed";
                "reason" => %reason,
            );
            let op = match item.goal {
                Goal::Materialize { digest } => {
                    RecordOp::Upsert(ResourceRecord {
                        resource_id: execution
                            .resource_id
                            .or(item.prior_resource_id),
                        digest,
                        status: RecordStatus::Failed,
                        last_updated: Utc::now(),
                        last_duration_ms: duration_ms,
                        detail: Some(reason.clone()),
                    })
                }
                Goal::Remove => RecordOp::Keep,
            };
            let outcome = ResourceOutcome {
                key: item.key.clone(),
                disposition: Disposition::Failed,
                attempts: execution.attempts,
                duration_ms,
                error: Some(reason),
            };
            (item.key, outcome, op)
        }
    }
}

/// Applies one finished task's record change and collects its outcome.
fn apply_task_result(
    log: &Logger,
    phase: PhaseId,
    store: &mut StateStore,
    pending: &mut BTreeSet<String>,
    outcomes: &mut Vec<ResourceOutcome>,
    result: Result<(String, ResourceOutcome, RecordOp), JoinError>,
) {
    match result {
        Ok((key, outcome, op)) => {
            pending.remove(&key);
            match op {
                RecordOp::Upsert(record) => {
                    store.upsert(phase, &key, record)
                }
                RecordOp::Remove => {
                    store.remove(phase, &key);
                }
                RecordOp::Keep => {}
            }
            outcomes.push(outcome);
        }
        Err(err) if err.is_cancelled() => {
            // Killed in the grace-period sweep; its resource stays in
            // `pending` and gets reported as aborted.
        }
        Err(err) => {
            warn!(
                log, "resource task failed";
                "phase" => %phase,
                "err" => %err,
            );
        }
    }
}

/// Resolves when `cancel` reads true; pends forever once the sender is
/// gone, since no one is left to ask for cancellation.
async fn cancel_requested(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}
