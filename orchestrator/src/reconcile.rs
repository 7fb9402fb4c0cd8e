// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Classification: deciding what, if anything, each phase needs.
//!
//! The reconciler compares three inputs per resource: the profile (what
//! the operator wants), the state store (what was done before), and the
//! probe (what is actually out there).  Bookkeeping is never trusted on
//! its own; a resource only counts as up to date when the live probe
//! confirms it.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use foundry_common::backoff::{Backoff, ExponentialBackoff, retry_policy_probe};
use slog::{Logger, info, warn};
use thiserror::Error;

use crate::config::{Profile, ResourceSpec};
use crate::graph::PhaseGraph;
use crate::phases::{PhaseId, PhaseSpec};
use crate::probe::{Probe, ProbeOutcome};
use crate::provision::{Action, ActionKind};
use crate::state::{RecordStatus, StateStore};

/// Hard deadline for a single probe invocation.
const PROBE_TIMEOUT: Duration = Duration::from_secs(60);

/// Phase-level decision.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    /// Everything up to date; nothing to execute.
    Skip,
    /// The phase has never produced anything here; work is first-time
    /// creation.
    Create,
    /// Some resources exist but need work.
    Repair,
    /// The phase may not run at all.
    Abort { reason: String },
}

impl Decision {
    pub fn label(&self) -> &'static str {
        match self {
            Decision::Skip => "skip",
            Decision::Create => "create",
            Decision::Repair => "repair",
            Decision::Abort { .. } => "abort",
        }
    }
}

/// What one resource needs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResourceWork {
    UpToDate,
    Create,
    Repair { reason: String },
    /// No longer desired by the profile; to be destroyed and its record
    /// dropped.
    Retire,
}

#[derive(Clone, Debug)]
pub struct ResourcePlan {
    pub key: String,
    pub work: ResourceWork,
    /// Desired parameters; `None` when retiring a surplus resource.
    pub params: Option<serde_json::Value>,
}

#[derive(Clone, Debug)]
pub struct PhasePlan {
    pub phase: PhaseId,
    pub decision: Decision,
    pub resources: Vec<ResourcePlan>,
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The probe kept failing past its retry window; the resource's real
    /// condition is unknown and guessing would be worse than stopping.
    #[error("cannot determine state of {phase} resource {resource}: {reason}")]
    ProbeEscalated { phase: PhaseId, resource: String, reason: String },
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ClassifyOptions {
    /// Reclassify probe-confirmed `Satisfied` resources as Repair.
    pub force: bool,
    /// Skip the prerequisite gate.
    pub skip_prereq_check: bool,
}

/// True when every resource `profile` wants under `phase` has a record
/// with status `Satisfied`.
///
/// This is "last known status": records only, no probing.  Both the
/// prerequisite gate and the validation of explicitly requested phase
/// subsets want exactly this, since prerequisites are re-verified live
/// the moment anything actually executes against them.
pub fn phase_satisfied_per_records(
    store: &StateStore,
    profile: &Profile,
    phase: PhaseId,
) -> bool {
    profile.resources_for(phase).iter().all(|resource| {
        store
            .record(phase, &resource.key)
            .is_some_and(|record| record.status == RecordStatus::Satisfied)
    })
}

#[derive(Clone)]
pub struct Reconciler {
    probe: Arc<dyn Probe>,
    /// Backoff schedule for failed probes; its `max_elapsed_time` bounds
    /// how long to keep retrying before escalating.
    probe_policy: ExponentialBackoff,
}

impl Reconciler {
    pub fn new(probe: Arc<dyn Probe>) -> Reconciler {
        Reconciler { probe, probe_policy: retry_policy_probe() }
    }

    #[cfg(test)]
    fn with_probe_policy(mut self, policy: ExponentialBackoff) -> Reconciler {
        self.probe_policy = policy;
        self
    }

    /// Classifies one phase against the profile, state, and live world.
    pub async fn classify(
        &self,
        log: &Logger,
        graph: &PhaseGraph,
        spec: &PhaseSpec,
        profile: &Profile,
        store: &StateStore,
        options: &ClassifyOptions,
    ) -> Result<PhasePlan, ReconcileError> {
        let phase = spec.id;

        if !options.skip_prereq_check {
            for prereq in graph.prerequisites_of(phase) {
                if !phase_satisfied_per_records(store, profile, prereq) {
                    info!(
                        log, "phase blocked by unsatisfied prerequisite";
                        "phase" => %phase,
                        "prerequisite" => %prereq,
                    );
                    return Ok(PhasePlan {
                        phase,
                        decision: Decision::Abort {
                            reason: format!(
                                "prerequisite {prereq} is not satisfied"
                            ),
                        },
                        resources: Vec::new(),
                    });
                }
            }
        }

        let desired = profile.resources_for(phase);
        let had_records = store.phase_records(phase).next().is_some();

        let mut resources = Vec::with_capacity(desired.len());
        for resource in &desired {
            let work = self
                .classify_resource(log, resource, store, options)
                .await?;
            resources.push(ResourcePlan {
                key: resource.key.clone(),
                work,
                params: Some(resource.params.clone()),
            });
        }

        // Records whose keys the profile no longer wants.
        let desired_keys: BTreeSet<&str> =
            desired.iter().map(|r| r.key.as_str()).collect();
        for (key, _) in store.phase_records(phase) {
            if !desired_keys.contains(key.as_str()) {
                resources.push(ResourcePlan {
                    key: key.clone(),
                    work: ResourceWork::Retire,
                    params: None,
                });
            }
        }

        let any_work =
            resources.iter().any(|r| r.work != ResourceWork::UpToDate);
        let decision = if !any_work {
            Decision::Skip
        } else if had_records {
            Decision::Repair
        } else {
            Decision::Create
        };
        Ok(PhasePlan { phase, decision, resources })
    }

    async fn classify_resource(
        &self,
        log: &Logger,
        resource: &ResourceSpec,
        store: &StateStore,
        options: &ClassifyOptions,
    ) -> Result<ResourceWork, ReconcileError> {
        let Some(record) = store.record(resource.phase, &resource.key)
        else {
            return Ok(ResourceWork::Create);
        };
        // A digest mismatch is decisive on its own: the profile moved,
        // whatever the external resource currently looks like.
        if record.digest != resource.digest() {
            return Ok(ResourceWork::Repair {
                reason: "profile parameters changed".to_string(),
            });
        }
        match self.probe_with_retries(log, resource).await? {
            ProbeOutcome::Missing => Ok(ResourceWork::Create),
            ProbeOutcome::Drifted { detail } => Ok(ResourceWork::Repair {
                reason: if detail.is_empty() {
                    "drifted".to_string()
                } else {
                    format!("drifted: {detail}")
                },
            }),
            ProbeOutcome::Satisfied => {
                if options.force {
                    Ok(ResourceWork::Repair {
                        reason: "forced".to_string(),
                    })
                } else {
                    Ok(ResourceWork::UpToDate)
                }
            }
        }
    }

    /// Probes `resource`, retrying failures within the policy's window,
    /// then escalating.  Probe failures are never classifications.
    pub(crate) async fn probe_with_retries(
        &self,
        log: &Logger,
        resource: &ResourceSpec,
    ) -> Result<ProbeOutcome, ReconcileError> {
        let action = Action::new(
            resource.phase,
            ActionKind::Probe,
            resource.key.clone(),
            resource.params.clone(),
        );
        let mut schedule = self.probe_policy.clone();
        schedule.reset();
        loop {
            let attempt = self.probe.probe(log, &action);
            let reason = match tokio::time::timeout(PROBE_TIMEOUT, attempt)
                .await
            {
                Ok(Ok(outcome)) => return Ok(outcome),
                Ok(Err(err)) => err.to_string(),
                Err(_) => format!("probe timed out after {PROBE_TIMEOUT:?}"),
            };
            match schedule.next_backoff() {
                Some(delay) => {
                    warn!(
                        log, "probe failed; will retry";
                        "action" => %action,
                        "retry_after" => ?delay,
                        "reason" => %reason,
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    return Err(ReconcileError::ProbeEscalated {
                        phase: resource.phase,
                        resource: resource.key.clone(),
                        reason,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{FakeWorld, mark_phase_satisfied, test_profile};
    use crate::phases::phase_spec;
    use camino_tempfile::Utf8TempDir;
    use foundry_test_utils::dev::test_setup_log;

    use PhaseId::*;

    struct Harness {
        world: Arc<FakeWorld>,
        reconciler: Reconciler,
        graph: PhaseGraph,
        profile: Profile,
        _dir: Utf8TempDir,
        store: StateStore,
    }

    async fn harness(log: &slog::Logger, profile: Profile) -> Harness {
        let world = FakeWorld::new();
        let reconciler = Reconciler::new(world.probe());
        let dir = Utf8TempDir::new().unwrap();
        let store = StateStore::load(log, dir.path()).await;
        Harness {
            world,
            reconciler,
            graph: PhaseGraph::production(),
            profile,
            _dir: dir,
            store,
        }
    }

    /// Marks `phase` satisfied in both the store and the world.
    fn settle(h: &mut Harness, phase: PhaseId) {
        mark_phase_satisfied(&mut h.store, &h.profile, phase);
        for resource in h.profile.resources_for(phase) {
            h.world.set_present(phase, &resource.key);
        }
    }

    async fn classify(
        h: &Harness,
        log: &slog::Logger,
        phase: PhaseId,
        options: ClassifyOptions,
    ) -> PhasePlan {
        h.reconciler
            .classify(
                log,
                &h.graph,
                phase_spec(phase),
                &h.profile,
                &h.store,
                &options,
            )
            .await
            .expect("classification succeeds")
    }

    fn work_for<'a>(plan: &'a PhasePlan, key: &str) -> &'a ResourceWork {
        &plan
            .resources
            .iter()
            .find(|r| r.key == key)
            .unwrap_or_else(|| panic!("no plan entry for {key}"))
            .work
    }

    #[tokio::test]
    async fn absent_records_classify_create_without_probing() {
        let logctx =
            test_setup_log("absent_records_classify_create_without_probing");
        let mut h =
            harness(&logctx.log, test_profile("t", 1, 1, &[])).await;
        settle(&mut h, Foundation);
        settle(&mut h, Image);

        let plan =
            classify(&h, &logctx.log, Infrastructure, Default::default())
                .await;
        assert_eq!(plan.decision, Decision::Create);
        assert_eq!(work_for(&plan, "control-01"), &ResourceWork::Create);
        assert_eq!(work_for(&plan, "worker-01"), &ResourceWork::Create);
        // No record means nothing to compare against; no probe runs.
        assert_eq!(h.world.probe_count(Infrastructure, "control-01"), 0);
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn digest_mismatch_repairs_without_probing() {
        let logctx =
            test_setup_log("digest_mismatch_repairs_without_probing");
        let mut h =
            harness(&logctx.log, test_profile("t", 1, 0, &[])).await;
        settle(&mut h, Foundation);
        settle(&mut h, Image);
        settle(&mut h, Infrastructure);
        // The profile's sizing moves on; the stored digest goes stale.
        h.profile = test_profile("t2", 1, 0, &[]);
        h.profile.nodes.control_sizing.vcpus = 8;

        let plan =
            classify(&h, &logctx.log, Infrastructure, Default::default())
                .await;
        assert_eq!(plan.decision, Decision::Repair);
        assert_eq!(
            work_for(&plan, "control-01"),
            &ResourceWork::Repair {
                reason: "profile parameters changed".to_string()
            }
        );
        assert_eq!(h.world.probe_count(Infrastructure, "control-01"), 0);
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn probe_outcomes_drive_matching_records() {
        let logctx = test_setup_log("probe_outcomes_drive_matching_records");
        let mut h =
            harness(&logctx.log, test_profile("t", 1, 2, &[])).await;
        settle(&mut h, Foundation);
        settle(&mut h, Image);
        // All three nodes have matching records, but the world diverged:
        // worker-01 vanished, worker-02 drifted.
        mark_phase_satisfied(&mut h.store, &h.profile, Infrastructure);
        h.world.set_present(Infrastructure, "control-01");
        h.world.set_drifted(Infrastructure, "worker-02", "vcpus 2 != 6");

        let plan =
            classify(&h, &logctx.log, Infrastructure, Default::default())
                .await;
        assert_eq!(plan.decision, Decision::Repair);
        assert_eq!(work_for(&plan, "control-01"), &ResourceWork::UpToDate);
        assert_eq!(work_for(&plan, "worker-01"), &ResourceWork::Create);
        assert_eq!(
            work_for(&plan, "worker-02"),
            &ResourceWork::Repair {
                reason: "drifted: vcpus 2 != 6".to_string()
            }
        );
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn fully_settled_phase_skips() {
        let logctx = test_setup_log("fully_settled_phase_skips");
        let mut h =
            harness(&logctx.log, test_profile("t", 1, 0, &[])).await;
        settle(&mut h, Foundation);

        let plan =
            classify(&h, &logctx.log, Foundation, Default::default()).await;
        assert_eq!(plan.decision, Decision::Skip);
        assert_eq!(work_for(&plan, "environment"), &ResourceWork::UpToDate);
        assert_eq!(h.world.probe_count(Foundation, "environment"), 1);
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn force_overrides_satisfied_but_not_missing() {
        let logctx =
            test_setup_log("force_overrides_satisfied_but_not_missing");
        let mut h =
            harness(&logctx.log, test_profile("t", 1, 1, &[])).await;
        settle(&mut h, Foundation);
        settle(&mut h, Image);
        mark_phase_satisfied(&mut h.store, &h.profile, Infrastructure);
        // control-01 really exists; worker-01 is gone despite its record.
        h.world.set_present(Infrastructure, "control-01");

        let options = ClassifyOptions { force: true, ..Default::default() };
        let plan =
            classify(&h, &logctx.log, Infrastructure, options).await;
        assert_eq!(
            work_for(&plan, "control-01"),
            &ResourceWork::Repair { reason: "forced".to_string() }
        );
        // Force does not turn a missing resource into a repair; create
        // is still the right action for it.
        assert_eq!(work_for(&plan, "worker-01"), &ResourceWork::Create);
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn surplus_records_are_retired() {
        let logctx = test_setup_log("surplus_records_are_retired");
        let wide = test_profile("t", 1, 3, &[]);
        let mut h = harness(&logctx.log, wide.clone()).await;
        settle(&mut h, Foundation);
        settle(&mut h, Image);
        mark_phase_satisfied(&mut h.store, &wide, Infrastructure);
        for resource in wide.resources_for(Infrastructure) {
            h.world.set_present(Infrastructure, &resource.key);
        }
        // The profile narrows to one worker; two records go surplus.
        h.profile = test_profile("t", 1, 1, &[]);

        let plan =
            classify(&h, &logctx.log, Infrastructure, Default::default())
                .await;
        assert_eq!(plan.decision, Decision::Repair);
        assert_eq!(work_for(&plan, "worker-02"), &ResourceWork::Retire);
        assert_eq!(work_for(&plan, "worker-03"), &ResourceWork::Retire);
        let retired = plan
            .resources
            .iter()
            .find(|r| r.key == "worker-02")
            .unwrap();
        assert!(retired.params.is_none());
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn unsatisfied_prerequisite_aborts_unless_skipped() {
        let logctx =
            test_setup_log("unsatisfied_prerequisite_aborts_unless_skipped");
        let mut h =
            harness(&logctx.log, test_profile("t", 1, 0, &[])).await;
        // Foundation satisfied, image not: infrastructure must not run.
        settle(&mut h, Foundation);

        let plan =
            classify(&h, &logctx.log, Infrastructure, Default::default())
                .await;
        assert!(matches!(plan.decision, Decision::Abort { .. }));
        assert!(plan.resources.is_empty());
        assert_eq!(h.world.probe_count(Infrastructure, "control-01"), 0);

        let options =
            ClassifyOptions { skip_prereq_check: true, ..Default::default() };
        let plan = classify(&h, &logctx.log, Infrastructure, options).await;
        assert_eq!(plan.decision, Decision::Create);
        logctx.cleanup_successful();
    }

    fn tight_probe_policy() -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: Duration::from_millis(5),
            initial_interval: Duration::from_millis(5),
            multiplier: 2.0,
            max_interval: Duration::from_millis(10),
            max_elapsed_time: Some(Duration::from_millis(100)),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn probe_failures_escalate_after_the_window() {
        let logctx =
            test_setup_log("probe_failures_escalate_after_the_window");
        let mut h =
            harness(&logctx.log, test_profile("t", 1, 0, &[])).await;
        h.reconciler = Reconciler::new(h.world.probe())
            .with_probe_policy(tight_probe_policy());
        settle(&mut h, Foundation);
        h.world.fail_probes(Foundation, "environment", usize::MAX);

        let err = h
            .reconciler
            .classify(
                &logctx.log,
                &h.graph,
                phase_spec(Foundation),
                &h.profile,
                &h.store,
                &Default::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ReconcileError::ProbeEscalated { phase: Foundation, .. }
        ));
        assert!(
            h.world.probe_count(Foundation, "environment") >= 2,
            "probe failures must be retried before escalating"
        );
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn probe_failures_inside_the_window_recover() {
        let logctx =
            test_setup_log("probe_failures_inside_the_window_recover");
        let mut h =
            harness(&logctx.log, test_profile("t", 1, 0, &[])).await;
        h.reconciler = Reconciler::new(h.world.probe())
            .with_probe_policy(tight_probe_policy());
        settle(&mut h, Foundation);
        h.world.fail_probes(Foundation, "environment", 2);

        let plan =
            classify(&h, &logctx.log, Foundation, Default::default()).await;
        assert_eq!(plan.decision, Decision::Skip);
        assert_eq!(h.world.probe_count(Foundation, "environment"), 3);
        logctx.cleanup_successful();
    }
}
