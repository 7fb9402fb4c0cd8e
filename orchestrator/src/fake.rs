// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Test doubles: an in-memory "external world" with a scriptable
//! provisioner and probe on top of it.
//!
//! Create and repair mark a resource present; destroy removes it; the
//! probe reports what the world currently holds.  Tests inject drift,
//! failures, delays, and probe errors, then assert on the recorded
//! action log.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use slog::Logger;

use crate::phases::PhaseId;
use crate::probe::{Probe, ProbeError, ProbeOutcome};
use crate::provision::{
    Action, ActionKind, ActionResult, Provisioner, ProvisionerError,
};

type Key = (PhaseId, String);

struct FailureScript {
    remaining: usize,
    transient: bool,
    detail: String,
}

#[derive(Default)]
struct WorldState {
    present: BTreeSet<Key>,
    drifted: BTreeMap<Key, String>,
    /// `"<action-name> <resource>"` lines in invocation order; probes are
    /// not recorded here.
    action_log: Vec<String>,
    probe_counts: BTreeMap<Key, usize>,
    failures: BTreeMap<String, FailureScript>,
    delays: BTreeMap<String, Duration>,
    probe_errors: BTreeMap<Key, usize>,
    ghosts: BTreeSet<String>,
}

pub struct FakeWorld {
    inner: Mutex<WorldState>,
}

impl FakeWorld {
    pub fn new() -> Arc<FakeWorld> {
        Arc::new(FakeWorld { inner: Mutex::new(WorldState::default()) })
    }

    pub fn provisioner(self: &Arc<Self>) -> Arc<FakeProvisioner> {
        Arc::new(FakeProvisioner { world: self.clone() })
    }

    pub fn probe(self: &Arc<Self>) -> Arc<FakeProbe> {
        Arc::new(FakeProbe { world: self.clone() })
    }

    pub fn set_present(&self, phase: PhaseId, key: &str) {
        self.inner.lock().unwrap().present.insert((phase, key.to_string()));
    }

    pub fn set_drifted(&self, phase: PhaseId, key: &str, detail: &str) {
        let mut world = self.inner.lock().unwrap();
        world.present.insert((phase, key.to_string()));
        world.drifted.insert((phase, key.to_string()), detail.to_string());
    }

    /// Scripts the next `times` invocations of `line` (an action log
    /// line, e.g. `"infrastructure-create worker-02"`) to fail.
    pub fn fail_action(
        &self,
        line: &str,
        times: usize,
        transient: bool,
        detail: &str,
    ) {
        self.inner.lock().unwrap().failures.insert(
            line.to_string(),
            FailureScript {
                remaining: times,
                transient,
                detail: detail.to_string(),
            },
        );
    }

    pub fn clear_failures(&self) {
        self.inner.lock().unwrap().failures.clear();
    }

    /// Makes `line` sleep before completing, for cancellation tests.
    pub fn delay_action(&self, line: &str, delay: Duration) {
        self.inner.lock().unwrap().delays.insert(line.to_string(), delay);
    }

    /// Makes `line` report success without actually changing the world,
    /// like a provisioner whose work silently did not take.
    pub fn ghost_action(&self, line: &str) {
        self.inner.lock().unwrap().ghosts.insert(line.to_string());
    }

    /// Scripts the next `times` probes of a resource to fail.
    pub fn fail_probes(&self, phase: PhaseId, key: &str, times: usize) {
        self.inner
            .lock()
            .unwrap()
            .probe_errors
            .insert((phase, key.to_string()), times);
    }

    pub fn is_present(&self, phase: PhaseId, key: &str) -> bool {
        self.inner
            .lock()
            .unwrap()
            .present
            .contains(&(phase, key.to_string()))
    }

    pub fn action_log(&self) -> Vec<String> {
        self.inner.lock().unwrap().action_log.clone()
    }

    /// How many logged actions start with `prefix`.
    pub fn actions_matching(&self, prefix: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .action_log
            .iter()
            .filter(|line| line.starts_with(prefix))
            .count()
    }

    pub fn probe_count(&self, phase: PhaseId, key: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .probe_counts
            .get(&(phase, key.to_string()))
            .copied()
            .unwrap_or(0)
    }
}

pub struct FakeProvisioner {
    world: Arc<FakeWorld>,
}

#[async_trait]
impl Provisioner for FakeProvisioner {
    async fn invoke(
        &self,
        _log: &Logger,
        action: &Action,
    ) -> Result<ActionResult, ProvisionerError> {
        let line = format!("{} {}", action.name(), action.resource);
        let delay =
            self.world.inner.lock().unwrap().delays.get(&line).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut world = self.world.inner.lock().unwrap();
        world.action_log.push(line.clone());
        if let Some(script) = world.failures.get_mut(&line) {
            if script.remaining > 0 {
                script.remaining -= 1;
                return Ok(ActionResult {
                    ok: false,
                    detail: script.detail.clone(),
                    transient: script.transient,
                    resource_id: None,
                });
            }
        }

        let key = (action.phase, action.resource.clone());
        let ghost = world.ghosts.contains(&line);
        match action.kind {
            ActionKind::Create | ActionKind::Repair => {
                if !ghost {
                    world.present.insert(key.clone());
                    world.drifted.remove(&key);
                }
                Ok(ActionResult {
                    ok: true,
                    detail: "done".to_string(),
                    transient: false,
                    resource_id: Some(format!("ext-{}", action.resource)),
                })
            }
            ActionKind::Destroy => {
                if !ghost {
                    world.present.remove(&key);
                    world.drifted.remove(&key);
                }
                Ok(ActionResult {
                    ok: true,
                    detail: "gone".to_string(),
                    transient: false,
                    resource_id: None,
                })
            }
            ActionKind::Probe => {
                panic!("probe actions belong to the Probe trait")
            }
        }
    }
}

pub struct FakeProbe {
    world: Arc<FakeWorld>,
}

#[async_trait]
impl Probe for FakeProbe {
    async fn probe(
        &self,
        _log: &Logger,
        action: &Action,
    ) -> Result<ProbeOutcome, ProbeError> {
        let mut world = self.world.inner.lock().unwrap();
        let key = (action.phase, action.resource.clone());
        *world.probe_counts.entry(key.clone()).or_default() += 1;
        if let Some(remaining) = world.probe_errors.get_mut(&key) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ProbeError {
                    action: action.to_string(),
                    reason: "synthetic probe failure".to_string(),
                });
            }
        }
        if let Some(detail) = world.drifted.get(&key) {
            return Ok(ProbeOutcome::Drifted { detail: detail.clone() });
        }
        if world.present.contains(&key) {
            Ok(ProbeOutcome::Satisfied)
        } else {
            Ok(ProbeOutcome::Missing)
        }
    }
}

/// Upserts a `Satisfied` record, digest current, for every resource
/// `profile` wants under `phase`.
pub fn mark_phase_satisfied(
    store: &mut crate::state::StateStore,
    profile: &crate::config::Profile,
    phase: PhaseId,
) {
    for resource in profile.resources_for(phase) {
        store.upsert(
            phase,
            &resource.key,
            crate::state::ResourceRecord {
                resource_id: None,
                digest: resource.digest(),
                status: crate::state::RecordStatus::Satisfied,
                last_updated: chrono::Utc::now(),
                last_duration_ms: 0,
                detail: None,
            },
        );
    }
}

/// A profile with the standard sizing, `control` + `workers` nodes, and
/// the given platform services.
pub fn test_profile(
    name: &str,
    control: usize,
    workers: usize,
    services: &[&str],
) -> crate::config::Profile {
    let services = services
        .iter()
        .map(|s| format!("{s:?}"))
        .collect::<Vec<_>>()
        .join(", ");
    toml::from_str(&format!(
        r#"
        name = {name:?}

        [provisioner]
        dir = "/nonexistent/hooks"

        [nodes]
        control_count = {control}
        worker_count = {workers}

        [nodes.control_sizing]
        vcpus = 4
        memory_mib = 8192
        disk_gib = 64

        [nodes.worker_sizing]
        vcpus = 6
        memory_mib = 24576
        disk_gib = 128

        [network]
        management_cidr = "192.168.10.0/24"
        control_vip = "192.168.10.5"

        [image]
        source_image = "debian-12-genericcloud-amd64.qcow2"
        workload_version = "1.31"

        [bootstrap]
        pod_cidr = "10.244.0.0/16"

        [platform]
        services = [{services}]
        "#
    ))
    .expect("test profile parses")
}
