// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The run report: what one invocation did and how it went.
//!
//! The report is ephemeral output, not state; classification never reads
//! it.  A copy of the most recent report is kept in the state directory
//! as `last-run.json` for operators and tooling.

use camino::Utf8Path;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::phases::PhaseId;

pub const LAST_RUN_FILENAME: &str = "last-run.json";

/// Final disposition of a phase or one of its resources.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Disposition {
    /// Already satisfied; nothing executed.
    Skipped,
    Created,
    Repaired,
    Destroyed,
    Failed,
    /// Never attempted: blocked by an earlier failure or by
    /// cancellation.
    Aborted,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Skipped => "skipped",
            Disposition::Created => "created",
            Disposition::Repaired => "repaired",
            Disposition::Destroyed => "destroyed",
            Disposition::Failed => "failed",
            Disposition::Aborted => "aborted",
        }
    }

    pub fn is_success(&self) -> bool {
        match self {
            Disposition::Skipped
            | Disposition::Created
            | Disposition::Repaired
            | Disposition::Destroyed => true,
            Disposition::Failed | Disposition::Aborted => false,
        }
    }
}

impl std::fmt::Display for Disposition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ResourceOutcome {
    pub key: String,
    pub disposition: Disposition,
    pub attempts: usize,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct PhaseOutcome {
    pub phase: PhaseId,
    pub disposition: Disposition,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<ResourceOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Ordered per-phase outcomes of one invocation.
#[derive(Clone, Debug, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub profile: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub phases: Vec<PhaseOutcome>,
}

impl RunReport {
    pub fn new(profile: &str) -> RunReport {
        let now = Utc::now();
        RunReport {
            run_id: Uuid::new_v4(),
            profile: profile.to_string(),
            started_at: now,
            finished_at: now,
            phases: Vec::new(),
        }
    }

    pub fn push(&mut self, outcome: PhaseOutcome) {
        self.phases.push(outcome);
    }

    pub fn finish(&mut self) {
        self.finished_at = Utc::now();
    }

    pub fn phase(&self, id: PhaseId) -> Option<&PhaseOutcome> {
        self.phases.iter().find(|p| p.phase == id)
    }

    /// True when no phase failed or was left unattempted.
    pub fn all_succeeded(&self) -> bool {
        self.phases.iter().all(|p| p.disposition.is_success())
    }

    /// Writes the report to `<dir>/last-run.json`.
    pub async fn persist(&self, dir: &Utf8Path) -> std::io::Result<()> {
        let json = serde_json::to_vec_pretty(self)
            .map_err(std::io::Error::other)?;
        tokio::fs::write(dir.join(LAST_RUN_FILENAME), json).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::Utf8TempDir;

    #[test]
    fn success_covers_everything_but_failed_and_aborted() {
        for disposition in [
            Disposition::Skipped,
            Disposition::Created,
            Disposition::Repaired,
            Disposition::Destroyed,
        ] {
            assert!(disposition.is_success(), "{disposition}");
        }
        assert!(!Disposition::Failed.is_success());
        assert!(!Disposition::Aborted.is_success());
    }

    #[tokio::test]
    async fn report_persists_as_json() {
        let dir = Utf8TempDir::new().unwrap();
        let mut report = RunReport::new("single-node");
        report.push(PhaseOutcome {
            phase: PhaseId::Foundation,
            disposition: Disposition::Created,
            duration_ms: 42,
            resources: vec![ResourceOutcome {
                key: "environment".to_string(),
                disposition: Disposition::Created,
                attempts: 1,
                duration_ms: 42,
                error: None,
            }],
            error: None,
        });
        report.finish();
        report.persist(dir.path()).await.unwrap();

        let raw =
            std::fs::read(dir.path().join(LAST_RUN_FILENAME)).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(value["profile"], "single-node");
        assert_eq!(value["phases"][0]["phase"], "foundation");
        assert_eq!(value["phases"][0]["disposition"], "created");
        assert!(report.all_succeeded());
    }
}
