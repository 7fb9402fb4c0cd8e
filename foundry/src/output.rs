// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Human-oriented rendering of plans, status, and run reports.

use chrono::SecondsFormat;
use foundry_orchestrator::driver::StatusReport;
use foundry_orchestrator::reconcile::{Decision, PhasePlan, ResourceWork};
use foundry_orchestrator::report::RunReport;
use tabled::Tabled;

fn print_table<T: Tabled>(rows: Vec<T>) {
    let table = tabled::Table::new(rows)
        .with(tabled::settings::Style::empty())
        .with(tabled::settings::Padding::new(0, 1, 0, 0))
        .to_string();
    println!("{}", table);
}

fn work_columns(work: &ResourceWork) -> (&'static str, String) {
    match work {
        ResourceWork::UpToDate => ("up-to-date", String::new()),
        ResourceWork::Create => ("create", String::new()),
        ResourceWork::Repair { reason } => ("repair", reason.clone()),
        ResourceWork::Retire => {
            ("retire", "no longer in the profile".to_string())
        }
    }
}

/// Renders a dry run: what each phase would do and why.
pub fn print_plans(plans: &[PhasePlan]) {
    #[derive(Tabled)]
    #[tabled(rename_all = "SCREAMING_SNAKE_CASE")]
    struct PlanRow {
        phase: String,
        resource: String,
        action: &'static str,
        reason: String,
    }

    let mut rows = Vec::new();
    for plan in plans {
        if let Decision::Abort { reason } = &plan.decision {
            rows.push(PlanRow {
                phase: plan.phase.to_string(),
                resource: "-".to_string(),
                action: "abort",
                reason: reason.clone(),
            });
            continue;
        }
        for resource in &plan.resources {
            let (action, reason) = work_columns(&resource.work);
            rows.push(PlanRow {
                phase: plan.phase.to_string(),
                resource: resource.key.clone(),
                action,
                reason,
            });
        }
    }
    print_table(rows);
}

/// Renders `status`: stored records joined with a live classification.
pub fn print_status(status: &StatusReport) {
    #[derive(Tabled)]
    #[tabled(rename_all = "SCREAMING_SNAKE_CASE")]
    struct StatusRow {
        phase: String,
        resource: String,
        recorded: String,
        needs: &'static str,
        updated: String,
    }

    println!("deployment status for profile {:?}", status.profile);
    let mut rows = Vec::new();
    for phase in &status.phases {
        for resource in &phase.resources {
            let (needs, _) = work_columns(&resource.work);
            rows.push(StatusRow {
                phase: phase.phase.to_string(),
                resource: resource.key.clone(),
                recorded: match resource.stored_status {
                    Some(status) => status.to_string(),
                    None => "not deployed".to_string(),
                },
                needs,
                updated: match resource.last_updated {
                    Some(when) => {
                        when.to_rfc3339_opts(SecondsFormat::Secs, true)
                    }
                    None => "never".to_string(),
                },
            });
        }
    }
    print_table(rows);
}

/// Renders what a run or teardown did, failures last.
pub fn print_report(report: &RunReport) {
    #[derive(Tabled)]
    #[tabled(rename_all = "SCREAMING_SNAKE_CASE")]
    struct ReportRow {
        phase: String,
        result: &'static str,
        time: String,
    }

    let rows = report
        .phases
        .iter()
        .map(|phase| ReportRow {
            phase: phase.phase.to_string(),
            result: phase.disposition.as_str(),
            time: format_ms(phase.duration_ms),
        })
        .collect();
    print_table(rows);

    let mut failures = report
        .phases
        .iter()
        .flat_map(|phase| {
            phase.resources.iter().filter_map(move |resource| {
                resource.error.as_ref().map(|error| {
                    (phase.phase, resource.key.as_str(), error.as_str())
                })
            })
        })
        .peekable();
    if failures.peek().is_some() {
        println!("failed resources:");
        for (phase, key, error) in failures {
            println!("  {phase}/{key}: {error}");
        }
    }

    let verdict = if report.all_succeeded() { "ok" } else { "FAILED" };
    println!(
        "run {} against profile {:?}: {} ({})",
        report.run_id,
        report.profile,
        verdict,
        format_ms(
            (report.finished_at - report.started_at).num_milliseconds().max(0)
                as u64
        ),
    );
}

fn format_ms(ms: u64) -> String {
    if ms >= 60_000 {
        format!("{}m{:02}s", ms / 60_000, (ms % 60_000) / 1000)
    } else {
        format!("{}.{}s", ms / 1000, (ms % 1000) / 100)
    }
}
