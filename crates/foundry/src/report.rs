//! Workflow result reporting.

use serde::Serialize;

use crate::machine::MachineState;

/// Classification of one machine's run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "result")]
pub enum ReportOutcome {
    /// All requested stages completed.
    Completed {
        /// Final observed state; absent when the machine was deleted or
        /// no state was ever read.
        final_state: Option<MachineState>,
    },
    /// A stage failed; the rest of the pipeline was not attempted.
    Failed { stage: String, cause: String },
    /// The machine was never processed.
    Skipped { reason: String },
}

/// Per-machine entry in the final summary.
#[derive(Debug, Clone, Serialize)]
pub struct MachineReport {
    pub hostname: String,
    /// Absent when the machine was never resolved or was deleted.
    pub system_id: Option<String>,
    #[serde(flatten)]
    pub outcome: ReportOutcome,
}

/// Final tally for a workflow run.
///
/// Reports appear in configuration order, every configured machine
/// exactly once.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub reports: Vec<MachineReport>,
}

impl WorkflowSummary {
    /// Build the tally from ordered per-machine reports.
    #[must_use]
    pub fn from_reports(reports: Vec<MachineReport>) -> Self {
        let succeeded = reports
            .iter()
            .filter(|r| matches!(r.outcome, ReportOutcome::Completed { .. }))
            .count();
        let failed = reports
            .iter()
            .filter(|r| matches!(r.outcome, ReportOutcome::Failed { .. }))
            .count();

        Self {
            total: reports.len(),
            succeeded,
            failed,
            reports,
        }
    }

    /// Whether every configured machine completed.
    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.succeeded == self.total
    }

    /// System ids of machines that completed, in input order. Machines
    /// that were deleted completed without an id and are not listed.
    #[must_use]
    pub fn system_ids(&self) -> Vec<&str> {
        self.reports
            .iter()
            .filter(|r| matches!(r.outcome, ReportOutcome::Completed { .. }))
            .filter_map(|r| r.system_id.as_deref())
            .collect()
    }

    /// Print the summary table to stdout.
    pub fn print(&self) {
        println!("\n{}", "=".repeat(72));
        println!("WORKFLOW SUMMARY");
        println!("{}", "=".repeat(72));
        println!(
            "Machines: {}   Succeeded: {}   Failed: {}",
            self.total, self.succeeded, self.failed
        );
        println!();
        println!(
            "{:<20} {:<12} {:<10} {}",
            "HOSTNAME", "SYSTEM_ID", "RESULT", "DETAIL"
        );
        println!("{}", "-".repeat(72));

        for report in &self.reports {
            let system_id = report.system_id.as_deref().unwrap_or("-");
            let (result, detail) = match &report.outcome {
                ReportOutcome::Completed { final_state } => (
                    "ok",
                    final_state.map_or_else(String::new, |s| s.to_string()),
                ),
                ReportOutcome::Failed { stage, cause } => ("failed", format!("{stage}: {cause}")),
                ReportOutcome::Skipped { reason } => ("skipped", reason.clone()),
            };
            println!(
                "{:<20} {:<12} {:<10} {}",
                report.hostname, system_id, result, detail
            );
        }
        println!("{}", "=".repeat(72));
    }
}
