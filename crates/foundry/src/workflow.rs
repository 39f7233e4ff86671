//! Fleet-level workflow orchestration.
//!
//! The engine fans one [`MachinePipeline`] out per configured machine,
//! sequentially or concurrently, and folds the results into a summary.
//! Failure domains are strictly per machine: nothing a pipeline does can
//! abort its siblings or the engine itself.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::client::ProvisionClient;
use crate::config::WorkflowConfig;
use crate::pipeline::{MachinePipeline, PipelineOutcome, SharedConfig};
use crate::report::{MachineReport, ReportOutcome, WorkflowSummary};

/// How to classify machines the engine has no result for.
#[derive(Clone, Copy)]
enum MissingResult {
    Failed,
    Skipped,
}

/// Top-level orchestrator for one workflow run.
pub struct WorkflowEngine {
    client: Arc<dyn ProvisionClient>,
    config: WorkflowConfig,
    shutdown: watch::Receiver<bool>,
}

impl WorkflowEngine {
    #[must_use]
    pub fn new(
        client: Arc<dyn ProvisionClient>,
        config: WorkflowConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            client,
            config,
            shutdown,
        }
    }

    /// Run every configured machine through the pipeline and summarize.
    ///
    /// The summary reports every configured machine exactly once, in
    /// input order, regardless of completion order.
    pub async fn run(&self) -> WorkflowSummary {
        let shared = Arc::new(SharedConfig::from_workflow(&self.config));
        let total = self.config.machines.len();

        info!(
            machines = total,
            actions = %self.config.actions.describe(),
            concurrent = self.config.run_concurrently(),
            "Starting workflow"
        );

        if self.config.run_concurrently() {
            let outcomes = self.run_concurrent(&shared).await;
            // Anything uncollected hit the collection timeout or a task
            // failure: per machine, that is a failure, not a skip.
            self.summarize(outcomes, MissingResult::Failed)
        } else {
            let outcomes = self.run_sequential(&shared).await;
            self.summarize(outcomes, MissingResult::Skipped)
        }
    }

    /// Process machines strictly one at a time. One machine's failure is
    /// recorded and the loop moves on.
    async fn run_sequential(
        &self,
        shared: &Arc<SharedConfig>,
    ) -> HashMap<usize, PipelineOutcome> {
        let mut outcomes = HashMap::new();

        for (index, cfg) in self.config.machines.iter().enumerate() {
            if *self.shutdown.borrow() {
                warn!(machine = %cfg.display_name(), "Interrupted, skipping remaining machines");
                break;
            }

            info!(
                machine = %cfg.display_name(),
                position = %format!("{}/{}", index + 1, self.config.machines.len()),
                "Processing machine"
            );

            let pipeline = MachinePipeline::new(
                Arc::clone(&self.client),
                Arc::clone(shared),
                cfg.clone(),
                self.shutdown.clone(),
            );
            let outcome = pipeline.run().await;
            if let PipelineOutcome::Failed { stage, error, .. } = &outcome {
                error!(machine = %cfg.display_name(), stage = %stage,
                    "Machine failed, continuing with the rest: {error}");
            }
            outcomes.insert(index, outcome);
        }

        outcomes
    }

    /// Process all machines at once, one task per machine.
    ///
    /// Each result collection is bounded by the configured per-machine
    /// timeout; a machine that does not report in time is marked failed
    /// without cancelling its in-flight remote operations.
    async fn run_concurrent(
        &self,
        shared: &Arc<SharedConfig>,
    ) -> HashMap<usize, PipelineOutcome> {
        let mut tasks: JoinSet<(usize, PipelineOutcome)> = JoinSet::new();

        for (index, cfg) in self.config.machines.iter().enumerate() {
            let pipeline = MachinePipeline::new(
                Arc::clone(&self.client),
                Arc::clone(shared),
                cfg.clone(),
                self.shutdown.clone(),
            );
            tasks.spawn(async move { (index, pipeline.run().await) });
        }

        let collect_timeout = Duration::from_secs(self.config.collect_timeout_secs);
        let mut outcomes = HashMap::new();

        loop {
            match tokio::time::timeout(collect_timeout, tasks.join_next()).await {
                Ok(Some(Ok((index, outcome)))) => {
                    outcomes.insert(index, outcome);
                }
                Ok(Some(Err(join_error))) => {
                    // A panicking pipeline is a bug, but it must not take
                    // the batch down. The machine shows up as uncollected.
                    error!("Pipeline task failed to join: {join_error}");
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        timeout_secs = collect_timeout.as_secs(),
                        pending = tasks.len(),
                        "Result collection timed out; reporting remaining machines as failed"
                    );
                    tasks.abort_all();
                    break;
                }
            }
        }

        outcomes
    }

    /// Fold per-machine outcomes into the deterministic summary.
    fn summarize(
        &self,
        mut outcomes: HashMap<usize, PipelineOutcome>,
        missing: MissingResult,
    ) -> WorkflowSummary {
        let mut reports = Vec::with_capacity(self.config.machines.len());

        for (index, cfg) in self.config.machines.iter().enumerate() {
            let outcome = match outcomes.remove(&index) {
                Some(PipelineOutcome::Completed {
                    system_id,
                    final_state,
                }) => MachineReport {
                    hostname: cfg.display_name(),
                    system_id,
                    outcome: ReportOutcome::Completed { final_state },
                },
                Some(PipelineOutcome::Failed {
                    stage,
                    system_id,
                    error,
                }) => MachineReport {
                    hostname: cfg.display_name(),
                    system_id,
                    outcome: ReportOutcome::Failed {
                        stage: stage.to_string(),
                        cause: error.to_string(),
                    },
                },
                None => MachineReport {
                    hostname: cfg.display_name(),
                    system_id: None,
                    outcome: match missing {
                        MissingResult::Failed => ReportOutcome::Failed {
                            stage: "collect".to_string(),
                            cause: "result not collected within the per-machine timeout"
                                .to_string(),
                        },
                        MissingResult::Skipped => ReportOutcome::Skipped {
                            reason: "interrupted before this machine started".to_string(),
                        },
                    },
                },
            };
            reports.push(outcome);
        }

        WorkflowSummary::from_reports(reports)
    }
}
