//! Per-machine lifecycle pipeline.
//!
//! One pipeline drives one machine through the subset of the fixed
//! lifecycle implied by the requested actions: locate/create, hostname,
//! power, BIOS metadata, boot order, storage layout, commissioning,
//! network bonds, deployment, release, deletion. Stage order is fixed
//! regardless of the order actions were requested in; unrequested stages
//! are skipped. The pipeline never propagates machine-specific errors:
//! every failure is captured in the returned [`PipelineOutcome`].

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::client::{
    ClientError, CommissionOpts, CreateMachineSpec, DeployOpts, MachineLookup, MachineUpdate,
    ProvisionClient, ReleaseOpts,
};
use crate::config::{
    Action, ActionSet, BiosConfig, MachineConfig, ReleaseConfig, StorageConfig, WorkflowConfig,
};
use crate::machine::{self, MachineRecord, MachineState};
use crate::network::{self, BondError};
use crate::poll::{self, PollError, PollSpec};
use crate::retry::{with_retry, RetryPolicy};
use crate::storage::{self, StorageError};

/// Poll cadence while waiting for commissioning.
const COMMISSION_POLL_INTERVAL: Duration = Duration::from_secs(10);
/// Poll cadence while waiting for deployment.
const DEPLOY_POLL_INTERVAL: Duration = Duration::from_secs(15);
/// Poll cadence while waiting for release.
const RELEASE_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Locate,
    Hostname,
    Power,
    Bios,
    BootOrder,
    Storage,
    Commission,
    NetworkBonds,
    Deploy,
    Release,
    Delete,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Locate => "locate",
            Self::Hostname => "set-hostname",
            Self::Power => "set-power",
            Self::Bios => "bios",
            Self::BootOrder => "boot-order",
            Self::Storage => "storage",
            Self::Commission => "commission",
            Self::NetworkBonds => "network-bonds",
            Self::Deploy => "deploy",
            Self::Release => "release",
            Self::Delete => "delete",
        };
        write!(f, "{name}")
    }
}

/// Failure within one pipeline stage.
#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Poll(#[from] PollError),

    #[error(transparent)]
    Bond(#[from] BondError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The configuration cannot drive this stage.
    #[error("{0}")]
    Invalid(String),
}

/// Per-machine, per-run mutable state. Never shared across machines.
#[derive(Debug, Default)]
pub struct PipelineContext {
    /// The machine record once stage 1 resolved it.
    pub machine: Option<MachineRecord>,
    /// Last state observed by a poll or refresh.
    pub final_state: Option<MachineState>,
    /// Set by the delete stage: the identity is gone.
    pub deleted: bool,
}

impl PipelineContext {
    fn system_id(&self) -> Option<String> {
        if self.deleted {
            None
        } else {
            self.machine.as_ref().map(|m| m.system_id.clone())
        }
    }
}

/// Result of one pipeline run.
#[derive(Debug)]
pub enum PipelineOutcome {
    /// All requested stages completed. `system_id` is absent when the
    /// machine was deliberately deleted (processed but removed).
    Completed {
        system_id: Option<String>,
        final_state: Option<MachineState>,
    },
    /// A stage failed; later stages were not attempted.
    Failed {
        stage: Stage,
        system_id: Option<String>,
        error: StageError,
    },
}

impl PipelineOutcome {
    /// System id of the processed machine, when it still exists.
    #[must_use]
    pub fn system_id(&self) -> Option<&str> {
        match self {
            Self::Completed { system_id, .. } | Self::Failed { system_id, .. } => {
                system_id.as_deref()
            }
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

/// Configuration shared by every machine in a workflow run.
#[derive(Debug, Clone)]
pub struct SharedConfig {
    pub actions: ActionSet,
    pub storage: StorageConfig,
    pub bios: BiosConfig,
    pub boot_order: Vec<String>,
    pub release: ReleaseConfig,
    pub retry: RetryPolicy,
}

impl SharedConfig {
    /// Extract the shared sections from a workflow configuration.
    #[must_use]
    pub fn from_workflow(config: &WorkflowConfig) -> Self {
        Self {
            actions: config.actions.clone(),
            storage: config.storage.clone(),
            bios: config.bios.clone(),
            boot_order: config.boot_order.clone(),
            release: config.release.clone(),
            retry: RetryPolicy::with_max_attempts(config.max_retries),
        }
    }
}

/// Drives one machine through the requested lifecycle stages.
pub struct MachinePipeline {
    client: Arc<dyn ProvisionClient>,
    shared: Arc<SharedConfig>,
    cfg: MachineConfig,
    shutdown: watch::Receiver<bool>,
}

impl MachinePipeline {
    #[must_use]
    pub fn new(
        client: Arc<dyn ProvisionClient>,
        shared: Arc<SharedConfig>,
        cfg: MachineConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            client,
            shared,
            cfg,
            shutdown,
        }
    }

    fn wants(&self, action: Action) -> bool {
        self.shared.actions.contains(action)
    }

    /// Run the pipeline to completion or first fatal stage failure.
    pub async fn run(self) -> PipelineOutcome {
        let name = self.cfg.display_name();
        let mut ctx = PipelineContext::default();

        info!(machine = %name, "Starting pipeline");

        if let Err(error) = self.locate(&mut ctx).await {
            warn!(machine = %name, stage = %Stage::Locate, "Stage failed: {error}");
            return PipelineOutcome::Failed {
                stage: Stage::Locate,
                system_id: None,
                error,
            };
        }

        // Infallible after locate: every later stage needs the id.
        let Some(system_id) = ctx.system_id() else {
            return PipelineOutcome::Failed {
                stage: Stage::Locate,
                system_id: None,
                error: StageError::Invalid("machine resolved without a system id".to_string()),
            };
        };

        let stages: [(Stage, bool); 10] = [
            (Stage::Hostname, self.wants(Action::SetHostname)),
            (Stage::Power, self.wants(Action::SetPower)),
            (Stage::Bios, self.wants(Action::SetBios)),
            (Stage::BootOrder, self.wants(Action::SetBootOrder)),
            (Stage::Storage, self.wants(Action::ConfigureStorage)),
            (Stage::Commission, self.wants(Action::Commission)),
            (Stage::NetworkBonds, self.wants(Action::SetNetworkBond)),
            (Stage::Deploy, self.wants(Action::Deploy)),
            (Stage::Release, self.wants(Action::Release)),
            (Stage::Delete, self.wants(Action::Delete)),
        ];

        for (stage, requested) in stages {
            if !requested {
                continue;
            }
            info!(machine = %name, system_id = %system_id, stage = %stage, "Running stage");

            let result = match stage {
                Stage::Hostname => self.set_hostname(&system_id, &mut ctx).await,
                Stage::Power => self.set_power(&system_id).await,
                Stage::Bios => self.apply_bios(&system_id).await,
                Stage::BootOrder => self.set_boot_order(&system_id).await,
                Stage::Storage => self.configure_storage(&system_id).await,
                Stage::Commission => self.commission(&system_id, &mut ctx).await,
                Stage::NetworkBonds => self.configure_bonds(&system_id).await,
                Stage::Deploy => self.deploy(&system_id, &mut ctx).await,
                Stage::Release => self.release(&system_id, &mut ctx).await,
                Stage::Delete => self.delete(&system_id, &mut ctx).await,
                Stage::Locate => unreachable!("locate runs before the stage table"),
            };

            if let Err(error) = result {
                warn!(machine = %name, system_id = %system_id, stage = %stage,
                    "Stage failed: {error}");
                return PipelineOutcome::Failed {
                    stage,
                    system_id: ctx.system_id(),
                    error,
                };
            }
        }

        if !ctx.deleted {
            // Refresh the final state for the summary; best-effort.
            if let Ok(record) = self.client.get_machine(&system_id).await {
                ctx.final_state = Some(record.state);
            }
        }

        info!(machine = %name, "Pipeline complete");
        PipelineOutcome::Completed {
            system_id: ctx.system_id(),
            final_state: ctx.final_state,
        }
    }

    /// Stage 1: locate the machine, creating it when requested.
    ///
    /// Lookup priority is MAC, BMC address, hostname, serial. Creation
    /// only happens when `create_machine` was requested and nothing
    /// matched.
    async fn locate(&self, ctx: &mut PipelineContext) -> Result<(), StageError> {
        let fleet = with_retry(&self.shared.retry, "list machines", || {
            self.client.list_machines()
        })
        .await?;

        if self.wants(Action::CreateMachine) || self.wants(Action::FindMachine) {
            match machine::locate(&fleet, &self.cfg) {
                MachineLookup::Found(record) => {
                    ctx.machine = Some(record);
                    Ok(())
                }
                MachineLookup::NotFound if self.wants(Action::CreateMachine) => {
                    self.create(ctx).await
                }
                MachineLookup::NotFound => Err(StageError::Invalid(format!(
                    "machine {} not found; request create_machine to enlist it",
                    self.cfg.display_name()
                ))),
            }
        } else {
            // Without a locate action the machine must already exist
            // under its configured hostname.
            let hostname = self.cfg.hostname.as_ref().ok_or_else(|| {
                StageError::Invalid(
                    "no create_machine/find_machine action and no hostname to look up".to_string(),
                )
            })?;

            let lookup_cfg = MachineConfig {
                hostname: Some(hostname.clone()),
                ..MachineConfig::default()
            };
            match machine::locate(&fleet, &lookup_cfg) {
                MachineLookup::Found(record) => {
                    ctx.machine = Some(record);
                    Ok(())
                }
                MachineLookup::NotFound => Err(StageError::Invalid(format!(
                    "machine {hostname} not found; request create_machine to enlist it"
                ))),
            }
        }
    }

    async fn create(&self, ctx: &mut PipelineContext) -> Result<(), StageError> {
        if self.cfg.hostname.is_none() && self.cfg.pxe_mac.is_none() {
            return Err(StageError::Invalid(
                "creating a machine needs a hostname or a pxe_mac".to_string(),
            ));
        }

        let spec = CreateMachineSpec {
            hostname: machine::generated_hostname(&self.cfg),
            mac_addresses: self.cfg.pxe_mac.iter().cloned().collect(),
            power_type: self.cfg.power_type.clone(),
            power_parameters: power_parameters(&self.cfg),
        };

        info!(hostname = %spec.hostname, "Machine not found, enlisting");
        let record = with_retry(&self.shared.retry, "create machine", || {
            self.client.create_machine(spec.clone())
        })
        .await?;

        info!(system_id = %record.system_id, "Machine enlisted");
        ctx.machine = Some(record);
        Ok(())
    }

    /// Stage 2: rename the machine when the remote hostname differs.
    async fn set_hostname(
        &self,
        system_id: &str,
        ctx: &mut PipelineContext,
    ) -> Result<(), StageError> {
        let Some(ref desired) = self.cfg.hostname else {
            return Ok(());
        };

        let current = ctx
            .machine
            .as_ref()
            .map(|m| m.hostname.clone())
            .unwrap_or_default();
        if current.eq_ignore_ascii_case(desired) {
            info!(system_id = %system_id, hostname = %desired, "Hostname already set");
            return Ok(());
        }

        let update = MachineUpdate {
            hostname: Some(desired.clone()),
            ..MachineUpdate::default()
        };
        let record = with_retry(&self.shared.retry, "set hostname", || {
            self.client.update_machine(system_id, update.clone())
        })
        .await?;

        info!(system_id = %system_id, hostname = %desired, "Hostname updated");
        ctx.machine = Some(record);
        Ok(())
    }

    /// Stage 3: configure power driver and parameters.
    async fn set_power(&self, system_id: &str) -> Result<(), StageError> {
        let update = MachineUpdate {
            power_type: self.cfg.power_type.clone(),
            power_parameters: power_parameters(&self.cfg),
            ..MachineUpdate::default()
        };
        if update.is_empty() {
            info!(system_id = %system_id, "No power configuration to apply");
            return Ok(());
        }

        with_retry(&self.shared.retry, "update power", || {
            self.client.update_machine(system_id, update.clone())
        })
        .await?;

        info!(system_id = %system_id, "Power configuration updated");
        Ok(())
    }

    /// Stage 4: store BIOS/vendor metadata. Best-effort: a rejection is
    /// logged and the pipeline continues.
    async fn apply_bios(&self, system_id: &str) -> Result<(), StageError> {
        if self.shared.bios.is_empty() {
            return Ok(());
        }

        let update = MachineUpdate {
            tag_names: self.shared.bios.tags.clone(),
            description: self.shared.bios.notes.clone(),
            ..MachineUpdate::default()
        };

        match with_retry(&self.shared.retry, "apply bios metadata", || {
            self.client.update_machine(system_id, update.clone())
        })
        .await
        {
            Ok(_) => info!(system_id = %system_id, "BIOS metadata stored"),
            Err(e) => {
                warn!(system_id = %system_id, "BIOS metadata rejected, continuing: {e}");
            }
        }
        Ok(())
    }

    /// Stage 5: set boot device order. Best-effort: the remote may not
    /// support it.
    async fn set_boot_order(&self, system_id: &str) -> Result<(), StageError> {
        if self.shared.boot_order.is_empty() {
            return Ok(());
        }

        match with_retry(&self.shared.retry, "set boot order", || {
            self.client.set_boot_order(system_id, &self.shared.boot_order)
        })
        .await
        {
            Ok(()) => {
                info!(system_id = %system_id, order = %self.shared.boot_order.join(","),
                    "Boot order set");
            }
            Err(e) => {
                warn!(system_id = %system_id, "Boot order not supported, continuing: {e}");
            }
        }
        Ok(())
    }

    /// Stage 6: upload the storage layout. Must succeed.
    async fn configure_storage(&self, system_id: &str) -> Result<(), StageError> {
        let device = match self.shared.storage.device.clone() {
            Some(device) => device,
            None => {
                let devices = with_retry(&self.shared.retry, "list block devices", || {
                    self.client.list_block_devices(system_id)
                })
                .await?;
                storage::choose_device(&devices).ok_or_else(|| StorageError::NoDevice {
                    system_id: system_id.to_string(),
                })?
            }
        };

        let curtin = storage::render_curtin(&device, &self.shared.storage.params)?;
        with_retry(&self.shared.retry, "upload storage config", || {
            self.client.set_storage_config(system_id, &curtin)
        })
        .await?;

        info!(system_id = %system_id, device = %device, "Storage layout configured");
        Ok(())
    }

    /// Stage 7: commission and wait for READY (or DEPLOYED).
    async fn commission(
        &self,
        system_id: &str,
        ctx: &mut PipelineContext,
    ) -> Result<(), StageError> {
        let opts = CommissionOpts {
            commissioning_scripts: self.cfg.commissioning_scripts.clone(),
            ..CommissionOpts::default()
        };
        with_retry(&self.shared.retry, "commission", || {
            self.client.commission(system_id, opts.clone())
        })
        .await?;
        info!(system_id = %system_id, "Commissioning started");

        if !self.cfg.wait_commissioning {
            return Ok(());
        }

        let spec = PollSpec::new(
            vec![MachineState::Ready, MachineState::Deployed],
            vec![MachineState::FailedCommissioning, MachineState::Failed],
            Duration::from_secs(self.cfg.commission_timeout_secs),
            COMMISSION_POLL_INTERVAL,
        );
        let state = self.wait(system_id, &spec).await?;
        ctx.final_state = Some(state);
        info!(system_id = %system_id, state = %state, "Commissioning complete");
        Ok(())
    }

    /// Stage 8: create the configured bonds. A failed bond aborts the
    /// stage; bonds already created remain.
    async fn configure_bonds(&self, system_id: &str) -> Result<(), StageError> {
        for bond in &self.cfg.bonds {
            network::configure_bond(&self.client, system_id, bond, &self.shared.retry).await?;
        }
        Ok(())
    }

    /// Stage 9: deploy and wait for DEPLOYED.
    async fn deploy(&self, system_id: &str, ctx: &mut PipelineContext) -> Result<(), StageError> {
        let opts = DeployOpts {
            distro_series: self.cfg.distro_series.clone(),
            user_data: self.cfg.cloud_init.clone(),
        };
        with_retry(&self.shared.retry, "deploy", || {
            self.client.deploy(system_id, opts.clone())
        })
        .await?;
        info!(system_id = %system_id, "Deployment started");

        if !self.cfg.wait_deployment {
            return Ok(());
        }

        let spec = PollSpec::new(
            vec![MachineState::Deployed],
            vec![MachineState::FailedDeployment, MachineState::Failed],
            Duration::from_secs(self.cfg.deploy_timeout_secs),
            DEPLOY_POLL_INTERVAL,
        );
        let state = self.wait(system_id, &spec).await?;
        ctx.final_state = Some(state);
        info!(system_id = %system_id, state = %state, "Deployment complete");
        Ok(())
    }

    /// Stage 10: release and wait for READY.
    async fn release(&self, system_id: &str, ctx: &mut PipelineContext) -> Result<(), StageError> {
        let opts = ReleaseOpts {
            erase: self.shared.release.wipe_disks,
        };
        with_retry(&self.shared.retry, "release", || {
            self.client.release(system_id, opts.clone())
        })
        .await?;
        info!(system_id = %system_id, erase = opts.erase, "Release started");

        if !self.shared.release.wait_release {
            return Ok(());
        }

        let spec = PollSpec::new(
            vec![MachineState::Ready],
            vec![
                MachineState::FailedReleasing,
                MachineState::FailedDiskErasing,
                MachineState::Failed,
            ],
            Duration::from_secs(self.shared.release.release_timeout_secs),
            RELEASE_POLL_INTERVAL,
        );
        let state = self.wait(system_id, &spec).await?;
        ctx.final_state = Some(state);
        info!(system_id = %system_id, state = %state, "Release complete");
        Ok(())
    }

    /// Stage 11: delete the machine. Terminal: the identity is gone.
    async fn delete(&self, system_id: &str, ctx: &mut PipelineContext) -> Result<(), StageError> {
        with_retry(&self.shared.retry, "delete machine", || {
            self.client.delete_machine(system_id)
        })
        .await?;

        info!(system_id = %system_id, "Machine deleted");
        ctx.deleted = true;
        ctx.final_state = None;
        Ok(())
    }

    /// Poll the machine state against `spec`.
    async fn wait(&self, system_id: &str, spec: &PollSpec) -> Result<MachineState, PollError> {
        poll::wait_for_state(spec, self.shutdown.clone(), || async {
            self.client.get_machine(system_id).await.map(|m| m.state)
        })
        .await
    }
}

/// Power parameters from config, with the BMC address folded in when no
/// explicit `power_address` parameter is set.
fn power_parameters(cfg: &MachineConfig) -> std::collections::BTreeMap<String, String> {
    let mut params = cfg.power_parameters.clone();
    if let Some(ref bmc) = cfg.bmc_address {
        params
            .entry("power_address".to_string())
            .or_insert_with(|| bmc.clone());
    }
    params
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_display_names() {
        assert_eq!(Stage::Locate.to_string(), "locate");
        assert_eq!(Stage::NetworkBonds.to_string(), "network-bonds");
        assert_eq!(Stage::BootOrder.to_string(), "boot-order");
    }

    #[test]
    fn test_power_parameters_fold_in_bmc_address() {
        let cfg = MachineConfig {
            bmc_address: Some("10.0.9.7".to_string()),
            power_type: Some("ipmi".to_string()),
            ..MachineConfig::default()
        };
        let params = power_parameters(&cfg);
        assert_eq!(params.get("power_address").map(String::as_str), Some("10.0.9.7"));
    }

    #[test]
    fn test_explicit_power_address_wins_over_bmc() {
        let mut cfg = MachineConfig {
            bmc_address: Some("10.0.9.7".to_string()),
            ..MachineConfig::default()
        };
        cfg.power_parameters
            .insert("power_address".to_string(), "10.0.9.99".to_string());

        let params = power_parameters(&cfg);
        assert_eq!(params.get("power_address").map(String::as_str), Some("10.0.9.99"));
    }
}
