//! Workflow configuration surface.
//!
//! Configuration arrives as one JSON document: the fleet, the requested
//! actions, and per-stage settings shared by all machines. Every stage
//! gets a typed struct with explicit optional fields; absence of a value
//! is `None`, never a missing key lookup.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::client::LinkMode;

/// A lifecycle action that can be requested for a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    CreateMachine,
    FindMachine,
    SetHostname,
    SetPower,
    SetBios,
    SetBootOrder,
    ConfigureStorage,
    Commission,
    SetNetworkBond,
    Deploy,
    Release,
    Delete,
    /// Print the machine listing and exit; handled by the CLI, not the
    /// pipeline.
    List,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::CreateMachine => "create_machine",
            Self::FindMachine => "find_machine",
            Self::SetHostname => "set_hostname",
            Self::SetPower => "set_power",
            Self::SetBios => "set_bios",
            Self::SetBootOrder => "set_boot_order",
            Self::ConfigureStorage => "configure_storage",
            Self::Commission => "commission",
            Self::SetNetworkBond => "set_network_bond",
            Self::Deploy => "deploy",
            Self::Release => "release",
            Self::Delete => "delete",
            Self::List => "list",
        };
        write!(f, "{name}")
    }
}

/// The set of requested actions.
///
/// Actions may be requested in any order; the pipeline always executes
/// them in its fixed lifecycle order and skips the rest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "Vec<Action>", into = "Vec<Action>")]
pub struct ActionSet {
    actions: BTreeSet<Action>,
}

impl ActionSet {
    #[must_use]
    pub fn contains(&self, action: Action) -> bool {
        self.actions.contains(&action)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Comma-separated listing for logs and summaries.
    #[must_use]
    pub fn describe(&self) -> String {
        self.actions
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl From<Vec<Action>> for ActionSet {
    fn from(actions: Vec<Action>) -> Self {
        Self {
            actions: actions.into_iter().collect(),
        }
    }
}

impl From<ActionSet> for Vec<Action> {
    fn from(set: ActionSet) -> Self {
        set.actions.into_iter().collect()
    }
}

/// Bond mode on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BondMode {
    #[serde(rename = "802.3ad")]
    Lacp,
    #[serde(rename = "active-backup")]
    ActiveBackup,
    #[serde(rename = "balance-rr")]
    BalanceRr,
    #[serde(rename = "balance-xor")]
    BalanceXor,
    #[serde(rename = "broadcast")]
    Broadcast,
}

impl std::fmt::Display for BondMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Lacp => write!(f, "802.3ad"),
            Self::ActiveBackup => write!(f, "active-backup"),
            Self::BalanceRr => write!(f, "balance-rr"),
            Self::BalanceXor => write!(f, "balance-xor"),
            Self::Broadcast => write!(f, "broadcast"),
        }
    }
}

/// One logical bond to create after commissioning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BondConfig {
    /// Bond interface name (e.g. "bond0").
    pub name: String,
    /// Target VLANs; the first selects the physical members, the rest
    /// become tagged sub-interfaces on the bond.
    pub vlan_ids: Vec<u16>,
    #[serde(default = "default_bond_mode")]
    pub mode: BondMode,
    #[serde(default)]
    pub mtu: Option<u32>,
    /// LACP rate override for 802.3ad bonds.
    #[serde(default)]
    pub lacp_rate: Option<String>,
    /// Transmit hash policy override for 802.3ad bonds.
    #[serde(default)]
    pub xmit_hash_policy: Option<String>,
    /// Subnet (name or CIDR) to link the bond to.
    #[serde(default)]
    pub subnet: Option<String>,
    #[serde(default = "default_link_mode")]
    pub ip_mode: LinkMode,
    #[serde(default)]
    pub ip_address: Option<String>,
}

impl BondConfig {
    /// LACP rate parameter for the bond request, defaulted for 802.3ad.
    #[must_use]
    pub fn lacp_rate_param(&self) -> Option<String> {
        if self.mode == BondMode::Lacp {
            Some(self.lacp_rate.clone().unwrap_or_else(|| "fast".to_string()))
        } else {
            None
        }
    }

    /// Transmit hash policy for the bond request, defaulted for 802.3ad.
    #[must_use]
    pub fn xmit_hash_policy_param(&self) -> Option<String> {
        if self.mode == BondMode::Lacp {
            Some(
                self.xmit_hash_policy
                    .clone()
                    .unwrap_or_else(|| "layer3+4".to_string()),
            )
        } else {
            None
        }
    }
}

fn default_bond_mode() -> BondMode {
    BondMode::Lacp
}

fn default_link_mode() -> LinkMode {
    LinkMode::Auto
}

/// Per-machine configuration fragment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineConfig {
    #[serde(default)]
    pub hostname: Option<String>,
    /// PXE interface MAC address.
    #[serde(default)]
    pub pxe_mac: Option<String>,
    /// Out-of-band management address, used for lookup and power config.
    #[serde(default)]
    pub bmc_address: Option<String>,
    #[serde(default)]
    pub serial: Option<String>,

    #[serde(default)]
    pub power_type: Option<String>,
    #[serde(default)]
    pub power_parameters: BTreeMap<String, String>,

    #[serde(default)]
    pub commissioning_scripts: Vec<String>,
    #[serde(default = "default_true")]
    pub wait_commissioning: bool,
    #[serde(default = "default_commission_timeout")]
    pub commission_timeout_secs: u64,

    #[serde(default)]
    pub distro_series: Option<String>,
    /// Cloud-init user data passed to deployment.
    #[serde(default)]
    pub cloud_init: Option<String>,
    #[serde(default = "default_true")]
    pub wait_deployment: bool,
    #[serde(default = "default_deploy_timeout")]
    pub deploy_timeout_secs: u64,

    #[serde(default)]
    pub bonds: Vec<BondConfig>,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            hostname: None,
            pxe_mac: None,
            bmc_address: None,
            serial: None,
            power_type: None,
            power_parameters: BTreeMap::new(),
            commissioning_scripts: Vec::new(),
            wait_commissioning: true,
            commission_timeout_secs: default_commission_timeout(),
            distro_series: None,
            cloud_init: None,
            wait_deployment: true,
            deploy_timeout_secs: default_deploy_timeout(),
            bonds: Vec::new(),
        }
    }
}

impl MachineConfig {
    /// Human-readable identity for logs and the summary.
    #[must_use]
    pub fn display_name(&self) -> String {
        self.hostname
            .clone()
            .or_else(|| self.pxe_mac.clone())
            .or_else(|| self.bmc_address.clone())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

/// Shared storage layout settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Target device path; auto-selected from block devices when absent.
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default)]
    pub params: StorageParams,
}

/// Volume sizes for the rendered storage layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageParams {
    #[serde(default = "default_efi_mb")]
    pub efi_mb: u32,
    #[serde(default = "default_boot_size")]
    pub boot_size_g: u32,
    #[serde(default = "default_root_size")]
    pub root_size_g: u32,
    #[serde(default = "default_lv_size")]
    pub home_size_g: u32,
    #[serde(default = "default_lv_size")]
    pub var_size_g: u32,
    #[serde(default = "default_lv_size")]
    pub var_log_size_g: u32,
    #[serde(default = "default_lv_size")]
    pub tmp_size_g: u32,
}

impl Default for StorageParams {
    fn default() -> Self {
        Self {
            efi_mb: default_efi_mb(),
            boot_size_g: default_boot_size(),
            root_size_g: default_root_size(),
            home_size_g: default_lv_size(),
            var_size_g: default_lv_size(),
            var_log_size_g: default_lv_size(),
            tmp_size_g: default_lv_size(),
        }
    }
}

/// Shared BIOS/vendor metadata settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BiosConfig {
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl BiosConfig {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty() && self.notes.is_none()
    }
}

/// Shared release settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseConfig {
    #[serde(default = "default_true")]
    pub wipe_disks: bool,
    #[serde(default = "default_true")]
    pub wait_release: bool,
    #[serde(default = "default_release_timeout")]
    pub release_timeout_secs: u64,
}

impl Default for ReleaseConfig {
    fn default() -> Self {
        Self {
            wipe_disks: true,
            wait_release: true,
            release_timeout_secs: default_release_timeout(),
        }
    }
}

/// The complete workflow configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Provisioning service API endpoint.
    pub api_url: String,
    /// API key, `consumer:token:secret`.
    pub api_key: String,

    #[serde(default)]
    pub actions: ActionSet,
    #[serde(default)]
    pub machines: Vec<MachineConfig>,

    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub bios: BiosConfig,
    #[serde(default)]
    pub boot_order: Vec<String>,
    #[serde(default)]
    pub release: ReleaseConfig,

    /// Retry ceiling for remote calls; 0 retries forever.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Process machines concurrently; defaults to true when more than
    /// one machine is configured.
    #[serde(default)]
    pub concurrent: Option<bool>,
    /// Budget for collecting each machine's result in concurrent mode.
    #[serde(default = "default_collect_timeout")]
    pub collect_timeout_secs: u64,
}

/// Configuration validation failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no machines defined in configuration")]
    NoMachines,

    #[error("machine #{index} needs at least one of hostname, pxe_mac, bmc_address or serial")]
    UnidentifiableMachine { index: usize },

    #[error("bond {name}: vlan_ids must not be empty")]
    BondWithoutVlans { name: String },
}

impl WorkflowConfig {
    /// Load and parse a configuration file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file {}", path.display()))?;
        let config: Self =
            serde_json::from_str(&content).context("Invalid JSON in configuration file")?;
        Ok(config)
    }

    /// Check the cross-field invariants the type system cannot express.
    ///
    /// # Errors
    /// Returns the first violated invariant.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.machines.is_empty() {
            return Err(ConfigError::NoMachines);
        }
        for (index, machine) in self.machines.iter().enumerate() {
            if machine.hostname.is_none()
                && machine.pxe_mac.is_none()
                && machine.bmc_address.is_none()
                && machine.serial.is_none()
            {
                return Err(ConfigError::UnidentifiableMachine { index: index + 1 });
            }
            for bond in &machine.bonds {
                if bond.vlan_ids.is_empty() {
                    return Err(ConfigError::BondWithoutVlans {
                        name: bond.name.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Whether the fleet should be processed concurrently.
    #[must_use]
    pub fn run_concurrently(&self) -> bool {
        self.concurrent.unwrap_or(self.machines.len() > 1)
    }
}

fn default_true() -> bool {
    true
}

fn default_commission_timeout() -> u64 {
    1200
}

fn default_deploy_timeout() -> u64 {
    1800
}

fn default_release_timeout() -> u64 {
    1800
}

fn default_max_retries() -> u32 {
    5
}

fn default_collect_timeout() -> u64 {
    3600
}

fn default_efi_mb() -> u32 {
    512
}

fn default_boot_size() -> u32 {
    2
}

fn default_root_size() -> u32 {
    50
}

fn default_lv_size() -> u32 {
    10
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let config: WorkflowConfig = serde_json::from_str(
            r#"{
                "api_url": "http://maas.example:5240/MAAS",
                "api_key": "consumer:token:secret",
                "actions": ["commission", "deploy", "create_machine"],
                "machines": [
                    { "hostname": "node01", "pxe_mac": "aa:bb:cc:dd:ee:01" }
                ]
            }"#,
        )
        .unwrap();

        assert!(config.actions.contains(Action::Commission));
        assert!(config.actions.contains(Action::CreateMachine));
        assert!(!config.actions.contains(Action::Delete));
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.machines[0].commission_timeout_secs, 1200);
        assert_eq!(config.machines[0].deploy_timeout_secs, 1800);
        assert!(config.machines[0].wait_commissioning);
        config.validate().unwrap();
    }

    #[test]
    fn test_concurrency_defaults_to_fleet_size() {
        let mut config: WorkflowConfig = serde_json::from_str(
            r#"{
                "api_url": "http://maas.example:5240/MAAS",
                "api_key": "c:t:s",
                "machines": [{ "hostname": "a" }]
            }"#,
        )
        .unwrap();
        assert!(!config.run_concurrently());

        config.machines.push(MachineConfig {
            hostname: Some("b".to_string()),
            ..MachineConfig::default()
        });
        assert!(config.run_concurrently());

        config.concurrent = Some(false);
        assert!(!config.run_concurrently());
    }

    #[test]
    fn test_bond_config_defaults() {
        let bond: BondConfig = serde_json::from_str(
            r#"{ "name": "bond0", "vlan_ids": [100, 200] }"#,
        )
        .unwrap();

        assert_eq!(bond.mode, BondMode::Lacp);
        assert_eq!(bond.lacp_rate_param().as_deref(), Some("fast"));
        assert_eq!(bond.xmit_hash_policy_param().as_deref(), Some("layer3+4"));

        let bond: BondConfig = serde_json::from_str(
            r#"{ "name": "bond1", "vlan_ids": [100], "mode": "active-backup" }"#,
        )
        .unwrap();
        assert_eq!(bond.mode, BondMode::ActiveBackup);
        assert!(bond.lacp_rate_param().is_none());
    }

    #[test]
    fn test_validate_rejects_unidentifiable_machine() {
        let config: WorkflowConfig = serde_json::from_str(
            r#"{
                "api_url": "u",
                "api_key": "k",
                "machines": [{ "hostname": "ok" }, {}]
            }"#,
        )
        .unwrap();

        match config.validate() {
            Err(ConfigError::UnidentifiableMachine { index }) => assert_eq!(index, 2),
            other => panic!("expected UnidentifiableMachine, got {other:?}"),
        }
    }

    #[test]
    fn test_validate_rejects_empty_vlan_list() {
        let config: WorkflowConfig = serde_json::from_str(
            r#"{
                "api_url": "u",
                "api_key": "k",
                "machines": [{
                    "hostname": "node01",
                    "bonds": [{ "name": "bond0", "vlan_ids": [] }]
                }]
            }"#,
        )
        .unwrap();

        assert!(matches!(
            config.validate(),
            Err(ConfigError::BondWithoutVlans { .. })
        ));
    }

    #[test]
    fn test_action_set_describe_is_ordered() {
        let set = ActionSet::from(vec![Action::Deploy, Action::Commission]);
        assert_eq!(set.describe(), "commission, deploy");
    }
}
