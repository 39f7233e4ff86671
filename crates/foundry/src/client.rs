//! Provisioning client trait and common request types.
//!
//! The orchestration core only ever talks to the remote provisioning
//! service through [`ProvisionClient`]; the HTTP implementation lives in
//! [`crate::maas`] and test doubles implement the same trait.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::machine::MachineRecord;
use crate::network::{InterfaceDescriptor, SubnetRef};
use crate::storage::BlockDevice;

/// Errors that can occur during client operations.
#[derive(Error, Debug)]
pub enum ClientError {
    /// HTTP transport failed (connection refused, timeout, TLS, ...).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// API returned an error response.
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    /// Requested resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Response body could not be parsed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Client-side configuration problem (bad endpoint, malformed key).
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ClientError {
    /// Whether the failure is plausibly transient and worth retrying.
    ///
    /// Transport failures and server-side errors (5xx, 429) qualify;
    /// semantic rejections (other 4xx) and missing resources do not.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(_) => true,
            Self::Api { status, .. } => *status >= 500 || *status == 429,
            Self::NotFound(_) | Self::Serialization(_) | Self::Config(_) => false,
        }
    }
}

/// Result of looking a machine up by its identifying attributes.
///
/// Absence is an expected answer during locate-or-create, not an error,
/// so it gets its own variant instead of riding on [`ClientError`].
#[derive(Debug, Clone)]
pub enum MachineLookup {
    Found(MachineRecord),
    NotFound,
}

/// Request to enlist a new machine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateMachineSpec {
    /// Hostname for the machine.
    pub hostname: String,
    /// Known MAC addresses (the first is the PXE interface).
    pub mac_addresses: Vec<String>,
    /// Power driver type (e.g. "ipmi", "redfish").
    pub power_type: Option<String>,
    /// Power driver parameters, flattened as the API expects them.
    pub power_parameters: BTreeMap<String, String>,
}

/// Partial machine update.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MachineUpdate {
    pub hostname: Option<String>,
    pub power_type: Option<String>,
    #[serde(default)]
    pub power_parameters: BTreeMap<String, String>,
    /// Tag names to attach (vendor/BIOS metadata).
    #[serde(default)]
    pub tag_names: Vec<String>,
    pub description: Option<String>,
}

impl MachineUpdate {
    /// Whether the update carries any field at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hostname.is_none()
            && self.power_type.is_none()
            && self.power_parameters.is_empty()
            && self.tag_names.is_empty()
            && self.description.is_none()
    }
}

/// Options for a commissioning request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommissionOpts {
    /// Additional commissioning script names to run.
    #[serde(default)]
    pub commissioning_scripts: Vec<String>,
    /// Leave SSH enabled on the ephemeral environment.
    pub enable_ssh: bool,
}

impl Default for CommissionOpts {
    fn default() -> Self {
        Self {
            commissioning_scripts: Vec::new(),
            enable_ssh: true,
        }
    }
}

/// Options for a deployment request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeployOpts {
    /// OS series to install (service default when absent).
    pub distro_series: Option<String>,
    /// Cloud-init user data passed through to the installer.
    pub user_data: Option<String>,
}

/// Options for a release request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseOpts {
    /// Securely erase disks while releasing.
    pub erase: bool,
}

impl Default for ReleaseOpts {
    fn default() -> Self {
        Self { erase: true }
    }
}

/// IP assignment mode when linking an interface to a subnet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkMode {
    Auto,
    Dhcp,
    Static,
}

impl std::fmt::Display for LinkMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Dhcp => write!(f, "dhcp"),
            Self::Static => write!(f, "static"),
        }
    }
}

/// Request to aggregate physical interfaces into a bond.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BondRequest {
    /// Bond interface name (e.g. "bond0").
    pub name: String,
    /// Member interface ids.
    pub parents: Vec<i64>,
    /// Bond mode string as the API expects it (e.g. "802.3ad").
    pub mode: String,
    pub mtu: Option<u32>,
    /// LACP rate, only meaningful for 802.3ad.
    pub lacp_rate: Option<String>,
    /// Transmit hash policy, only meaningful for 802.3ad.
    pub xmit_hash_policy: Option<String>,
}

/// Remote provisioning service verbs consumed by the orchestration core.
///
/// Every method may fail transiently (network, 5xx) or with a semantic
/// rejection (4xx); callers wrap the former in retries via
/// [`crate::retry::with_retry`] and surface the latter immediately.
#[async_trait]
pub trait ProvisionClient: Send + Sync {
    /// List all machines known to the service.
    async fn list_machines(&self) -> Result<Vec<MachineRecord>, ClientError>;

    /// Fetch one machine by system id.
    async fn get_machine(&self, system_id: &str) -> Result<MachineRecord, ClientError>;

    /// Enlist a new machine.
    async fn create_machine(&self, spec: CreateMachineSpec) -> Result<MachineRecord, ClientError>;

    /// Update machine fields.
    async fn update_machine(
        &self,
        system_id: &str,
        update: MachineUpdate,
    ) -> Result<MachineRecord, ClientError>;

    /// Start commissioning.
    async fn commission(&self, system_id: &str, opts: CommissionOpts) -> Result<(), ClientError>;

    /// Start deployment.
    async fn deploy(&self, system_id: &str, opts: DeployOpts) -> Result<(), ClientError>;

    /// Start releasing the machine back to the pool.
    async fn release(&self, system_id: &str, opts: ReleaseOpts) -> Result<(), ClientError>;

    /// Remove the machine from the service entirely.
    async fn delete_machine(&self, system_id: &str) -> Result<(), ClientError>;

    /// Set the boot device order. Not every BMC supports this.
    async fn set_boot_order(&self, system_id: &str, devices: &[String]) -> Result<(), ClientError>;

    /// List the machine's network interfaces with VLAN topology.
    async fn list_interfaces(
        &self,
        system_id: &str,
    ) -> Result<Vec<InterfaceDescriptor>, ClientError>;

    /// Create a bond interface from physical members.
    async fn create_bond(
        &self,
        system_id: &str,
        req: BondRequest,
    ) -> Result<InterfaceDescriptor, ClientError>;

    /// Layer a tagged VLAN interface on top of a parent interface.
    async fn create_vlan_interface(
        &self,
        system_id: &str,
        parent_id: i64,
        vlan_id: u16,
    ) -> Result<InterfaceDescriptor, ClientError>;

    /// Link an interface to a subnet with the given address mode.
    async fn link_subnet(
        &self,
        system_id: &str,
        interface_id: i64,
        mode: LinkMode,
        subnet_id: i64,
        ip_address: Option<&str>,
    ) -> Result<(), ClientError>;

    /// List subnets known to the service.
    async fn list_subnets(&self) -> Result<Vec<SubnetRef>, ClientError>;

    /// List the machine's block devices.
    async fn list_block_devices(&self, system_id: &str) -> Result<Vec<BlockDevice>, ClientError>;

    /// Upload a curtin storage configuration for the machine.
    async fn set_storage_config(&self, system_id: &str, curtin: &str) -> Result<(), ClientError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let server = ClientError::Api {
            status: 503,
            message: "overloaded".to_string(),
        };
        assert!(server.is_transient());

        let throttled = ClientError::Api {
            status: 429,
            message: "slow down".to_string(),
        };
        assert!(throttled.is_transient());

        let rejected = ClientError::Api {
            status: 400,
            message: "bad power_type".to_string(),
        };
        assert!(!rejected.is_transient());

        assert!(!ClientError::NotFound("abc123".to_string()).is_transient());
    }

    #[test]
    fn test_machine_update_is_empty() {
        assert!(MachineUpdate::default().is_empty());

        let update = MachineUpdate {
            hostname: Some("node01".to_string()),
            ..MachineUpdate::default()
        };
        assert!(!update.is_empty());
    }
}
