//! Machine records and the locate-or-create lookup rules.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::client::MachineLookup;
use crate::config::MachineConfig;

/// Lifecycle state reported by the provisioning service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MachineState {
    /// Newly enlisted, not yet commissioned.
    New,
    /// Hardware discovery in progress.
    Commissioning,
    /// Commissioned and available for deployment.
    Ready,
    /// Reserved for a user but not deployed.
    Allocated,
    /// OS installation in progress.
    Deploying,
    /// Running a deployed OS.
    Deployed,
    /// Returning to the pool.
    Releasing,
    /// Disks are being wiped during release.
    DiskErasing,
    FailedCommissioning,
    FailedDeployment,
    FailedReleasing,
    FailedDiskErasing,
    Failed,
    /// Any state this client does not model.
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for MachineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::New => "NEW",
            Self::Commissioning => "COMMISSIONING",
            Self::Ready => "READY",
            Self::Allocated => "ALLOCATED",
            Self::Deploying => "DEPLOYING",
            Self::Deployed => "DEPLOYED",
            Self::Releasing => "RELEASING",
            Self::DiskErasing => "DISK_ERASING",
            Self::FailedCommissioning => "FAILED_COMMISSIONING",
            Self::FailedDeployment => "FAILED_DEPLOYMENT",
            Self::FailedReleasing => "FAILED_RELEASING",
            Self::FailedDiskErasing => "FAILED_DISK_ERASING",
            Self::Failed => "FAILED",
            Self::Unknown => "UNKNOWN",
        };
        write!(f, "{name}")
    }
}

/// One remote machine as the service reports it.
///
/// The `system_id` is assigned by the service on enlistment and never
/// changes within a workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineRecord {
    pub system_id: String,
    pub hostname: String,
    #[serde(default)]
    pub serial: Option<String>,
    #[serde(default)]
    pub mac_addresses: Vec<String>,
    #[serde(rename = "status_name")]
    pub state: MachineState,
    #[serde(default)]
    pub power_type: Option<String>,
    /// Out-of-band management address (BMC/IPMI), when known.
    #[serde(default)]
    pub power_address: Option<String>,
}

/// Canonicalize a MAC address for comparison: lowercase, no separators.
#[must_use]
pub fn normalize_mac(mac: &str) -> String {
    mac.to_lowercase().replace([':', '-'], "")
}

/// Locate a machine in the fleet listing by the config fragment's
/// identifying attributes.
///
/// Lookup priority: MAC address, then BMC/power address, then hostname,
/// then serial number. The first attribute that is both configured and
/// matched wins.
#[must_use]
pub fn locate(machines: &[MachineRecord], cfg: &MachineConfig) -> MachineLookup {
    if let Some(ref mac) = cfg.pxe_mac {
        let wanted = normalize_mac(mac);
        for m in machines {
            if m.mac_addresses.iter().any(|a| normalize_mac(a) == wanted) {
                info!(system_id = %m.system_id, mac = %mac, "Found machine by MAC");
                return MachineLookup::Found(m.clone());
            }
        }
        debug!(mac = %mac, "No machine with this MAC");
    }

    if let Some(ref bmc) = cfg.bmc_address {
        for m in machines {
            if m.power_address.as_deref() == Some(bmc.as_str()) {
                info!(system_id = %m.system_id, bmc = %bmc, "Found machine by BMC address");
                return MachineLookup::Found(m.clone());
            }
        }
        debug!(bmc = %bmc, "No machine with this BMC address");
    }

    if let Some(ref hostname) = cfg.hostname {
        let wanted = hostname.to_lowercase();
        for m in machines {
            if m.hostname.to_lowercase() == wanted {
                info!(system_id = %m.system_id, hostname = %hostname, "Found machine by hostname");
                return MachineLookup::Found(m.clone());
            }
        }
        debug!(hostname = %hostname, "No machine with this hostname");
    }

    if let Some(ref serial) = cfg.serial {
        for m in machines {
            if m.serial.as_deref() == Some(serial.as_str()) {
                info!(system_id = %m.system_id, serial = %serial, "Found machine by serial");
                return MachineLookup::Found(m.clone());
            }
        }
        debug!(serial = %serial, "No machine with this serial");
    }

    MachineLookup::NotFound
}

/// Hostname to enlist a machine under when the config only has a MAC.
#[must_use]
pub fn generated_hostname(cfg: &MachineConfig) -> String {
    cfg.hostname.clone().unwrap_or_else(|| {
        let mac = cfg.pxe_mac.as_deref().unwrap_or_default();
        format!("node-{}", normalize_mac(mac))
    })
}
