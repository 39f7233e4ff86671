//! Interface topology and VLAN-driven bond configuration.
//!
//! Bond members are not named in configuration; they are derived from the
//! machine's interface topology. An interface is eligible for a bond on
//! VLAN `v` when it is physical (never an existing bond or bridge) and
//! either its directly attached VLAN is `v` or, failing that, one of its
//! subnet links sits on VLAN `v`. The direct check wins per interface:
//! an interface whose direct VLAN matches never consults its links.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::client::{BondRequest, ClientError, LinkMode, ProvisionClient};
use crate::config::BondConfig;
use crate::retry::{with_retry, RetryPolicy};

/// Interface type as reported by the provisioning service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceKind {
    Physical,
    Bond,
    Bridge,
    Vlan,
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for InterfaceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Physical => write!(f, "physical"),
            Self::Bond => write!(f, "bond"),
            Self::Bridge => write!(f, "bridge"),
            Self::Vlan => write!(f, "vlan"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// A VLAN reference carried by interfaces and subnets.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct VlanRef {
    /// 802.1Q tag.
    pub vid: u16,
}

/// A subnet as referenced from interface links.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubnetRef {
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub cidr: Option<String>,
    #[serde(default)]
    pub vlan: Option<VlanRef>,
}

/// An address assignment linking an interface to a subnet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceLink {
    pub id: i64,
    #[serde(default)]
    pub subnet: Option<SubnetRef>,
}

/// One network interface of a machine.
///
/// `id` is stable for the lifetime of one commissioning cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceDescriptor {
    pub id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: InterfaceKind,
    #[serde(default)]
    pub mac_address: Option<String>,
    /// Directly attached VLAN, when the fabric reports one.
    #[serde(default)]
    pub vlan: Option<VlanRef>,
    #[serde(default)]
    pub links: Vec<InterfaceLink>,
}

impl InterfaceDescriptor {
    /// Whether VLAN `vid` is visible from this interface, direct VLAN
    /// first, subnet links as the fallback.
    fn sees_vlan(&self, vid: u16) -> bool {
        if let Some(ref vlan) = self.vlan {
            if vlan.vid == vid {
                return true;
            }
            // Direct VLAN is authoritative for this interface; a link on
            // another VLAN does not override it.
            return false;
        }
        self.links
            .iter()
            .filter_map(|l| l.subnet.as_ref())
            .filter_map(|s| s.vlan.as_ref())
            .any(|v| v.vid == vid)
    }
}

/// Errors from interface matching.
#[derive(Debug, Error)]
pub enum MatchError {
    /// Fewer than two interfaces see the target VLAN.
    #[error(
        "found {found} interface(s) with VLAN {vlan_id}, need at least 2 to bond; \
         available interfaces: [{available}]"
    )]
    NotEnoughInterfaces {
        vlan_id: u16,
        found: usize,
        available: String,
    },
}

fn describe_interfaces(interfaces: &[InterfaceDescriptor]) -> String {
    interfaces
        .iter()
        .map(|iface| {
            let vid = iface
                .vlan
                .as_ref()
                .map_or_else(|| "none".to_string(), |v| v.vid.to_string());
            format!("{} (type: {}, vlan: {})", iface.name, iface.kind, vid)
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Select the physical interfaces eligible to form a bond on `vlan_id`.
///
/// Returns the matched interface names in topology order, deduplicated.
/// Bond and bridge interfaces are never candidates even when their VLAN
/// matches.
///
/// # Errors
/// Returns [`MatchError::NotEnoughInterfaces`] (listing every interface
/// and its VLAN) when fewer than two interfaces match.
pub fn match_bond_interfaces(
    interfaces: &[InterfaceDescriptor],
    vlan_id: u16,
) -> Result<Vec<String>, MatchError> {
    let mut matched: Vec<String> = Vec::new();

    for iface in interfaces {
        match iface.kind {
            InterfaceKind::Bond | InterfaceKind::Bridge => {
                debug!(name = %iface.name, kind = %iface.kind, "Skipping non-candidate interface");
                continue;
            }
            _ => {}
        }

        if iface.sees_vlan(vlan_id) && !matched.contains(&iface.name) {
            info!(name = %iface.name, vlan = vlan_id, "Interface sees target VLAN");
            matched.push(iface.name.clone());
        }
    }

    if matched.len() < 2 {
        return Err(MatchError::NotEnoughInterfaces {
            vlan_id,
            found: matched.len(),
            available: describe_interfaces(interfaces),
        });
    }

    info!(
        vlan = vlan_id,
        members = %matched.join(", "),
        "Selected bond members"
    );
    Ok(matched)
}

/// Errors from bond configuration.
#[derive(Debug, Error)]
pub enum BondError {
    #[error(transparent)]
    Match(#[from] MatchError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("bond {name} requires at least one vlan id")]
    NoVlans { name: String },

    #[error("subnet {subnet} not known to the provisioning service")]
    UnknownSubnet { subnet: String },
}

/// Create one bond on a machine from its VLAN topology.
///
/// The first configured VLAN id selects the physical members. Each
/// subsequent VLAN id becomes a tagged sub-interface layered on the bond:
/// a failure on the first sub-interface fails the whole bond, later ones
/// are logged and skipped. An optional subnet link is applied last.
///
/// # Errors
/// Returns an error when matching, bond creation, the first VLAN
/// sub-interface, or the subnet link fails.
pub async fn configure_bond(
    client: &Arc<dyn ProvisionClient>,
    system_id: &str,
    cfg: &BondConfig,
    policy: &RetryPolicy,
) -> Result<(), BondError> {
    let Some((&primary_vlan, extra_vlans)) = cfg.vlan_ids.split_first() else {
        return Err(BondError::NoVlans {
            name: cfg.name.clone(),
        });
    };

    let interfaces = with_retry(policy, "list interfaces", || {
        client.list_interfaces(system_id)
    })
    .await?;

    let member_names = match_bond_interfaces(&interfaces, primary_vlan)?;
    let member_ids: Vec<i64> = interfaces
        .iter()
        .filter(|iface| member_names.contains(&iface.name))
        .map(|iface| iface.id)
        .collect();

    info!(
        system_id = %system_id,
        bond = %cfg.name,
        mode = %cfg.mode,
        members = %member_names.join(", "),
        "Creating bond"
    );

    let request = BondRequest {
        name: cfg.name.clone(),
        parents: member_ids,
        mode: cfg.mode.to_string(),
        mtu: cfg.mtu,
        lacp_rate: cfg.lacp_rate_param(),
        xmit_hash_policy: cfg.xmit_hash_policy_param(),
    };

    let bond = with_retry(policy, "create bond", || {
        client.create_bond(system_id, request.clone())
    })
    .await?;

    info!(system_id = %system_id, bond = %bond.name, id = bond.id, "Bond created");

    for (idx, &vid) in extra_vlans.iter().enumerate() {
        let result = with_retry(policy, "create vlan interface", || {
            client.create_vlan_interface(system_id, bond.id, vid)
        })
        .await;

        match result {
            Ok(sub) => {
                info!(system_id = %system_id, parent = %bond.name, vlan = vid, sub = %sub.name,
                    "VLAN sub-interface created");
            }
            Err(e) if idx == 0 => return Err(e.into()),
            Err(e) => {
                warn!(system_id = %system_id, parent = %bond.name, vlan = vid,
                    "Skipping VLAN sub-interface: {e}");
            }
        }
    }

    if let Some(ref subnet) = cfg.subnet {
        let subnets = with_retry(policy, "list subnets", || client.list_subnets()).await?;
        let target = subnets
            .iter()
            .find(|s| {
                s.cidr.as_deref() == Some(subnet.as_str())
                    || s.name.as_deref() == Some(subnet.as_str())
            })
            .ok_or_else(|| BondError::UnknownSubnet {
                subnet: subnet.clone(),
            })?;

        let mode = cfg.ip_mode;
        let ip = if mode == LinkMode::Static {
            cfg.ip_address.as_deref()
        } else {
            None
        };

        with_retry(policy, "link subnet", || {
            client.link_subnet(system_id, bond.id, mode, target.id, ip)
        })
        .await?;

        info!(system_id = %system_id, bond = %bond.name, subnet = %subnet, mode = %mode,
            "Bond linked to subnet");
    }

    Ok(())
}
