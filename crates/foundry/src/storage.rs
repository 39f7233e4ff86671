//! Storage layout rendering and boot device selection.
//!
//! The provisioning service consumes a curtin storage configuration; we
//! render one from a fixed EFI + boot + LVM layout with per-volume sizes
//! taken from configuration.

use handlebars::Handlebars;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::StorageParams;

const CURTIN_TEMPLATE: &str = "\
storage:
  config:
    # EFI partition
    - id: disk-target
      type: disk
      path: {{device}}
      ptable: gpt
      wipe: superblock
      preserve: false

    - id: part-efi
      type: partition
      device: disk-target
      size: {{efi_mb}}MB
      flag: boot

    - id: format-efi
      type: format
      fstype: fat32
      volume: part-efi

    - id: mount-efi
      type: mount
      path: /boot/efi
      device: format-efi

    # Boot partition
    - id: part-boot
      type: partition
      device: disk-target
      size: {{boot_size_g}}GB

    - id: format-boot
      type: format
      fstype: xfs
      volume: part-boot

    - id: mount-boot
      type: mount
      path: /boot
      device: format-boot

    # LVM partition
    - id: part-lvm
      type: partition
      device: disk-target
      size: -1

    - id: pv-lvm
      type: lvm_volgroup
      name: vg-main
      devices:
        - part-lvm

    # Logical volumes
{{#each lvs}}
    - id: lv-{{name}}
      type: lvm_partition
      name: {{name}}
      volgroup: pv-lvm
      size: {{size}}GB

    - id: format-{{name}}
      type: format
      fstype: {{fs}}
      volume: lv-{{name}}

    - id: mount-{{name}}
      type: mount
      path: {{mount}}
      device: format-{{name}}
{{/each}}

grub:
  install_devices:
    - {{device}}
  update_nvram: true
";

/// A block device as the provisioning service reports it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockDevice {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub id_path: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Errors from storage layout handling.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("no suitable block device found for {system_id}")]
    NoDevice { system_id: String },

    #[error("failed to render storage layout: {0}")]
    Render(#[from] handlebars::RenderError),
}

fn device_path(device: &BlockDevice) -> String {
    let name = device
        .id_path
        .clone()
        .or_else(|| device.path.clone())
        .unwrap_or_else(|| device.name.clone());
    if name.starts_with("/dev/") {
        name
    } else {
        format!("/dev/{name}")
    }
}

/// Pick the installation target from a machine's block devices.
///
/// Devices tagged `boot`, `os` or `ssd` are preferred; otherwise the
/// largest device wins.
#[must_use]
pub fn choose_device(devices: &[BlockDevice]) -> Option<String> {
    if devices.is_empty() {
        warn!("No block devices reported");
        return None;
    }

    for device in devices {
        if device
            .tags
            .iter()
            .any(|t| t == "boot" || t == "os" || t == "ssd")
        {
            let path = device_path(device);
            info!(device = %path, "Selected tagged boot device");
            return Some(path);
        }
    }

    let largest = devices.iter().max_by_key(|d| d.size)?;
    let path = device_path(largest);
    info!(device = %path, size = largest.size, "Selected largest device");
    Some(path)
}

/// Render the curtin storage configuration for `device`.
///
/// # Errors
/// Returns an error if the template fails to render.
pub fn render_curtin(device: &str, params: &StorageParams) -> Result<String, StorageError> {
    let lvs = json!([
        { "name": "root", "size": params.root_size_g, "fs": "xfs", "mount": "/" },
        { "name": "home", "size": params.home_size_g, "fs": "xfs", "mount": "/home" },
        { "name": "var", "size": params.var_size_g, "fs": "xfs", "mount": "/var" },
        { "name": "var-log", "size": params.var_log_size_g, "fs": "xfs", "mount": "/var/log" },
        { "name": "tmp", "size": params.tmp_size_g, "fs": "xfs", "mount": "/tmp" },
    ]);

    let data = json!({
        "device": device,
        "efi_mb": params.efi_mb,
        "boot_size_g": params.boot_size_g,
        "lvs": lvs,
    });

    let handlebars = Handlebars::new();
    let rendered = handlebars.render_template(CURTIN_TEMPLATE, &data)?;
    debug!(device = %device, "Rendered curtin storage config");
    Ok(rendered)
}
