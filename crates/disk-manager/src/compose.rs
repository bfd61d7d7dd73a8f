// Copyright 2021 System76 <info@system76.com>
// SPDX-License-Identifier: LGPL-3.0-only

//! Formats the logical volumes and mounts the subvolume tree under the target root.

use crate::block_types::Capabilities;
use crate::mounts::within;
use crate::ops::{Filesystem, MountSpec, OpsResult, StorageOps};
use crate::volumes::VolumeTopology;
use std::path::{Path, PathBuf};

pub const TARGET: &str = "/mnt";

/// Subvolume names and where they are mounted in the target.
pub const SUBVOLUMES: &[(&str, &str)] = &[
    ("@", "/"),
    ("@home", "/home"),
    ("@var", "/var"),
    ("@log", "/var/log"),
    ("@cache", "/var/cache"),
    ("@snapshots", "/.snapshots"),
];

const BTRFS_BASE_OPTIONS: &[&str] = &["noatime", "compress=zstd"];
const ESP_OPTIONS: &[&str] = &["nosuid", "nodev", "fmask=0137", "dmask=0027"];

/// Options derived from what every device in the plan supports.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MountOptions {
    pub ssd: bool,
    pub discard: bool,
}

impl MountOptions {
    pub fn from_capabilities(caps: Capabilities) -> Self {
        MountOptions {
            ssd: caps.contains(Capabilities::NON_ROTATIONAL),
            discard: caps.contains(Capabilities::DISCARD_ZEROES),
        }
    }

    pub fn btrfs(&self, subvolume: Option<&str>) -> Vec<String> {
        let mut options = BTRFS_BASE_OPTIONS
            .iter()
            .map(|option| option.to_string())
            .collect::<Vec<_>>();

        if self.ssd {
            options.push("ssd".into());
        }

        if self.discard {
            options.push("discard".into());
        }

        if let Some(subvolume) = subvolume {
            options.push(format!("subvol={}", subvolume));
        }

        options
    }
}

/// Subvolumes sorted so that every mount point follows the mount points containing it.
pub fn mount_order() -> Vec<(&'static str, &'static str)> {
    let mut order = SUBVOLUMES.to_vec();
    order.sort_by_key(|&(_, path)| (Path::new(path).components().count(), path));
    order
}

/// A filesystem mounted into the target, as it should appear in fstab.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MountEntry {
    /// How fstab identifies the filesystem: a device path or `UUID=...`.
    pub source: String,
    /// Mount point inside the target, or `none` for swap.
    pub mount_point: String,
    pub fstype: &'static str,
    pub options: Vec<String>,
    pub pass: u8,
}

/// Everything the composer mounted, in mount order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MountTable {
    pub root: PathBuf,
    pub entries: Vec<MountEntry>,
}

impl MountTable {
    pub fn fstab(&self) -> String {
        let mut fstab = String::from("# <file system> <dir> <type> <options> <dump> <pass>\n");
        for entry in &self.entries {
            let options = if entry.options.is_empty() {
                "defaults".to_owned()
            } else {
                entry.options.join(",")
            };

            fstab.push_str(&format!(
                "{} {} {} {} 0 {}\n",
                entry.source, entry.mount_point, entry.fstype, options, entry.pass
            ));
        }

        fstab
    }
}

fn strings(options: &[&str]) -> Vec<String> {
    options.iter().map(|option| option.to_string()).collect()
}

/// Formats swap, root, and the EFI system partition, then mounts everything under `target`.
///
/// The root filesystem is mounted once without a subvolume to create the
/// tree, unmounted, and remounted subvolume by subvolume. The EFI system
/// partition is mounted last.
pub fn compose<O: StorageOps>(
    ops: &mut O,
    capabilities: Capabilities,
    topology: &VolumeTopology,
    target: &Path,
) -> OpsResult<MountTable> {
    let options = MountOptions::from_capabilities(capabilities);
    tracing::info!("mounting with {:?}", options);

    let mut table = MountTable {
        root: target.to_owned(),
        entries: Vec::new(),
    };

    ops.format(&topology.swap, Filesystem::Swap)?;
    ops.enable_swap(&topology.swap)?;

    ops.format(
        &topology.root,
        Filesystem::Btrfs {
            discard: options.discard,
        },
    )?;

    ops.mount(&MountSpec {
        source: topology.root.clone(),
        target: target.to_owned(),
        fstype: "btrfs",
        options: options.btrfs(None),
    })?;

    for (subvolume, _) in SUBVOLUMES {
        ops.create_subvolume(&target.join(subvolume))?;
    }

    ops.unmount(target)?;

    for (subvolume, mount_point) in mount_order() {
        let spec = MountSpec {
            source: topology.root.clone(),
            target: within(target, mount_point),
            fstype: "btrfs",
            options: options.btrfs(Some(subvolume)),
        };

        ops.mount(&spec)?;
        table.entries.push(MountEntry {
            source: topology.root.display().to_string(),
            mount_point: mount_point.to_owned(),
            fstype: spec.fstype,
            options: spec.options,
            pass: 0,
        });
    }

    ops.format(&topology.boot, Filesystem::Vfat)?;
    let esp_uuid = ops.filesystem_uuid(&topology.boot)?;

    ops.mount(&MountSpec {
        source: topology.boot.clone(),
        target: within(target, "/boot"),
        fstype: "vfat",
        options: strings(ESP_OPTIONS),
    })?;

    table.entries.push(MountEntry {
        source: format!("UUID={}", esp_uuid),
        mount_point: "/boot".into(),
        fstype: "vfat",
        options: strings(ESP_OPTIONS),
        pass: 2,
    });

    table.entries.push(MountEntry {
        source: topology.swap.display().to_string(),
        mount_point: "none".into(),
        fstype: "swap",
        options: Vec::new(),
        pass: 0,
    });

    Ok(table)
}
