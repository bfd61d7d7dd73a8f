// Copyright 2021 System76 <info@system76.com>
// SPDX-License-Identifier: GPL-3.0-only

use anyhow::Context;
use cradle::prelude::*;
use keystone_disk_manager::compose::TARGET;
use keystone_disk_manager::partition::{self, ESP_ARRAY};
use keystone_disk_manager::volumes::{volume_path, ROOT_VOLUME, SWAP_VOLUME, VOLUME_GROUP};
use keystone_disk_manager::wipe::{self, Backing};
use keystone_disk_manager::{lvm, mounts};
use std::path::Path;

/// Prefix of the mappings encrypted partitions are opened under.
const MAPPING_PREFIX: &str = "luks-";

/// Logical volumes overwritten before the volume group is removed.
///
/// The root volume is thin with a virtual size beyond its pool, so its
/// overwrite ends when the pool runs out of data blocks.
const OVERWRITTEN_VOLUMES: [(&str, Backing); 2] =
    [(ROOT_VOLUME, Backing::Thin), (SWAP_VOLUME, Backing::Linear)];

/// Tears down and overwrites everything a previous `setup` built.
///
/// Volumes which no longer exist are skipped, so a failed run can be cleaned.
pub fn run() -> anyhow::Result<()> {
    mounts::unmount_tree(Path::new(TARGET))
        .with_context(|| format!("failed to unmount {}", TARGET))?;

    let () = run_result!("swapoff", "-a").context("swapoff failed")?;

    for (name, backing) in OVERWRITTEN_VOLUMES {
        let volume = volume_path(name);
        if volume.exists() {
            wipe::overwrite(&volume, backing)
                .with_context(|| format!("failed to overwrite {:?}", volume))?;
        }
    }

    let physical_volumes =
        lvm::vg_physical_volumes(VOLUME_GROUP).context("failed to list physical volumes")?;

    if physical_volumes.is_empty() {
        tracing::info!("volume group {} does not exist", VOLUME_GROUP);
    } else {
        lvm::vg_remove(VOLUME_GROUP).context("failed to remove the volume group")?;
        for device in &physical_volumes {
            wipe::overwrite(device, Backing::Linear)
                .with_context(|| format!("failed to overwrite {:?}", device))?;
        }
    }

    if Path::new(ESP_ARRAY).exists() {
        partition::stop_mirror().context("failed to stop the boot partition mirror")?;
    }

    let removed = wipe::remove_mappings(MAPPING_PREFIX)
        .map_err(|why| anyhow::anyhow!("{}", why))
        .context("failed to remove encrypted mappings")?;

    tracing::info!("clean complete, closed {} encrypted mapping(s)", removed.len());
    Ok(())
}
