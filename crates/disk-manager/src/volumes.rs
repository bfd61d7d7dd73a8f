// Copyright 2021 System76 <info@system76.com>
// SPDX-License-Identifier: LGPL-3.0-only

use crate::ops::{DiskPartitions, LogicalVolume, OpsError, OpsResult, Size, StorageOps};
use crate::plan::StoragePlan;
use std::path::{Path, PathBuf};

pub const VOLUME_GROUP: &str = "vg_system";
pub const SWAP_VOLUME: &str = "swap";
pub const METADATA_VOLUME: &str = "pool_meta";
pub const POOL_VOLUME: &str = "pool";
pub const ROOT_VOLUME: &str = "root";

pub const METADATA_SIZE: &str = "1G";

/// Thin root volumes are deliberately larger than the pool backing them.
pub const ROOT_VIRTUAL_SIZE: &str = "4T";

/// The LVM structure realized on the selected devices.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VolumeTopology {
    pub volume_group: String,
    pub physical_volumes: Vec<PathBuf>,
    /// The EFI system partition, or the array mirroring all of them.
    pub boot: PathBuf,
    pub swap: PathBuf,
    pub root: PathBuf,
}

/// Path of a logical volume in `/dev`.
pub fn volume_path(name: &str) -> PathBuf {
    Path::new("/dev").join(VOLUME_GROUP).join(name)
}

/// Creates the volume group, the thick swap volume, the thin pool, and the thin root volume.
pub fn build<O: StorageOps>(
    ops: &mut O,
    plan: &StoragePlan,
    partitions: &[DiskPartitions],
    physical_volumes: &[PathBuf],
) -> OpsResult<VolumeTopology> {
    if physical_volumes.is_empty() || partitions.is_empty() {
        return Err(OpsError::NothingToBuild);
    }

    for device in physical_volumes {
        ops.create_physical_volume(device)?;
    }

    let boot = match partitions {
        [single] => single.boot.clone(),
        many => {
            let members = many.iter().map(|p| p.boot.clone()).collect::<Vec<_>>();
            ops.mirror_boot(&members)?
        }
    };

    ops.create_volume_group(VOLUME_GROUP, physical_volumes)?;

    let redundancy = plan.redundancy_args();
    let volume = |name: &str, size: Size, redundancy: Vec<String>| LogicalVolume {
        volume_group: VOLUME_GROUP.to_owned(),
        name: name.to_owned(),
        size,
        redundancy,
    };

    ops.create_logical_volume(&volume(
        SWAP_VOLUME,
        Size::Absolute(format!("{}G", plan.swap_gib)),
        redundancy.clone(),
    ))?;

    ops.create_logical_volume(&volume(
        METADATA_VOLUME,
        Size::Absolute(METADATA_SIZE.to_owned()),
        redundancy.clone(),
    ))?;

    ops.create_logical_volume(&volume(
        POOL_VOLUME,
        Size::Extents(plan.pool_allocation.clone()),
        redundancy,
    ))?;

    ops.create_thin_pool(VOLUME_GROUP, POOL_VOLUME, METADATA_VOLUME)?;
    ops.create_thin_volume(VOLUME_GROUP, POOL_VOLUME, ROOT_VOLUME, ROOT_VIRTUAL_SIZE)?;

    Ok(VolumeTopology {
        volume_group: VOLUME_GROUP.to_owned(),
        physical_volumes: physical_volumes.to_vec(),
        boot,
        swap: volume_path(SWAP_VOLUME),
        root: volume_path(ROOT_VOLUME),
    })
}
