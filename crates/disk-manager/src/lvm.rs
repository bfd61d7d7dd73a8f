// Copyright 2021 System76 <info@system76.com>
// SPDX-License-Identifier: LGPL-3.0-only

use crate::ops::{LogicalVolume, Size};
use cradle::prelude::*;
use std::path::{Path, PathBuf};

pub fn pv_create(device: &Path) -> Result<(), cradle::Error> {
    tracing::info!("creating LVM PV on {:?}", device);
    run_result!("pvcreate", "--yes", device)
}

pub fn vg_create(vg: &str, devices: &[PathBuf]) -> Result<(), cradle::Error> {
    tracing::info!("creating LVM VG {} over {:?}", vg, devices);
    run_result!("vgcreate", "--yes", vg, devices.to_vec())
}

pub fn lv_create(lv: &LogicalVolume) -> Result<(), cradle::Error> {
    tracing::info!("creating LVM LV {}/{} ({:?})", lv.volume_group, lv.name, lv.size);
    let (flag, size) = match &lv.size {
        Size::Absolute(size) => ("-L", size.as_str()),
        Size::Extents(extents) => ("-l", extents.as_str()),
    };

    run_result!(
        "lvcreate",
        "--yes",
        "--wipesignatures",
        "y",
        flag,
        size,
        lv.redundancy.clone(),
        "-n",
        lv.name.as_str(),
        lv.volume_group.as_str()
    )
}

pub fn thin_pool_convert(vg: &str, data: &str, metadata: &str) -> Result<(), cradle::Error> {
    tracing::info!("binding {}/{} and {}/{} into a thin pool", vg, data, vg, metadata);
    run_result!(
        "lvconvert",
        "--yes",
        "--type",
        "thin-pool",
        "--poolmetadata",
        format!("{}/{}", vg, metadata),
        format!("{}/{}", vg, data)
    )
}

pub fn thin_create(vg: &str, pool: &str, name: &str, virtual_size: &str) -> Result<(), cradle::Error> {
    tracing::info!("creating thin LV {}/{} of {} in pool {}", vg, name, virtual_size, pool);
    run_result!(
        "lvcreate",
        "--yes",
        "--thin",
        "-V",
        virtual_size,
        "-n",
        name,
        format!("{}/{}", vg, pool)
    )
}

pub fn vg_remove(vg: &str) -> Result<(), cradle::Error> {
    tracing::info!("removing LVM VG {}", vg);
    run_result!("vgremove", "--yes", "--force", "--force", vg)
}

/// Physical volumes backing `vg`.
pub fn vg_physical_volumes(vg: &str) -> Result<Vec<PathBuf>, cradle::Error> {
    let StdoutUntrimmed(output) = run_result!(
        "pvs",
        "--noheadings",
        "-o",
        "pv_name",
        "--select",
        format!("vg_name={}", vg)
    )?;

    Ok(parse_pv_names(&output))
}

fn parse_pv_names(output: &str) -> Vec<PathBuf> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(PathBuf::from)
        .collect()
}
