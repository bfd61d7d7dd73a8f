// Copyright 2021 System76 <info@system76.com>
// SPDX-License-Identifier: LGPL-3.0-only

use crate::block_types::BlockDevice;
use crate::ops::{DiskPartitions, OpsError, OpsResult, StorageOps};
use crate::plan::StoragePlan;
use cradle::prelude::*;
use gptman::{GPTPartitionEntry, GPT};
use rand::RngCore;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

pub const ESP_SIZE: u64 = 1 << 30;

/// Partitions start on 1 MiB boundaries.
const ALIGNMENT: u64 = 1 << 20;

/// C12A7328-F81F-11D2-BA4B-00A0C93EC93B, in on-disk byte order.
const ESP_TYPE: [u8; 16] = [
    0x28, 0x73, 0x2A, 0xC1, 0x1F, 0xF8, 0xD2, 0x11, 0xBA, 0x4B, 0x00, 0xA0, 0xC9, 0x3E, 0xC9, 0x3B,
];

/// E6D6D379-F507-44C2-A23C-238F2A3DF928, in on-disk byte order.
const LVM_TYPE: [u8; 16] = [
    0x79, 0xD3, 0xD6, 0xE6, 0x07, 0xF5, 0xC2, 0x44, 0xA2, 0x3C, 0x23, 0x8F, 0x2A, 0x3D, 0xF9, 0x28,
];

pub const ESP_ARRAY: &str = "/dev/md/esp";

/// Sector ranges of the boot and system partitions, inclusive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Layout {
    pub boot: (u64, u64),
    pub system: (u64, u64),
}

/// Places the boot partition at the first aligned sector and gives the rest to the system.
pub fn layout(first_usable: u64, last_usable: u64, sector_size: u64) -> Option<Layout> {
    let align = (ALIGNMENT / sector_size).max(1);
    let align_up = |lba: u64| (lba + align - 1) / align * align;

    let boot_start = align_up(first_usable);
    let boot_end = boot_start + ESP_SIZE / sector_size - 1;
    let system_start = align_up(boot_end + 1);

    if system_start >= last_usable {
        return None;
    }

    Some(Layout {
        boot: (boot_start, boot_end),
        system: (system_start, last_usable),
    })
}

fn random_guid() -> [u8; 16] {
    let mut guid = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut guid);
    // Version 4, RFC 4122 variant.
    guid[7] = (guid[7] & 0x0F) | 0x40;
    guid[8] = (guid[8] & 0x3F) | 0x80;
    guid
}

fn entry(type_guid: [u8; 16], (start, end): (u64, u64), name: &str) -> GPTPartitionEntry {
    GPTPartitionEntry {
        partition_type_guid: type_guid,
        unique_partition_guid: random_guid(),
        starting_lba: start,
        ending_lba: end,
        attribute_bits: 0,
        partition_name: name.into(),
    }
}

/// Writes a new GPT with an EFI system partition and an LVM partition.
pub fn write_table(disk: &BlockDevice) -> OpsResult<DiskPartitions> {
    tracing::info!("writing GPT to {:?}", disk.path);
    let table_error = |source| OpsError::PartitionTable {
        device: disk.path.clone(),
        source,
    };

    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&disk.path)
        .map_err(OpsError::io(&disk.path))?;

    let sector_size = disk.sector_size;
    let mut gpt = GPT::new_from(&mut file, sector_size, random_guid()).map_err(table_error)?;

    let layout = layout(
        gpt.header.first_usable_lba,
        gpt.header.last_usable_lba,
        sector_size,
    )
    .ok_or_else(|| OpsError::DiskTooSmall {
        device: disk.path.clone(),
    })?;

    gpt[1] = entry(ESP_TYPE, layout.boot, "EFI system");
    gpt[2] = entry(LVM_TYPE, layout.system, "system");

    GPT::write_protective_mbr_into(&mut file, sector_size).map_err(table_error)?;
    gpt.write_into(&mut file).map_err(table_error)?;
    file.sync_all().map_err(OpsError::io(&disk.path))?;

    Ok(DiskPartitions {
        disk: disk.path.clone(),
        boot: disk.partition_path(1),
        system: disk.partition_path(2),
    })
}

/// Creates a RAID1 array over the boot partitions.
///
/// Metadata 1.0 lives at the end of each member, so firmware still sees a plain FAT filesystem.
pub fn mirror(members: &[PathBuf]) -> Result<PathBuf, cradle::Error> {
    tracing::info!("mirroring boot partitions {:?} into {}", members, ESP_ARRAY);
    let () = run_result!(
        "mdadm",
        "--create",
        ESP_ARRAY,
        "--run",
        "--level=1",
        "--metadata=1.0",
        format!("--raid-devices={}", members.len()),
        members.to_vec()
    )?;

    Ok(PathBuf::from(ESP_ARRAY))
}

pub fn stop_mirror() -> Result<(), cradle::Error> {
    tracing::info!("stopping {}", ESP_ARRAY);
    run_result!("mdadm", "--stop", ESP_ARRAY)
}

pub fn wipe_signatures(disk: &Path) -> Result<(), cradle::Error> {
    tracing::info!("wiping signatures from {:?}", disk);
    run_result!("wipefs", "--all", "--force", disk)
}

/// Partitions every disk in the plan, then waits once for the kernel to catch up.
pub fn partition_disks<O: StorageOps>(
    ops: &mut O,
    plan: &StoragePlan,
) -> OpsResult<Vec<DiskPartitions>> {
    let mut partitions = Vec::with_capacity(plan.devices.len());

    for disk in &plan.devices {
        ops.wipe_signatures(&disk.path)?;
        partitions.push(ops.write_partition_table(disk)?);
    }

    ops.settle()?;
    Ok(partitions)
}
