// Copyright 2021 System76 <info@system76.com>
// SPDX-License-Identifier: LGPL-3.0-only

//! Selection of the disks which are safe to provision.
//!
//! A disk is a candidate only if its identity can be trusted: it must be a
//! whole disk, not hot-pluggable, report both a serial and a model, and must
//! not back the medium the live environment was booted from.

use crate::block_types::{BlockDevice, DeviceKind, RecordError};
use crate::mounts;
use crate::udev::{ancestry, UDev};
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};

/// Where the live environment mounts its installation medium.
pub const ISO_MOUNT_POINT: &str = "/run/archiso/bootmnt";

#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("no eligible disk was found")]
    NoCandidates,
    #[error("failed to enumerate block devices")]
    Udev(#[source] libudev::Error),
    #[error("failed to read the mount table")]
    MountTable(#[source] procfs::ProcError),
    #[error("failed to resolve installation medium {path:?}")]
    Resolve {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("device record on line {line} is malformed")]
    Record {
        line: usize,
        #[source]
        source: RecordError,
    },
}

/// Why a device was left out of the candidate set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rejection {
    InstallMedium,
    NotDisk,
    Hotplug,
    NoSerial,
    NoModel,
}

pub fn rejection(device: &BlockDevice, excluded: &BTreeSet<String>) -> Option<Rejection> {
    if excluded.contains(&device.kname) {
        Some(Rejection::InstallMedium)
    } else if device.kind != DeviceKind::Disk {
        Some(Rejection::NotDisk)
    } else if device.hotplug {
        Some(Rejection::Hotplug)
    } else if device.serial.trim().is_empty() {
        Some(Rejection::NoSerial)
    } else if device.model.trim().is_empty() {
        Some(Rejection::NoModel)
    } else {
        None
    }
}

/// Reduces a device snapshot to the ordered, deduplicated set of candidate disks.
pub fn classify(
    snapshot: &[BlockDevice],
    excluded: &BTreeSet<String>,
) -> Result<Vec<BlockDevice>, ClassifyError> {
    let mut candidates = BTreeMap::new();

    for device in snapshot {
        match rejection(device, excluded) {
            Some(reason) => tracing::debug!("{}: excluded ({:?})", device.kname, reason),
            None => {
                candidates
                    .entry(device.kname.clone())
                    .or_insert_with(|| device.clone());
            }
        }
    }

    if candidates.is_empty() {
        return Err(ClassifyError::NoCandidates);
    }

    Ok(candidates.into_values().collect())
}

/// Kernel names of every device backing the filesystem mounted at `mount_point`.
///
/// An absent mount, or one not backed by a local device (a network boot),
/// yields an empty set: there is nothing to protect.
pub fn install_medium(mount_point: &Path) -> Result<BTreeSet<String>, ClassifyError> {
    let source = match mounts::source_of(mount_point).map_err(ClassifyError::MountTable)? {
        Some(source) if is_device_source(&source) => source,
        Some(source) => {
            tracing::warn!(
                "installation medium at {:?} is not a local device ({}), excluding nothing",
                mount_point,
                source
            );
            return Ok(BTreeSet::new());
        }
        None => {
            tracing::warn!("no installation medium is mounted at {:?}", mount_point);
            return Ok(BTreeSet::new());
        }
    };

    let resolve = |path: PathBuf| {
        path.canonicalize()
            .map_err(|source| ClassifyError::Resolve { path, source })
    };

    let node = resolve(PathBuf::from(&source))?;
    let kname = node
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_default();

    let syspath = resolve(Path::new("/sys/class/block").join(kname))?;
    let excluded = ancestry(&syspath);

    tracing::info!("installation medium {} is backed by {:?}", source, excluded);
    Ok(excluded)
}

fn is_device_source(source: &str) -> bool {
    Path::new(source).starts_with("/dev")
}

/// Enumerates the live system and classifies its disks.
pub fn enumerate(iso_mount_point: &Path) -> Result<Vec<BlockDevice>, ClassifyError> {
    let snapshot = UDev::new()
        .and_then(|mut udev| udev.snapshot())
        .map_err(ClassifyError::Udev)?;

    let excluded = install_medium(iso_mount_point)?;
    classify(&snapshot, &excluded)
}

/// Parses a saved device record file, one record per non-empty line.
pub fn parse_records(contents: &str) -> Result<Vec<BlockDevice>, ClassifyError> {
    contents
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            line.parse::<BlockDevice>()
                .map_err(|source| ClassifyError::Record {
                    line: index + 1,
                    source,
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_types::fixtures::disk;

    #[test]
    fn only_device_nodes_back_an_install_medium() {
        assert!(is_device_source("/dev/sr0"));
        assert!(is_device_source("/dev/disk/by-label/ARCH_202410"));
        assert!(!is_device_source("10.0.0.1:/srv/archiso"));
        assert!(!is_device_source("airootfs"));
        assert!(!is_device_source("/devices/sr0"));
    }

    fn names(devices: &[BlockDevice]) -> Vec<&str> {
        devices.iter().map(|d| d.kname.as_str()).collect()
    }

    #[test]
    fn keeps_each_eligible_disk_once() {
        let snapshot = vec![disk("sdb"), disk("nvme0n1"), disk("sdb"), disk("sda")];
        let found = classify(&snapshot, &BTreeSet::new()).unwrap();
        assert_eq!(names(&found), vec!["nvme0n1", "sda", "sdb"]);
    }

    #[test]
    fn excludes_ineligible_devices() {
        let mut hotplug = disk("sdc");
        hotplug.hotplug = true;

        let mut no_serial = disk("vda");
        no_serial.serial = String::new();

        let mut no_model = disk("vdb");
        no_model.model = "  ".into();

        let mut partition = disk("sda1");
        partition.kind = crate::DeviceKind::Partition;
        partition.parent = Some("sda".into());

        let snapshot = vec![
            disk("sda"),
            partition.clone(),
            hotplug.clone(),
            no_serial.clone(),
            no_model.clone(),
            disk("sdd"),
        ];

        let excluded = ["sdd".to_owned()].into_iter().collect::<BTreeSet<_>>();
        let found = classify(&snapshot, &excluded).unwrap();
        assert_eq!(names(&found), vec!["sda"]);

        assert_eq!(rejection(&partition, &excluded), Some(Rejection::NotDisk));
        assert_eq!(rejection(&hotplug, &excluded), Some(Rejection::Hotplug));
        assert_eq!(rejection(&no_serial, &excluded), Some(Rejection::NoSerial));
        assert_eq!(rejection(&no_model, &excluded), Some(Rejection::NoModel));
        assert_eq!(rejection(&disk("sdd"), &excluded), Some(Rejection::InstallMedium));
    }

    #[test]
    fn empty_candidate_set_is_an_error() {
        let mut usb = disk("sda");
        usb.hotplug = true;

        assert!(matches!(
            classify(&[usb], &BTreeSet::new()),
            Err(ClassifyError::NoCandidates)
        ));
        assert!(matches!(
            classify(&[], &BTreeSet::new()),
            Err(ClassifyError::NoCandidates)
        ));
    }

    #[test]
    fn classification_is_idempotent() {
        let snapshot = vec![disk("sdb"), disk("sda"), disk("nvme1n1")];
        let excluded = BTreeSet::new();

        let first = classify(&snapshot, &excluded).unwrap();
        let second = classify(&snapshot, &excluded).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn record_file_reports_failing_line() {
        let contents = format!("{}\n\n{}\nNAME=\"broken\n", disk("sda"), disk("sdb"));

        match parse_records(&contents) {
            Err(ClassifyError::Record { line, source }) => {
                assert_eq!(line, 4);
                assert_eq!(source, RecordError::Unterminated("NAME".into()));
            }
            other => panic!("unexpected result: {:?}", other),
        }

        let valid = format!("{}\n{}\n", disk("sda"), disk("sdb"));
        assert_eq!(parse_records(&valid).unwrap().len(), 2);
    }
}
