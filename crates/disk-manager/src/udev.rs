// Copyright 2021 System76 <info@system76.com>
// SPDX-License-Identifier: LGPL-3.0-only

use crate::block_types::*;
use libudev::Device as UDevice;
use std::collections::BTreeSet;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

pub struct UDev {
    pub context: libudev::Context,
    pub enumerator: libudev::Enumerator,
}

impl UDev {
    /// Creates an enumerator over the `block` subsystem.
    pub fn new() -> libudev::Result<Self> {
        let context = libudev::Context::new()?;
        let mut enumerator = libudev::Enumerator::new(&context)?;
        enumerator.match_subsystem("block")?;

        Ok(UDev {
            context,
            enumerator,
        })
    }

    /// Takes an immutable snapshot of every block device, ordered by kernel name.
    pub fn snapshot(&mut self) -> libudev::Result<Vec<BlockDevice>> {
        let mut devices = self
            .enumerator
            .scan_devices()?
            .filter_map(|device| block_device(&device))
            .collect::<Vec<_>>();

        devices.sort_by(|a, b| a.kname.cmp(&b.kname));
        devices.dedup_by(|a, b| a.kname == b.kname);

        Ok(devices)
    }
}

/// Get device-specific information from a `UDevice`.
fn block_device(device: &UDevice) -> Option<BlockDevice> {
    let syspath = device.syspath()?;
    let kname = syspath.file_name()?.to_str()?.to_owned();
    let path = PathBuf::from(property(device, "DEVNAME")?);
    let name = path.file_name()?.to_str()?.to_owned();

    let sectors = ward::ward!(attribute(device, "size").and_then(|s| s.parse::<u64>().ok()), else {
        tracing::debug!("{}: does not contain a valid size", kname);
        return None;
    });

    let kind = match device.devtype().and_then(OsStr::to_str) {
        Some("disk") => DeviceKind::Disk,
        Some("partition") => DeviceKind::Partition,
        _ => DeviceKind::Other,
    };

    let parent = parents(syspath)
        .next()
        .and_then(|parent| parent.file_name().and_then(OsStr::to_str).map(String::from));

    let hotplug = attribute(device, "removable") == Some("1") || property(device, "ID_BUS") == Some("usb");

    let serial = property(device, "ID_SERIAL_SHORT")
        .or_else(|| property(device, "ID_SERIAL"))
        .unwrap_or_default()
        .trim()
        .to_owned();

    let sector_size = attribute(device, "queue/logical_block_size")
        .and_then(|size| size.parse::<u64>().ok())
        .unwrap_or(512);

    Some(BlockDevice {
        name,
        kname,
        parent,
        path,
        size: sectors * 512,
        kind,
        hotplug,
        // Unknown rotation disables SSD tuning rather than enabling it.
        rotational: attribute(device, "queue/rotational") != Some("0"),
        discard_zeroes: attribute(device, "queue/discard_zeroes_data") == Some("1"),
        serial,
        model: property(device, "ID_MODEL").unwrap_or_default().trim().to_owned(),
        fstype: property(device, "ID_FS_TYPE").map(String::from),
        sector_size,
    })
}

/// Automatically convert `UDevice` properties to Rust strings.
fn property<'a>(device: &'a UDevice, property: &str) -> Option<&'a str> {
    device.property_value(property).and_then(OsStr::to_str)
}

fn attribute<'a>(device: &'a UDevice, attribute: &str) -> Option<&'a str> {
    device
        .attribute_value(attribute)
        .and_then(OsStr::to_str)
        .map(str::trim)
}

/// Collects the kernel names of a device and of every device it is stacked on.
pub fn ancestry(syspath: &Path) -> BTreeSet<String> {
    let mut seen = BTreeSet::new();
    let mut queue = vec![syspath.to_owned()];

    while let Some(path) = queue.pop() {
        if let Some(name) = path.file_name().and_then(OsStr::to_str) {
            if seen.insert(name.to_owned()) {
                queue.extend(parents(&path));
            }
        }
    }

    seen
}

/// Locate the parents of the given device.
///
/// Some devices define their parents under `{DEV}/slaves`, while others can be determined
/// by checking if the parent directory contains a `queue` sub-directory.
pub fn parents(device_path: &Path) -> impl Iterator<Item = PathBuf> {
    let parents: Box<dyn Iterator<Item = PathBuf>> = match device_path.join("slaves").read_dir() {
        Ok(parents) => {
            let iterator = parents
                .filter_map(Result::ok)
                .filter_map(|parent| parent.path().canonicalize().ok())
                .filter(|path| path.components().any(|c| c.as_os_str() == "block"));

            Box::new(iterator)
        }
        Err(_) => Box::new(std::iter::empty()),
    };

    let parent = device_path.parent().and_then(|parent| {
        if parent.join("queue").exists() {
            Some(parent.to_owned())
        } else {
            None
        }
    });

    parents.chain(parent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn ancestry_follows_partitions_and_slaves() {
        let sys = tempfile::tempdir().unwrap();
        let block = sys.path().join("devices/block");

        let sdb = block.join("sdb");
        let sdb1 = sdb.join("sdb1");
        fs::create_dir_all(sdb.join("queue")).unwrap();
        fs::create_dir_all(&sdb1).unwrap();

        let dm = block.join("dm-0");
        fs::create_dir_all(dm.join("slaves")).unwrap();
        std::os::unix::fs::symlink(&sdb1, dm.join("slaves/sdb1")).unwrap();

        let names = ancestry(&dm);
        let expected = ["dm-0", "sdb", "sdb1"]
            .iter()
            .map(|s| s.to_string())
            .collect::<BTreeSet<_>>();

        assert_eq!(names, expected);
    }

    #[test]
    fn ancestry_of_plain_disk_is_itself() {
        let sys = tempfile::tempdir().unwrap();
        let sda = sys.path().join("block/sda");
        fs::create_dir_all(sda.join("queue")).unwrap();

        assert_eq!(ancestry(&sda).into_iter().collect::<Vec<_>>(), vec!["sda"]);
    }
}
