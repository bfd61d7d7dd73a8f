// Copyright 2021 System76 <info@system76.com>
// SPDX-License-Identifier: GPL-3.0-only

use anyhow::Context;
use keystone_disk_manager::classify::{self, ISO_MOUNT_POINT};
use keystone_disk_manager::BlockDevice;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(clap::Args, Debug)]
pub struct DiskArgs {
    /// Print device records instead of a summary
    #[arg(long, conflicts_with = "json")]
    pub records: bool,

    /// Print the candidates as JSON
    #[arg(long)]
    pub json: bool,

    /// Classify a saved device record file instead of the running system
    #[arg(long, value_name = "FILE")]
    pub from: Option<PathBuf>,
}

pub fn run(args: DiskArgs) -> anyhow::Result<()> {
    let devices = match args.from {
        Some(path) => from_records(&path)?,
        None => classify::enumerate(Path::new(ISO_MOUNT_POINT))
            .context("failed to classify block devices")?,
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&devices)?);
    } else if args.records {
        print!("{}", records(&devices));
    } else {
        for device in &devices {
            println!("{}", summary(device));
        }
    }

    Ok(())
}

fn from_records(path: &Path) -> anyhow::Result<Vec<BlockDevice>> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("failed to read {:?}", path))?;
    let snapshot = classify::parse_records(&contents)
        .with_context(|| format!("invalid device records in {:?}", path))?;
    classify::classify(&snapshot, &BTreeSet::new()).context("failed to classify block devices")
}

/// One record per line, in the format `--from` reads back.
pub fn records(devices: &[BlockDevice]) -> String {
    devices.iter().map(|device| format!("{}\n", device)).collect()
}

fn summary(device: &BlockDevice) -> String {
    format!(
        "{}\t{}\t{}\t{}\t{}",
        device.path.display(),
        human_size(device.size),
        if device.rotational { "hdd" } else { "ssd" },
        device.model,
        device.serial
    )
}

fn human_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB", "PiB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit + 1 < UNITS.len() {
        size /= 1024.0;
        unit += 1;
    }

    format!("{:.1} {}", size, UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;

    const RECORDS: &str = concat!(
        r#"NAME="sda" KNAME="sda" PKNAME="" PATH="/dev/sda" TYPE="disk" SIZE="512110190592" "#,
        r#"HOTPLUG="0" ROTA="0" DISC-ZERO="1" SERIAL="S4EWNX0R" MODEL="Samsung\x20SSD" FSTYPE="" LOG-SEC="512""#,
        "\n",
        r#"NAME="sdb" KNAME="sdb" PKNAME="" PATH="/dev/sdb" TYPE="disk" SIZE="15931539456" "#,
        r#"HOTPLUG="1" ROTA="1" DISC-ZERO="0" SERIAL="USB123" MODEL="Flash" FSTYPE="iso9660" LOG-SEC="512""#,
        "\n",
    );

    #[test]
    fn classifies_saved_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devices");
        fs::write(&path, RECORDS).unwrap();

        let devices = from_records(&path).unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].kname, "sda");
        assert_eq!(devices[0].model, "Samsung SSD");

        let reparsed = classify::parse_records(&records(&devices)).unwrap();
        assert_eq!(reparsed, devices);
    }

    #[test]
    fn sizes_are_human_readable() {
        assert_eq!(human_size(512), "512.0 B");
        assert_eq!(human_size(1 << 30), "1.0 GiB");
        assert_eq!(human_size(512_110_190_592), "476.9 GiB");
    }
}
