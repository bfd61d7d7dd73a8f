// Copyright 2021 System76 <info@system76.com>
// SPDX-License-Identifier: LGPL-3.0-only

use crate::block_types::{BlockDevice, Capabilities};
use std::fs;
use std::io;

/// Share of the volume group's free space given to the thin pool when unspecified.
pub const DEFAULT_POOL_ALLOCATION: &str = "50%FREE";

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("cannot plan storage without any device")]
    NoDevices,
    #[error("failed to read /proc/meminfo")]
    MemInfo(#[source] io::Error),
    #[error("memory size could not be determined")]
    Memory(#[from] MemoryError),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MemoryError {
    #[error("MemTotal is missing from /proc/meminfo")]
    Missing,
    #[error("memory size `{0}` is not a number")]
    Invalid(String),
    #[error("memory unit `{0}` is not recognised")]
    Unit(String),
}

/// Block-level redundancy, derived only from how many devices are in use.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Redundancy {
    None,
    Mirror,
    Raid5,
}

impl Redundancy {
    pub fn for_devices(count: usize) -> Self {
        match count {
            0 | 1 => Redundancy::None,
            2 => Redundancy::Mirror,
            _ => Redundancy::Raid5,
        }
    }

    /// `lvcreate` arguments which spread a volume over `devices` physical volumes.
    pub fn lvcreate_args(self, devices: usize) -> Vec<String> {
        match self {
            Redundancy::None => Vec::new(),
            Redundancy::Mirror => vec!["--type".into(), "raid1".into(), "--mirrors".into(), "1".into()],
            Redundancy::Raid5 => vec![
                "--type".into(),
                "raid5".into(),
                "--stripes".into(),
                devices.saturating_sub(1).to_string(),
            ],
        }
    }
}

#[derive(Clone, Debug)]
pub struct StoragePlan {
    pub devices: Vec<BlockDevice>,
    pub swap_gib: u64,
    /// Passed verbatim to `lvcreate -l`; malformed values fail there.
    pub pool_allocation: String,
    pub redundancy: Redundancy,
}

impl StoragePlan {
    pub fn new(
        devices: Vec<BlockDevice>,
        swap_gib: u64,
        pool_allocation: Option<&str>,
    ) -> Result<Self, PlanError> {
        if devices.is_empty() {
            return Err(PlanError::NoDevices);
        }

        let redundancy = Redundancy::for_devices(devices.len());
        let pool_allocation = pool_allocation
            .unwrap_or(DEFAULT_POOL_ALLOCATION)
            .to_owned();

        tracing::info!(
            "planned {} device(s) with {:?} redundancy, {} GiB swap, thin pool of {}",
            devices.len(),
            redundancy,
            swap_gib,
            pool_allocation
        );

        Ok(StoragePlan {
            devices,
            swap_gib,
            pool_allocation,
            redundancy,
        })
    }

    /// Plans against the memory size of the running system.
    pub fn for_system(
        devices: Vec<BlockDevice>,
        pool_allocation: Option<&str>,
    ) -> Result<Self, PlanError> {
        let meminfo = fs::read_to_string("/proc/meminfo").map_err(PlanError::MemInfo)?;
        let swap_gib = swap_size_gib(mem_total(&meminfo)?)?;
        Self::new(devices, swap_gib, pool_allocation)
    }

    /// Capabilities shared by every device in the plan.
    pub fn capabilities(&self) -> Capabilities {
        self.devices
            .iter()
            .fold(Capabilities::all(), |caps, device| caps & device.capabilities())
    }

    pub fn redundancy_args(&self) -> Vec<String> {
        self.redundancy.lvcreate_args(self.devices.len())
    }
}

/// The `MemTotal` value of a `/proc/meminfo` document, with its unit.
pub fn mem_total(meminfo: &str) -> Result<&str, MemoryError> {
    meminfo
        .lines()
        .find_map(|line| line.strip_prefix("MemTotal:"))
        .map(str::trim)
        .ok_or(MemoryError::Missing)
}

/// Swap size in whole GiB: memory rounded up to GiB, plus one.
///
/// Accepts `kB`, `MB` and `GB` units in any case; a bare number is taken as kB.
pub fn swap_size_gib(reported: &str) -> Result<u64, MemoryError> {
    let mut parts = reported.split_whitespace();

    let value = parts
        .next()
        .and_then(|value| value.parse::<u64>().ok())
        .ok_or_else(|| MemoryError::Invalid(reported.to_owned()))?;

    let gib = match parts.next().map(str::to_ascii_lowercase).as_deref() {
        None | Some("kb") => div_ceil(value, 1024 * 1024),
        Some("mb") => div_ceil(value, 1024),
        Some("gb") => value,
        Some(unit) => return Err(MemoryError::Unit(unit.to_owned())),
    };

    Ok(gib + 1)
}

fn div_ceil(value: u64, divisor: u64) -> u64 {
    (value + divisor - 1) / divisor
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_types::fixtures::disk;

    fn devices(count: usize) -> Vec<BlockDevice> {
        (0..count).map(|i| disk(&format!("sd{}", (b'a' + i as u8) as char))).collect()
    }

    #[test]
    fn redundancy_follows_device_count() {
        assert_eq!(Redundancy::for_devices(1), Redundancy::None);
        assert_eq!(Redundancy::for_devices(2), Redundancy::Mirror);
        assert_eq!(Redundancy::for_devices(3), Redundancy::Raid5);
        assert_eq!(Redundancy::for_devices(5), Redundancy::Raid5);

        for count in [1, 2, 3, 5] {
            let plan = StoragePlan::new(devices(count), 9, None).unwrap();
            assert_eq!(plan.redundancy, Redundancy::for_devices(count));
        }
    }

    #[test]
    fn single_device_gets_no_redundancy_flags() {
        let plan = StoragePlan::new(devices(1), 9, None).unwrap();
        assert!(plan.redundancy_args().is_empty());
    }

    #[test]
    fn redundancy_flags_scale_with_devices() {
        let mirror = StoragePlan::new(devices(2), 9, None).unwrap();
        assert_eq!(mirror.redundancy_args(), vec!["--type", "raid1", "--mirrors", "1"]);

        let raid5 = StoragePlan::new(devices(5), 9, None).unwrap();
        assert_eq!(raid5.redundancy_args(), vec!["--type", "raid5", "--stripes", "4"]);
    }

    #[test]
    fn swap_size_normalises_units() {
        assert_eq!(swap_size_gib("16777216 kB"), Ok(17));
        assert_eq!(swap_size_gib("8 gB"), Ok(9));
        assert_eq!(swap_size_gib("16384 MB"), Ok(17));
        assert_eq!(swap_size_gib("16385 MB"), Ok(18));
        assert_eq!(swap_size_gib("16000000 kB"), Ok(17));
        assert_eq!(swap_size_gib("8 TB"), Err(MemoryError::Unit("tb".into())));
        assert_eq!(swap_size_gib("lots"), Err(MemoryError::Invalid("lots".into())));
    }

    #[test]
    fn reads_mem_total() {
        let meminfo = "MemTotal:       16777216 kB\nMemFree:         1234 kB\n";
        assert_eq!(mem_total(meminfo), Ok("16777216 kB"));
        assert_eq!(swap_size_gib(mem_total(meminfo).unwrap()), Ok(17));
        assert_eq!(mem_total("MemFree: 1 kB"), Err(MemoryError::Missing));
    }

    #[test]
    fn pool_allocation_is_passed_verbatim() {
        let default = StoragePlan::new(devices(1), 9, None).unwrap();
        assert_eq!(default.pool_allocation, DEFAULT_POOL_ALLOCATION);

        let custom = StoragePlan::new(devices(1), 9, Some("not-a-percentage")).unwrap();
        assert_eq!(custom.pool_allocation, "not-a-percentage");
    }

    #[test]
    fn empty_plan_is_rejected() {
        assert!(matches!(
            StoragePlan::new(Vec::new(), 9, None),
            Err(PlanError::NoDevices)
        ));
    }

    #[test]
    fn capabilities_are_a_conjunction() {
        let mut plan = StoragePlan::new(devices(2), 9, None).unwrap();
        assert_eq!(plan.capabilities(), Capabilities::all());

        plan.devices[1].rotational = true;
        assert_eq!(plan.capabilities(), Capabilities::DISCARD_ZEROES);
    }
}
