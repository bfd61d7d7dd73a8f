// Copyright 2021 System76 <info@system76.com>
// SPDX-License-Identifier: LGPL-3.0-only

use crate::block_types::BlockDevice;
use crate::ops::*;
use crate::{luks, lvm, partition};
use cradle::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use sys_mount::{Mount, MountFlags, UnmountFlags};

/// Carries out storage operations against the running system.
pub struct SystemOps {
    /// How long to wait after partition tables are re-read.
    pub settle_delay: Duration,
}

impl Default for SystemOps {
    fn default() -> Self {
        SystemOps {
            settle_delay: Duration::from_secs(3),
        }
    }
}

impl StorageOps for SystemOps {
    fn wipe_signatures(&mut self, disk: &Path) -> OpsResult<()> {
        partition::wipe_signatures(disk).map_err(OpsError::command("wipefs"))
    }

    fn write_partition_table(&mut self, disk: &BlockDevice) -> OpsResult<DiskPartitions> {
        partition::write_table(disk)
    }

    fn settle(&mut self) -> OpsResult<()> {
        tracing::info!("re-reading partition tables");
        let () = run_result!("partprobe").map_err(OpsError::command("partprobe"))?;
        let () = run_result!("udevadm", "settle").map_err(OpsError::command("udevadm"))?;
        thread::sleep(self.settle_delay);
        Ok(())
    }

    fn format_encrypted(&mut self, partition: &Path, key: &[u8]) -> OpsResult<()> {
        luks::format(partition, key).map_err(cryptsetup_error(partition))
    }

    fn add_passphrase(&mut self, partition: &Path, key: &[u8], passphrase: &[u8]) -> OpsResult<()> {
        luks::add_passphrase(partition, key, passphrase).map_err(cryptsetup_error(partition))
    }

    fn open_encrypted(&mut self, partition: &Path, name: &str, key: &[u8]) -> OpsResult<PathBuf> {
        luks::activate(partition, name, key).map_err(cryptsetup_error(partition))?;
        Ok(Path::new("/dev/mapper").join(name))
    }

    fn filesystem_uuid(&mut self, device: &Path) -> OpsResult<String> {
        let StdoutTrimmed(uuid) = run_result!("blkid", "-s", "UUID", "-o", "value", device)
            .map_err(OpsError::command("blkid"))?;
        Ok(uuid)
    }

    fn create_physical_volume(&mut self, device: &Path) -> OpsResult<()> {
        lvm::pv_create(device).map_err(OpsError::command("pvcreate"))
    }

    fn mirror_boot(&mut self, members: &[PathBuf]) -> OpsResult<PathBuf> {
        partition::mirror(members).map_err(OpsError::command("mdadm"))
    }

    fn create_volume_group(&mut self, name: &str, devices: &[PathBuf]) -> OpsResult<()> {
        lvm::vg_create(name, devices).map_err(OpsError::command("vgcreate"))
    }

    fn create_logical_volume(&mut self, volume: &LogicalVolume) -> OpsResult<()> {
        lvm::lv_create(volume).map_err(OpsError::command("lvcreate"))
    }

    fn create_thin_pool(&mut self, volume_group: &str, data: &str, metadata: &str) -> OpsResult<()> {
        lvm::thin_pool_convert(volume_group, data, metadata).map_err(OpsError::command("lvconvert"))
    }

    fn create_thin_volume(
        &mut self,
        volume_group: &str,
        pool: &str,
        name: &str,
        virtual_size: &str,
    ) -> OpsResult<()> {
        lvm::thin_create(volume_group, pool, name, virtual_size)
            .map_err(OpsError::command("lvcreate"))
    }

    fn format(&mut self, device: &Path, filesystem: Filesystem) -> OpsResult<()> {
        tracing::info!("formatting {:?} as {:?}", device, filesystem);
        match filesystem {
            Filesystem::Swap => {
                run_result!("mkswap", "-L", "swap", device).map_err(OpsError::command("mkswap"))
            }
            Filesystem::Btrfs { discard } => {
                let nodiscard = if discard { Vec::new() } else { vec!["--nodiscard"] };
                run_result!(
                    "mkfs.btrfs",
                    "--force",
                    "--label",
                    "root",
                    "--features",
                    "quota,free-space-tree",
                    nodiscard,
                    device
                )
                .map_err(OpsError::command("mkfs.btrfs"))
            }
            Filesystem::Vfat => run_result!("mkfs.fat", "-F", "32", "-n", "ESP", device)
                .map_err(OpsError::command("mkfs.fat")),
        }
    }

    fn enable_swap(&mut self, device: &Path) -> OpsResult<()> {
        tracing::info!("enabling swap on {:?}", device);
        run_result!("swapon", device).map_err(OpsError::command("swapon"))
    }

    fn create_subvolume(&mut self, path: &Path) -> OpsResult<()> {
        tracing::info!("creating subvolume {:?}", path);
        run_result!("btrfs", "subvolume", "create", path).map_err(OpsError::command("btrfs"))
    }

    fn mount(&mut self, spec: &MountSpec) -> OpsResult<()> {
        tracing::info!(
            "mounting {:?} at {:?} ({})",
            spec.source,
            spec.target,
            spec.options.join(",")
        );

        fs::create_dir_all(&spec.target).map_err(OpsError::io(&spec.target))?;

        let (flags, data) = split_options(&spec.options);
        Mount::builder()
            .fstype(spec.fstype)
            .flags(flags)
            .data(&data)
            .mount(&spec.source, &spec.target)
            .map_err(|source| OpsError::Mount {
                device: spec.source.clone(),
                target: spec.target.clone(),
                source,
            })?;

        Ok(())
    }

    fn unmount(&mut self, target: &Path) -> OpsResult<()> {
        tracing::info!("unmounting {:?}", target);
        sys_mount::unmount(target, UnmountFlags::empty()).map_err(|source| OpsError::Unmount {
            target: target.to_owned(),
            source,
        })
    }
}

fn cryptsetup_error(device: &Path) -> impl FnOnce(libcryptsetup_rs::LibcryptErr) -> OpsError + '_ {
    move |source| OpsError::Cryptsetup {
        device: device.to_owned(),
        source,
    }
}

/// Separates options the kernel takes as mount flags from filesystem data.
fn split_options(options: &[String]) -> (MountFlags, String) {
    let mut flags = MountFlags::empty();
    let mut data = Vec::new();

    for option in options {
        match option.as_str() {
            "nosuid" => flags |= MountFlags::NOSUID,
            "nodev" => flags |= MountFlags::NODEV,
            "noexec" => flags |= MountFlags::NOEXEC,
            "noatime" => flags |= MountFlags::NOATIME,
            "ro" => flags |= MountFlags::RDONLY,
            other => data.push(other),
        }
    }

    (flags, data.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mount_flags_are_split_from_data() {
        let options = ["nosuid", "nodev", "fmask=0137", "dmask=0027"]
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>();

        let (flags, data) = split_options(&options);
        assert!(flags.contains(MountFlags::NOSUID | MountFlags::NODEV));
        assert!(!flags.contains(MountFlags::NOEXEC));
        assert_eq!(data, "fmask=0137,dmask=0027");
    }

    #[test]
    fn btrfs_options_keep_subvolume_in_data() {
        let options = ["noatime", "compress=zstd", "ssd", "subvol=@var"]
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>();

        let (flags, data) = split_options(&options);
        assert!(flags.contains(MountFlags::NOATIME));
        assert!(!flags.contains(MountFlags::NOSUID));
        assert_eq!(data, "compress=zstd,ssd,subvol=@var");
    }
}
