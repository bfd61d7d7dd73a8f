// Copyright 2021 System76 <info@system76.com>
// SPDX-License-Identifier: LGPL-3.0-only

//! The privileged storage operations every provisioning stage is built on.
//!
//! Stages only decide *what* to do; [`StorageOps`] carries it out. The live
//! implementation is [`crate::system::SystemOps`].

use crate::block_types::BlockDevice;
use libcryptsetup_rs::LibcryptErr;
use std::io;
use std::path::{Path, PathBuf};

pub type OpsResult<T> = Result<T, OpsError>;

#[derive(Debug, Error)]
pub enum OpsError {
    #[error("`{command}` failed")]
    Command {
        command: &'static str,
        #[source]
        source: cradle::Error,
    },
    #[error("cryptsetup failed on {device:?}")]
    Cryptsetup {
        device: PathBuf,
        #[source]
        source: LibcryptErr,
    },
    #[error("failed to write partition table to {device:?}")]
    PartitionTable {
        device: PathBuf,
        #[source]
        source: gptman::Error,
    },
    #[error("{device:?} is too small to partition")]
    DiskTooSmall { device: PathBuf },
    #[error("failed to mount {device:?} at {target:?}")]
    Mount {
        device: PathBuf,
        target: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to unmount {target:?}")]
    Unmount {
        target: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("I/O error on {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("no partitions were provided to build volumes on")]
    NothingToBuild,
}

impl OpsError {
    pub fn command(command: &'static str) -> impl FnOnce(cradle::Error) -> Self {
        move |source| OpsError::Command { command, source }
    }

    pub fn io(path: &Path) -> impl FnOnce(io::Error) -> Self + '_ {
        move |source| OpsError::Io {
            path: path.to_owned(),
            source,
        }
    }
}

/// The two partitions written to every provisioned disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiskPartitions {
    pub disk: PathBuf,
    /// Candidate EFI system partition.
    pub boot: PathBuf,
    /// Partition which becomes (or is encrypted into) a physical volume.
    pub system: PathBuf,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Filesystem {
    Swap,
    /// `discard: false` formats without issuing discards.
    Btrfs { discard: bool },
    Vfat,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Size {
    /// An absolute size such as `17G` (`lvcreate -L`).
    Absolute(String),
    /// An extent expression such as `50%FREE` (`lvcreate -l`).
    Extents(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogicalVolume {
    pub volume_group: String,
    pub name: String,
    pub size: Size,
    /// Mirror or stripe arguments, empty for a linear volume.
    pub redundancy: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MountSpec {
    pub source: PathBuf,
    pub target: PathBuf,
    pub fstype: &'static str,
    pub options: Vec<String>,
}

pub trait StorageOps {
    /// Removes every filesystem, RAID, and partition table signature from a disk.
    fn wipe_signatures(&mut self, disk: &Path) -> OpsResult<()>;

    /// Writes a fresh GPT holding a boot and a system partition.
    fn write_partition_table(&mut self, disk: &BlockDevice) -> OpsResult<DiskPartitions>;

    /// Has the kernel re-read partition tables, and waits for the nodes to appear.
    fn settle(&mut self) -> OpsResult<()>;

    fn format_encrypted(&mut self, partition: &Path, key: &[u8]) -> OpsResult<()>;

    fn add_passphrase(&mut self, partition: &Path, key: &[u8], passphrase: &[u8]) -> OpsResult<()>;

    /// Opens an encrypted partition, returning the mapped device path.
    fn open_encrypted(&mut self, partition: &Path, name: &str, key: &[u8]) -> OpsResult<PathBuf>;

    fn filesystem_uuid(&mut self, device: &Path) -> OpsResult<String>;

    fn create_physical_volume(&mut self, device: &Path) -> OpsResult<()>;

    /// Mirrors boot partitions at the block level, returning the array device.
    fn mirror_boot(&mut self, members: &[PathBuf]) -> OpsResult<PathBuf>;

    fn create_volume_group(&mut self, name: &str, devices: &[PathBuf]) -> OpsResult<()>;

    fn create_logical_volume(&mut self, volume: &LogicalVolume) -> OpsResult<()>;

    /// Binds a data and a metadata volume into a thin pool named after `data`.
    fn create_thin_pool(&mut self, volume_group: &str, data: &str, metadata: &str) -> OpsResult<()>;

    fn create_thin_volume(
        &mut self,
        volume_group: &str,
        pool: &str,
        name: &str,
        virtual_size: &str,
    ) -> OpsResult<()>;

    fn format(&mut self, device: &Path, filesystem: Filesystem) -> OpsResult<()>;

    fn enable_swap(&mut self, device: &Path) -> OpsResult<()>;

    fn create_subvolume(&mut self, path: &Path) -> OpsResult<()>;

    fn mount(&mut self, spec: &MountSpec) -> OpsResult<()>;

    fn unmount(&mut self, target: &Path) -> OpsResult<()>;
}

#[cfg(any(test, feature = "testing"))]
pub mod testing {
    use super::*;

    /// Records each operation as a line of text instead of touching devices.
    #[derive(Default)]
    pub struct Recorder {
        pub trace: Vec<String>,
        /// The first operation whose line starts with this prefix fails.
        pub fail_on: Option<String>,
    }

    impl Recorder {
        pub fn failing_on(prefix: &str) -> Self {
            Recorder {
                fail_on: Some(prefix.to_owned()),
                ..Recorder::default()
            }
        }

        pub fn position(&self, prefix: &str) -> usize {
            self.trace
                .iter()
                .position(|line| line.starts_with(prefix))
                .unwrap_or_else(|| panic!("`{}` not in trace: {:#?}", prefix, self.trace))
        }

        pub fn lines(&self, prefix: &str) -> Vec<&str> {
            self.trace
                .iter()
                .filter(|line| line.starts_with(prefix))
                .map(String::as_str)
                .collect()
        }

        fn push(&mut self, line: String) -> OpsResult<()> {
            let fails = self
                .fail_on
                .as_deref()
                .map_or(false, |prefix| line.starts_with(prefix));

            self.trace.push(line.clone());

            if fails {
                self.fail_on = None;
                return Err(OpsError::Io {
                    path: PathBuf::from(line),
                    source: io::Error::new(io::ErrorKind::Other, "operation failed"),
                });
            }

            Ok(())
        }
    }

    impl StorageOps for Recorder {
        fn wipe_signatures(&mut self, disk: &Path) -> OpsResult<()> {
            self.push(format!("wipe {}", disk.display()))
        }

        fn write_partition_table(&mut self, disk: &BlockDevice) -> OpsResult<DiskPartitions> {
            self.push(format!("partition {}", disk.path.display()))?;
            Ok(DiskPartitions {
                disk: disk.path.clone(),
                boot: disk.partition_path(1),
                system: disk.partition_path(2),
            })
        }

        fn settle(&mut self) -> OpsResult<()> {
            self.push("settle".into())
        }

        fn format_encrypted(&mut self, partition: &Path, key: &[u8]) -> OpsResult<()> {
            self.push(format!("luksFormat {} key={}", partition.display(), key.len()))
        }

        fn add_passphrase(&mut self, partition: &Path, _key: &[u8], passphrase: &[u8]) -> OpsResult<()> {
            let passphrase = String::from_utf8_lossy(passphrase);
            self.push(format!("luksAddKey {} {}", partition.display(), passphrase))
        }

        fn open_encrypted(&mut self, partition: &Path, name: &str, _key: &[u8]) -> OpsResult<PathBuf> {
            self.push(format!("luksOpen {} {}", partition.display(), name))?;
            Ok(Path::new("/dev/mapper").join(name))
        }

        fn filesystem_uuid(&mut self, device: &Path) -> OpsResult<String> {
            let name = device.file_name().unwrap_or_default().to_string_lossy();
            Ok(format!("uuid-{}", name))
        }

        fn create_physical_volume(&mut self, device: &Path) -> OpsResult<()> {
            self.push(format!("pvcreate {}", device.display()))
        }

        fn mirror_boot(&mut self, members: &[PathBuf]) -> OpsResult<PathBuf> {
            let members = members.iter().map(|m| m.display().to_string()).collect::<Vec<_>>();
            self.push(format!("mdadm {}", members.join(" ")))?;
            Ok(PathBuf::from("/dev/md/esp"))
        }

        fn create_volume_group(&mut self, name: &str, devices: &[PathBuf]) -> OpsResult<()> {
            let devices = devices.iter().map(|d| d.display().to_string()).collect::<Vec<_>>();
            self.push(format!("vgcreate {} {}", name, devices.join(" ")))
        }

        fn create_logical_volume(&mut self, volume: &LogicalVolume) -> OpsResult<()> {
            let size = match &volume.size {
                Size::Absolute(size) => format!("-L {}", size),
                Size::Extents(extents) => format!("-l {}", extents),
            };

            let mut line = format!("lvcreate {} {} {}", volume.name, volume.volume_group, size);
            if !volume.redundancy.is_empty() {
                line.push(' ');
                line.push_str(&volume.redundancy.join(" "));
            }

            self.push(line)
        }

        fn create_thin_pool(&mut self, volume_group: &str, data: &str, metadata: &str) -> OpsResult<()> {
            self.push(format!("thinpool {}/{} meta={}", volume_group, data, metadata))
        }

        fn create_thin_volume(
            &mut self,
            volume_group: &str,
            pool: &str,
            name: &str,
            virtual_size: &str,
        ) -> OpsResult<()> {
            self.push(format!("thin {} {}/{} -V {}", name, volume_group, pool, virtual_size))
        }

        fn format(&mut self, device: &Path, filesystem: Filesystem) -> OpsResult<()> {
            self.push(format!("mkfs {} {:?}", device.display(), filesystem))
        }

        fn enable_swap(&mut self, device: &Path) -> OpsResult<()> {
            self.push(format!("swapon {}", device.display()))
        }

        fn create_subvolume(&mut self, path: &Path) -> OpsResult<()> {
            self.push(format!("subvolume {}", path.display()))
        }

        fn mount(&mut self, spec: &MountSpec) -> OpsResult<()> {
            self.push(format!(
                "mount {} {} {} {}",
                spec.source.display(),
                spec.target.display(),
                spec.fstype,
                spec.options.join(",")
            ))
        }

        fn unmount(&mut self, target: &Path) -> OpsResult<()> {
            self.push(format!("umount {}", target.display()))
        }
    }
}
