// Copyright 2021 System76 <info@system76.com>
// SPDX-License-Identifier: GPL-3.0-only

//! Provisions the disks from the live environment, installs a base system
//! onto them, and hands over to `target` inside the new root.

use crate::config::{self, Defaults};
use crate::disk;
use crate::PreconditionFailed;
use anyhow::Context;
use cradle::prelude::*;
use keystone_disk_manager::classify::{self, ISO_MOUNT_POINT};
use keystone_disk_manager::compose::{self, MountTable, TARGET};
use keystone_disk_manager::encrypt::{self, Encryption, EncryptionSettings};
use keystone_disk_manager::ops::StorageOps;
use keystone_disk_manager::plan::StoragePlan;
use keystone_disk_manager::system::SystemOps;
use keystone_disk_manager::volumes::{self, VolumeTopology};
use keystone_disk_manager::{mounts, partition};
use os_release::OsRelease;
use std::fs;
use std::path::{Path, PathBuf};

/// Device records of the disks being provisioned.
pub const RECORDS_PATH: &str = "/tmp/keystone/devices";

/// Where the binary is installed in the target before re-invoking it.
const TARGET_BINARY: &str = "/usr/local/bin/keystone";

const BASE_PACKAGES: &[&str] = &[
    "base",
    "linux",
    "linux-firmware",
    "btrfs-progs",
    "lvm2",
    "mdadm",
    "cryptsetup",
    "dosfstools",
    "sbctl",
    "sudo",
];

#[derive(clap::Args, Debug)]
pub struct SetupArgs {
    /// Encrypt the system partitions
    #[arg(short = 'E')]
    pub encrypt: bool,

    /// Passphrase, or a file holding it, enrolled as a second unlock factor
    #[arg(short = 'K', value_name = "KEYFILE_OR_PASSPHRASE")]
    pub key: Option<String>,

    #[arg(short = 'H')]
    pub hostname: Option<String>,

    #[arg(short = 'N')]
    pub fullname: Option<String>,

    #[arg(short = 'U')]
    pub username: Option<String>,

    /// Share of the volume group given to the thin pool, as `lvcreate -l` takes it
    #[arg(short = 'P', value_name = "EXTENTS")]
    pub pool: Option<String>,

    #[arg(short = 'L')]
    pub locale: Option<String>,

    #[arg(short = 'R', value_name = "TIMEZONE")]
    pub timezone: Option<String>,

    /// Skip provisioning and install into the filesystems already mounted at /mnt
    #[arg(short = 'M')]
    pub mounted: bool,
}

/// Resolved settings of a setup run.
#[derive(Debug)]
pub struct Settings {
    pub encrypt: bool,
    pub passphrase: Option<Vec<u8>>,
    pub hostname: String,
    pub fullname: Option<String>,
    pub username: Option<String>,
    pub pool: Option<String>,
    pub locale: String,
    pub timezone: String,
    pub mounted: bool,
    pub packages: Vec<String>,
}

impl Settings {
    pub fn resolve(args: SetupArgs, defaults: &Defaults) -> anyhow::Result<Self> {
        let passphrase = args.key.as_deref().map(passphrase).transpose()?;

        Ok(Settings {
            encrypt: args.encrypt || defaults.encrypt,
            passphrase,
            hostname: config::pick(args.hostname, &defaults.hostname, config::DEFAULT_HOSTNAME),
            fullname: args.fullname.or_else(|| defaults.fullname.clone()),
            username: args.username.or_else(|| defaults.username.clone()),
            pool: args.pool.or_else(|| defaults.pool.clone()),
            locale: config::pick(args.locale, &defaults.locale, config::DEFAULT_LOCALE),
            timezone: config::pick(args.timezone, &defaults.timezone, config::DEFAULT_TIMEZONE),
            mounted: args.mounted,
            packages: defaults.packages.clone(),
        })
    }

    /// Arguments which carry these settings over to `keystone target`.
    pub fn target_args(&self) -> Vec<String> {
        let mut args = vec!["target".to_owned()];
        if self.encrypt {
            args.push("-E".into());
        }

        let mut push = |flag: &str, value: Option<&str>| {
            if let Some(value) = value {
                args.push(flag.to_owned());
                args.push(value.to_owned());
            }
        };

        push("-H", Some(self.hostname.as_str()));
        push("-N", self.fullname.as_deref());
        push("-U", self.username.as_deref());
        push("-L", Some(self.locale.as_str()));
        push("-R", Some(self.timezone.as_str()));

        args
    }
}

/// `-K` names a file holding the passphrase if such a file exists; otherwise it is the passphrase.
fn passphrase(value: &str) -> anyhow::Result<Vec<u8>> {
    let path = Path::new(value);
    if path.is_file() {
        let mut contents =
            fs::read(path).with_context(|| format!("failed to read passphrase from {:?}", path))?;
        while contents.last() == Some(&b'\n') {
            contents.pop();
        }
        return Ok(contents);
    }

    Ok(value.as_bytes().to_vec())
}

/// Everything the provisioning stages produced, passed on to later steps.
pub struct Provisioned {
    pub plan: StoragePlan,
    pub encryption: Encryption,
    pub topology: VolumeTopology,
    pub mounts: MountTable,
}

pub fn run(args: SetupArgs, defaults: &Defaults) -> anyhow::Result<()> {
    let settings = Settings::resolve(args, defaults)?;
    let target = Path::new(TARGET);

    let provisioned = if settings.mounted {
        let mounted = mounts::is_mount_point(target)
            .map_err(|why| anyhow::anyhow!("{}", why))
            .context("failed to read the mount table")?;

        if !mounted {
            return Err(PreconditionFailed(format!("{} is not a mounted target", TARGET)).into());
        }

        tracing::info!("installing into the existing mounts at {}", TARGET);
        None
    } else {
        let devices = classify::enumerate(Path::new(ISO_MOUNT_POINT))
            .context("failed to classify block devices")?;
        save_records(Path::new(RECORDS_PATH), &disk::records(&devices))?;

        let plan = StoragePlan::for_system(devices, settings.pool.as_deref())
            .context("failed to plan storage")?;

        let encryption =
            EncryptionSettings::new(settings.encrypt, settings.passphrase.as_deref());
        let provisioned = provision(&mut SystemOps::default(), plan, &encryption, target)?;
        tracing::info!(
            "provisioned {:?} over {} device(s), {} encrypted, root on {:?}",
            provisioned.plan.redundancy,
            provisioned.topology.physical_volumes.len(),
            provisioned.encryption.bindings.len(),
            provisioned.topology.root
        );

        Some(provisioned)
    };

    bootstrap(target, &settings.packages)?;

    let fstab = match provisioned.as_ref() {
        Some(provisioned) => provisioned.mounts.fstab(),
        None => generate_fstab(target)?,
    };

    let fstab_path = mounts::within(target, "/etc/fstab");
    fs::write(&fstab_path, fstab).with_context(|| format!("failed to write {:?}", fstab_path))?;

    let release = OsRelease::new_from(mounts::within(target, "/etc/os-release"))
        .context("no system was installed into the target")?;
    tracing::info!("installed {} into {}", release.pretty_name, TARGET);

    configure_target(target, &settings)
}

/// Partitions, encrypts, and assembles the storage stack, then mounts it at `target`.
///
/// The key is written before the first disk is wiped.
pub fn provision<O: StorageOps>(
    ops: &mut O,
    plan: StoragePlan,
    encryption_settings: &EncryptionSettings,
    target: &Path,
) -> anyhow::Result<Provisioned> {
    let key = encrypt::generate_key(encryption_settings).context("failed to write the disk key")?;

    let partitions =
        partition::partition_disks(ops, &plan).context("failed to partition disks")?;

    let encryption = encrypt::prepare(ops, &partitions, encryption_settings, key)
        .context("failed to encrypt system partitions")?;

    let physical_volumes = encryption.physical_volumes(&partitions);
    let topology = volumes::build(ops, &plan, &partitions, &physical_volumes)
        .context("failed to build logical volumes")?;

    let mounts = compose::compose(ops, plan.capabilities(), &topology, target)
        .context("failed to compose filesystems")?;

    encryption
        .install_into(target)
        .context("failed to install encryption artifacts")?;

    Ok(Provisioned {
        plan,
        encryption,
        topology,
        mounts,
    })
}

fn save_records(path: &Path, records: &str) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("failed to create {:?}", parent))?;
    }

    fs::write(path, records).with_context(|| format!("failed to write {:?}", path))
}

fn bootstrap(target: &Path, extra: &[String]) -> anyhow::Result<()> {
    let mut packages = BASE_PACKAGES
        .iter()
        .map(|package| package.to_string())
        .collect::<Vec<_>>();
    packages.extend(extra.iter().cloned());

    tracing::info!("bootstrapping {} packages into {:?}", packages.len(), target);
    run_result!("pacstrap", "-K", target, packages).context("pacstrap failed")
}

fn generate_fstab(target: &Path) -> anyhow::Result<String> {
    let StdoutUntrimmed(fstab) = run_result!("genfstab", "-U", target).context("genfstab failed")?;
    Ok(fstab)
}

fn configure_target(target: &Path, settings: &Settings) -> anyhow::Result<()> {
    let binary = std::env::current_exe().context("failed to locate the running binary")?;
    let installed: PathBuf = mounts::within(target, TARGET_BINARY);

    if let Some(parent) = installed.parent() {
        fs::create_dir_all(parent).with_context(|| format!("failed to create {:?}", parent))?;
    }

    fs::copy(&binary, &installed)
        .with_context(|| format!("failed to copy {:?} to {:?}", binary, installed))?;

    tracing::info!("configuring the installed system");
    run_result!("arch-chroot", target, TARGET_BINARY, settings.target_args())
        .context("target configuration failed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use keystone_disk_manager::fixtures::disk;
    use keystone_disk_manager::ops::testing::Recorder;

    fn args() -> SetupArgs {
        SetupArgs {
            encrypt: false,
            key: None,
            hostname: None,
            fullname: None,
            username: Some("ada".into()),
            pool: None,
            locale: None,
            timezone: Some("Europe/London".into()),
            mounted: false,
        }
    }

    #[test]
    fn flags_override_defaults() {
        let defaults = Defaults {
            hostname: Some("site".into()),
            username: Some("admin".into()),
            pool: Some("70%FREE".into()),
            encrypt: true,
            ..Defaults::default()
        };

        let settings = Settings::resolve(args(), &defaults).unwrap();
        assert!(settings.encrypt);
        assert_eq!(settings.hostname, "site");
        assert_eq!(settings.username.as_deref(), Some("ada"));
        assert_eq!(settings.pool.as_deref(), Some("70%FREE"));
        assert_eq!(settings.locale, config::DEFAULT_LOCALE);
        assert_eq!(settings.timezone, "Europe/London");
    }

    #[test]
    fn passphrase_comes_from_a_file_when_one_exists() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("passphrase");
        fs::write(&file, "correct horse\n").unwrap();

        assert_eq!(passphrase(file.to_str().unwrap()).unwrap(), b"correct horse");
        assert_eq!(passphrase("not a file").unwrap(), b"not a file");
    }

    #[test]
    fn target_arguments_carry_settings_over() {
        let mut args = args();
        args.encrypt = true;
        args.key = Some("literal".into());
        let settings = Settings::resolve(args, &Defaults::default()).unwrap();

        assert_eq!(
            settings.target_args(),
            vec![
                "target",
                "-E",
                "-H",
                config::DEFAULT_HOSTNAME,
                "-U",
                "ada",
                "-L",
                config::DEFAULT_LOCALE,
                "-R",
                "Europe/London"
            ]
        );
    }

    #[test]
    fn records_are_saved_for_later_stages() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keystone/devices");
        save_records(&path, "NAME=\"sda\"\n").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "NAME=\"sda\"\n");
    }

    fn two_disk_plan() -> StoragePlan {
        StoragePlan::new(vec![disk("sda"), disk("nvme0n1")], 9, None).unwrap()
    }

    #[test]
    fn key_is_written_before_any_disk_is_wiped() {
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("root.key");
        let fragment_path = dir.path().join("crypttab");
        let target = dir.path().join("mnt");
        let settings = EncryptionSettings {
            enabled: true,
            passphrase: None,
            key_path: &key_path,
            fragment_path: &fragment_path,
        };

        // Stop at the first wipe and look at what exists by then.
        let mut ops = Recorder::failing_on("wipe");
        assert!(provision(&mut ops, two_disk_plan(), &settings, &target).is_err());

        assert_eq!(ops.trace, vec!["wipe /dev/sda"]);
        assert!(key_path.is_file());

        let provisioned =
            provision(&mut Recorder::default(), two_disk_plan(), &settings, &target).unwrap();
        assert_eq!(provisioned.encryption.bindings.len(), 2);
        assert!(mounts::within(&target, encrypt::TARGET_KEY_PATH).is_file());
    }

    #[test]
    fn unwritable_key_leaves_the_disks_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-directory");
        fs::write(&blocker, b"").unwrap();
        let key_path = blocker.join("root.key");
        let fragment_path = dir.path().join("crypttab");
        let settings = EncryptionSettings {
            enabled: true,
            passphrase: None,
            key_path: &key_path,
            fragment_path: &fragment_path,
        };

        let mut ops = Recorder::default();
        let target = dir.path().join("mnt");
        assert!(provision(&mut ops, two_disk_plan(), &settings, &target).is_err());
        assert!(ops.trace.is_empty());
    }

    #[test]
    fn a_failing_device_halts_before_volumes_are_built() {
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("root.key");
        let fragment_path = dir.path().join("crypttab");
        let settings = EncryptionSettings {
            enabled: true,
            passphrase: None,
            key_path: &key_path,
            fragment_path: &fragment_path,
        };

        let mut ops = Recorder::failing_on("luksOpen /dev/nvme0n1p2");
        let target = dir.path().join("mnt");
        assert!(provision(&mut ops, two_disk_plan(), &settings, &target).is_err());

        assert_eq!(ops.lines("luksOpen /dev/sda2").len(), 1);
        assert!(ops.lines("pvcreate").is_empty());
        assert!(ops.lines("lvcreate").is_empty());
        assert!(ops.lines("mount").is_empty());
    }
}
