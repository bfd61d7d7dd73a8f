// Copyright 2021 System76 <info@system76.com>
// SPDX-License-Identifier: LGPL-3.0-only

//! Key generation and LUKS setup of every system partition.

use crate::crypttab::{self, CrypttabEntry};
use crate::mounts::within;
use crate::ops::{DiskPartitions, OpsError, OpsResult, StorageOps};
use rand::rngs::OsRng;
use rand::RngCore;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

pub const KEY_SIZE: usize = 2048;

pub const KEY_PATH: &str = "/tmp/keystone/root.key";
pub const FRAGMENT_PATH: &str = "/tmp/keystone/crypttab";

/// Where the key is found once the target has booted.
pub const TARGET_KEY_PATH: &str = "/etc/cryptsetup-keys.d/root.key";
pub const TARGET_FRAGMENT_PATH: &str = "/etc/crypttab.initramfs";

/// Random key material, readable only by its owner.
pub struct KeyMaterial {
    path: PathBuf,
    bytes: Vec<u8>,
}

impl KeyMaterial {
    pub fn generate(path: &Path) -> io::Result<Self> {
        tracing::info!("generating {} byte key at {:?}", KEY_SIZE, path);
        let mut bytes = vec![0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut bytes);

        if let Some(parent) = path.parent() {
            fs::DirBuilder::new()
                .recursive(true)
                .mode(0o700)
                .create(parent)?;
        }

        match fs::remove_file(path) {
            Err(why) if why.kind() != io::ErrorKind::NotFound => return Err(why),
            _ => (),
        }

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o400)
            .open(path)?;

        file.write_all(&bytes)?;
        file.sync_all()?;

        Ok(KeyMaterial {
            path: path.to_owned(),
            bytes,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// How one system partition was encrypted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncryptionBinding {
    pub partition: PathBuf,
    pub mapped_name: String,
    pub mapped_path: PathBuf,
    /// UUID of the LUKS header, as referenced by crypttab.
    pub uuid: String,
    pub has_key: bool,
    pub passphrase_enrolled: bool,
}

pub struct EncryptionSettings<'a> {
    pub enabled: bool,
    pub passphrase: Option<&'a [u8]>,
    pub key_path: &'a Path,
    pub fragment_path: &'a Path,
}

impl<'a> EncryptionSettings<'a> {
    pub fn new(enabled: bool, passphrase: Option<&'a [u8]>) -> Self {
        EncryptionSettings {
            enabled,
            passphrase,
            key_path: Path::new(KEY_PATH),
            fragment_path: Path::new(FRAGMENT_PATH),
        }
    }
}

/// Output of [`prepare`]; empty when encryption is disabled.
#[derive(Default)]
pub struct Encryption {
    pub key: Option<KeyMaterial>,
    pub fragment: Option<PathBuf>,
    pub bindings: Vec<EncryptionBinding>,
}

impl Encryption {
    pub fn is_enabled(&self) -> bool {
        self.key.is_some()
    }

    /// Devices which later stages build on: mapped devices when encrypted,
    /// the raw system partitions otherwise.
    pub fn physical_volumes(&self, partitions: &[DiskPartitions]) -> Vec<PathBuf> {
        if self.bindings.is_empty() {
            partitions.iter().map(|p| p.system.clone()).collect()
        } else {
            self.bindings.iter().map(|b| b.mapped_path.clone()).collect()
        }
    }

    /// Copies the key and the crypttab fragment into the target root.
    pub fn install_into(&self, root: &Path) -> OpsResult<()> {
        let (key, fragment) = match (self.key.as_ref(), self.fragment.as_ref()) {
            (Some(key), Some(fragment)) => (key, fragment),
            _ => return Ok(()),
        };

        let key_target = within(root, TARGET_KEY_PATH);
        let fragment_target = within(root, TARGET_FRAGMENT_PATH);

        for target in [&key_target, &fragment_target] {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(OpsError::io(parent))?;
            }
        }

        tracing::info!("installing key to {:?}", key_target);
        fs::copy(key.path(), &key_target).map_err(OpsError::io(&key_target))?;

        tracing::info!("installing crypttab to {:?}", fragment_target);
        fs::copy(fragment, &fragment_target).map_err(OpsError::io(&fragment_target))?;

        Ok(())
    }
}

/// Name of the mapping for a partition, `luks-<kname>`.
pub fn mapped_name(partition: &Path) -> String {
    let kname = partition
        .file_name()
        .map(|name| name.to_string_lossy())
        .unwrap_or_default();
    format!("luks-{}", kname)
}

/// Writes the key material, or returns `None` when encryption is disabled.
///
/// Called before any device is touched, so a key which cannot be written
/// leaves the disks as they were.
pub fn generate_key(settings: &EncryptionSettings) -> OpsResult<Option<KeyMaterial>> {
    if !settings.enabled {
        return Ok(None);
    }

    KeyMaterial::generate(settings.key_path)
        .map(Some)
        .map_err(OpsError::io(settings.key_path))
}

/// Encrypts and opens each system partition with `key`.
///
/// Each device appends one line to the crypttab fragment once it has been
/// opened. The first device which fails aborts the whole run.
pub fn prepare<O: StorageOps>(
    ops: &mut O,
    partitions: &[DiskPartitions],
    settings: &EncryptionSettings,
    key: Option<KeyMaterial>,
) -> OpsResult<Encryption> {
    let key = match key {
        Some(key) => key,
        None => {
            tracing::info!("encryption disabled, using system partitions directly");
            return Ok(Encryption::default());
        }
    };

    let fragment_path = settings.fragment_path;
    if let Some(parent) = fragment_path.parent() {
        fs::create_dir_all(parent).map_err(OpsError::io(parent))?;
    }

    let mut fragment = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(fragment_path)
        .map_err(OpsError::io(fragment_path))?;

    let mut bindings = Vec::with_capacity(partitions.len());

    for disk in partitions {
        let partition = &disk.system;
        ops.format_encrypted(partition, key.bytes())?;

        if let Some(passphrase) = settings.passphrase {
            ops.add_passphrase(partition, key.bytes(), passphrase)?;
        }

        let uuid = ops.filesystem_uuid(partition)?;
        let name = mapped_name(partition);
        let mapped_path = ops.open_encrypted(partition, &name, key.bytes())?;

        let entry = CrypttabEntry::with_keyfile(&name, &uuid, TARGET_KEY_PATH);
        fragment
            .write_all(crypttab::render(&[entry]).as_bytes())
            .map_err(OpsError::io(fragment_path))?;

        bindings.push(EncryptionBinding {
            partition: partition.clone(),
            mapped_name: name,
            mapped_path,
            uuid,
            has_key: true,
            passphrase_enrolled: settings.passphrase.is_some(),
        });
    }

    fragment.sync_all().map_err(OpsError::io(fragment_path))?;

    Ok(Encryption {
        key: Some(key),
        fragment: Some(fragment_path.to_owned()),
        bindings,
    })
}
