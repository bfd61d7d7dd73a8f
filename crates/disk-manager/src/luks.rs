// Copyright 2021 System76 <info@system76.com>
// SPDX-License-Identifier: LGPL-3.0-only

use cryptsetup::{CryptActivateFlags, CryptInit, CryptVolumeKeyFlags, EncryptionFormat};
use libcryptsetup_rs as cryptsetup;
use std::path::Path;

/// Formats `path` as LUKS2, with `key` enrolled in the first keyslot.
pub fn format(path: &Path, key: &[u8]) -> cryptsetup::Result<()> {
    tracing::info!("creating LUKS device on {:?}", path);
    let mut device = CryptInit::init(path)?;

    device.context_handle().format::<()>(
        EncryptionFormat::Luks2,
        ("aes", "xts-plain64"),
        None,
        libcryptsetup_rs::Either::Right(512 / 8),
        None,
    )?;

    device
        .keyslot_handle()
        .add_by_key(None, None, key, CryptVolumeKeyFlags::empty())?;

    Ok(())
}

/// Enrolls `passphrase` as an additional unlock factor, authorized by `key`.
pub fn add_passphrase(path: &Path, key: &[u8], passphrase: &[u8]) -> cryptsetup::Result<()> {
    tracing::info!("enrolling passphrase on LUKS device {:?}", path);
    let mut device = CryptInit::init(path)?;
    device
        .context_handle()
        .load::<()>(Some(EncryptionFormat::Luks2), None)?;

    device
        .keyslot_handle()
        .add_by_passphrase(None, key, passphrase)?;

    Ok(())
}

pub fn activate(path: &Path, name: &str, key: &[u8]) -> cryptsetup::Result<()> {
    tracing::info!(
        "activating LUKS device {:?}, with DM_NAME of {}",
        path,
        name
    );
    let mut device = CryptInit::init(path)?;
    device
        .context_handle()
        .load::<()>(Some(EncryptionFormat::Luks2), None)?;

    device.activate_handle().activate_by_passphrase(
        Some(name),
        None,
        key,
        CryptActivateFlags::empty(),
    )?;
    Ok(())
}
