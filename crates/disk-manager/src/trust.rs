// Copyright 2021 System76 <info@system76.com>
// SPDX-License-Identifier: LGPL-3.0-only

//! Decides how the disk encryption key is protected on the installed system,
//! and carries that decision out.
//!
//! Sealing requires both a TPM and firmware in SecureBoot setup mode. Without
//! them the key is embedded in the boot image, which still boots, but leaves
//! the key readable by anyone holding the disk.

use crate::boot_image::{self, BootImageConfig};
use crate::crypttab::{self, CrypttabError};
use crate::encrypt::{TARGET_FRAGMENT_PATH, TARGET_KEY_PATH};
use crate::firmware::{self, FirmwareOps};
use crate::mounts::within;
use cradle::prelude::*;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Kernel drivers which announce a TPM in the kernel log.
pub const TPM_DRIVERS: &[&str] = &["tpm_crb", "tpm_tis", "tpm_tis_core", "tpm_ftpm_tee"];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum TrustState {
    NoEncryption,
    EncryptedInsecureEmbeddedKey,
    EncryptedSealedToHardware,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct HardwareFacts {
    pub tpm_driver: bool,
    pub secure_boot_setup_mode: bool,
}

#[derive(Debug, Error)]
pub enum TrustError {
    #[error("encryption was requested, but the key file {0:?} does not exist")]
    MissingKeyfile(PathBuf),
    #[error("I/O error on {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("crypttab could not be sealed")]
    Crypttab(#[from] CrypttabError),
    #[error("`{step}` failed")]
    Firmware {
        step: &'static str,
        #[source]
        source: cradle::Error,
    },
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> TrustError + '_ {
    move |source| TrustError::Io {
        path: path.to_owned(),
        source,
    }
}

fn step(step: &'static str) -> impl FnOnce(cradle::Error) -> TrustError {
    move |source| TrustError::Firmware { step, source }
}

pub fn evaluate(encryption_requested: bool, facts: HardwareFacts) -> TrustState {
    if !encryption_requested {
        TrustState::NoEncryption
    } else if facts.tpm_driver && facts.secure_boot_setup_mode {
        TrustState::EncryptedSealedToHardware
    } else {
        TrustState::EncryptedInsecureEmbeddedKey
    }
}

/// Whether the kernel log mentions a TPM driver.
pub fn tpm_driver_present(kernel_log: &str) -> bool {
    kernel_log
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .any(|word| TPM_DRIVERS.contains(&word))
}

/// Whether `bootctl status` reports SecureBoot as supported and in setup mode.
pub fn secure_boot_setup_mode(status: &str) -> bool {
    let mut capable = false;
    let mut setup = false;

    for line in status.lines().map(str::trim) {
        if let Some(value) = line.strip_prefix("Secure Boot:") {
            let value = value.trim();
            capable = !value.is_empty() && !value.starts_with("unsupported");
            setup |= value.contains("(setup)");
        } else if let Some(value) = line.strip_prefix("Setup Mode:") {
            setup |= value.trim() == "setup";
        }
    }

    capable && setup
}

impl HardwareFacts {
    /// Reads the kernel log and the boot manager status once.
    ///
    /// A probe which fails counts as the feature being absent.
    pub fn probe() -> Self {
        let kernel_log: Result<StdoutUntrimmed, cradle::Error> = run_result!("dmesg");
        let tpm_driver = match kernel_log {
            Ok(StdoutUntrimmed(log)) => tpm_driver_present(&log),
            Err(why) => {
                tracing::warn!("could not read the kernel log: {}", why);
                false
            }
        };

        let status: Result<StdoutUntrimmed, cradle::Error> = run_result!("bootctl", "status");
        let secure_boot_setup_mode = match status {
            Ok(StdoutUntrimmed(status)) => secure_boot_setup_mode(&status),
            Err(why) => {
                tracing::warn!("could not query the boot manager: {}", why);
                false
            }
        };

        let facts = HardwareFacts {
            tpm_driver,
            secure_boot_setup_mode,
        };

        tracing::info!("hardware facts: {:?}", facts);
        facts
    }
}

/// Fails if encryption was requested, but the provisioned key never made it into the target.
pub fn require_keyfile(root: &Path, encryption_requested: bool) -> Result<(), TrustError> {
    let keyfile = within(root, TARGET_KEY_PATH);
    if encryption_requested && !keyfile.is_file() {
        return Err(TrustError::MissingKeyfile(keyfile));
    }

    Ok(())
}

fn read_optional(path: &Path) -> Result<String, TrustError> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(contents),
        Err(why) if why.kind() == io::ErrorKind::NotFound => Ok(String::new()),
        Err(why) => Err(io_error(path)(why)),
    }
}

fn write(path: &Path, contents: &str) -> Result<(), TrustError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_error(parent))?;
    }

    fs::write(path, contents).map_err(io_error(path))
}

/// Applies `state` to the system rooted at `root`, then rebuilds the boot image.
///
/// Only a sealed system has its boot binaries signed.
pub fn enroll<F: FirmwareOps>(
    firmware: &mut F,
    state: TrustState,
    root: &Path,
) -> Result<(), TrustError> {
    let encrypted = state != TrustState::NoEncryption;
    require_keyfile(root, encrypted)?;

    tracing::info!("enrolling trust as {:?}", state);

    let config_path = within(root, boot_image::CONFIG_PATH);
    let existing = read_optional(&config_path)?;
    let mut config = BootImageConfig::for_target(&existing, encrypted);

    match state {
        TrustState::NoEncryption => (),
        TrustState::EncryptedInsecureEmbeddedKey => {
            tracing::warn!(
                "TPM or SecureBoot setup mode unavailable: embedding the disk key in the boot image"
            );
            config.embed_file(TARGET_KEY_PATH);
        }
        TrustState::EncryptedSealedToHardware => {
            let crypttab_path = within(root, TARGET_FRAGMENT_PATH);
            let contents = fs::read_to_string(&crypttab_path).map_err(io_error(&crypttab_path))?;
            let (sealed, uuids) = crypttab::seal(&contents, TARGET_KEY_PATH)?;

            let keyfile = within(root, TARGET_KEY_PATH);
            for uuid in &uuids {
                firmware
                    .enroll_tpm(uuid, &keyfile)
                    .map_err(step("systemd-cryptenroll"))?;
            }

            write(&crypttab_path, &sealed)?;
            config.remove_file(TARGET_KEY_PATH);

            let cmdline_path = within(root, boot_image::CMDLINE_PATH);
            let cmdline = read_optional(&cmdline_path)?;
            let parameters = boot_image::root_parameters();
            write(&cmdline_path, &boot_image::append_parameters(&cmdline, &parameters))?;

            firmware
                .create_secure_boot_keys()
                .map_err(step("sbctl create-keys"))?;
            firmware
                .enroll_secure_boot_keys()
                .map_err(step("sbctl enroll-keys"))?;
        }
    }

    write(&config_path, &config.apply(&existing))?;
    firmware
        .rebuild_boot_image()
        .map_err(step("mkinitcpio"))?;

    if state == TrustState::EncryptedSealedToHardware {
        let boot = within(root, "/boot");
        for binary in firmware::efi_binaries(&boot).map_err(io_error(&boot))? {
            firmware.sign(&binary).map_err(step("sbctl sign"))?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firmware::testing::FirmwareRecorder;

    const KERNEL_LOG: &str = "[    0.000000] Linux version 6.9.1-arch1-1\n\
                              [    1.234567] tpm_tis 00:05: 2.0 TPM (device-id 0x1A, rev-id 16)\n";

    #[test]
    fn trust_truth_table() {
        for tpm_driver in [false, true] {
            for secure_boot_setup_mode in [false, true] {
                let facts = HardwareFacts {
                    tpm_driver,
                    secure_boot_setup_mode,
                };

                assert_eq!(evaluate(false, facts), TrustState::NoEncryption);

                let expected = if tpm_driver && secure_boot_setup_mode {
                    TrustState::EncryptedSealedToHardware
                } else {
                    TrustState::EncryptedInsecureEmbeddedKey
                };
                assert_eq!(evaluate(true, facts), expected);
            }
        }
    }

    #[test]
    fn detects_tpm_drivers_in_the_kernel_log() {
        assert!(tpm_driver_present(KERNEL_LOG));
        assert!(tpm_driver_present("[ 2.1] tpm_crb MSFT0101:00: [Firmware Bug]: ACPI region"));
        assert!(!tpm_driver_present("[ 0.5] tpm: no TPM chip found\n[ 0.6] tpmfoo loaded"));
        assert!(!tpm_driver_present(""));
    }

    #[test]
    fn reads_setup_mode_from_boot_manager_status() {
        let setup = "System:\n      Firmware: UEFI 2.70\n   Secure Boot: disabled (setup)\n  TPM2 Support: yes\n";
        assert!(secure_boot_setup_mode(setup));

        let legacy = "   Secure Boot: disabled\n    Setup Mode: setup\n";
        assert!(secure_boot_setup_mode(legacy));

        let user = "   Secure Boot: enabled (user)\n";
        assert!(!secure_boot_setup_mode(user));

        let unsupported = "   Secure Boot: unsupported\n    Setup Mode: setup\n";
        assert!(!secure_boot_setup_mode(unsupported));

        assert!(!secure_boot_setup_mode("    Setup Mode: setup\n"));
    }

    struct Target {
        dir: tempfile::TempDir,
    }

    impl Target {
        fn new(with_key: bool) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let root = dir.path();
            fs::create_dir_all(root.join("etc/cryptsetup-keys.d")).unwrap();
            fs::create_dir_all(root.join("boot/EFI/Linux")).unwrap();
            fs::write(
                root.join("etc/mkinitcpio.conf"),
                "MODULES=()\nBINARIES=()\nFILES=()\nHOOKS=(base udev block filesystems)\n",
            )
            .unwrap();
            fs::write(
                root.join("etc/crypttab.initramfs"),
                "luks-sda2 UUID=1111 /etc/cryptsetup-keys.d/root.key luks\n\
                 luks-sdb2 UUID=2222 /etc/cryptsetup-keys.d/root.key luks\n",
            )
            .unwrap();
            fs::write(root.join("boot/EFI/Linux/arch-linux.efi"), b"").unwrap();

            if with_key {
                fs::write(root.join("etc/cryptsetup-keys.d/root.key"), [7u8; 32]).unwrap();
            }

            Target { dir }
        }

        fn root(&self) -> &Path {
            self.dir.path()
        }

        fn read(&self, path: &str) -> String {
            fs::read_to_string(within(self.root(), path)).unwrap()
        }
    }

    #[test]
    fn sealing_enrolls_every_volume_and_signs() {
        let target = Target::new(true);
        let mut firmware = FirmwareRecorder::default();

        enroll(&mut firmware, TrustState::EncryptedSealedToHardware, target.root()).unwrap();

        let keyfile = within(target.root(), TARGET_KEY_PATH);
        let signed = target.root().join("boot/EFI/Linux/arch-linux.efi");
        assert_eq!(
            firmware.trace,
            vec![
                format!("cryptenroll 1111 {}", keyfile.display()),
                format!("cryptenroll 2222 {}", keyfile.display()),
                "create-keys".to_owned(),
                "enroll-keys".to_owned(),
                "mkinitcpio".to_owned(),
                format!("sign {}", signed.display()),
            ]
        );

        assert_eq!(
            target.read(TARGET_FRAGMENT_PATH),
            "luks-sda2 UUID=1111 none luks,tpm2-device=auto\n\
             luks-sdb2 UUID=2222 none luks,tpm2-device=auto\n"
        );

        let config = BootImageConfig::parse(&target.read(boot_image::CONFIG_PATH));
        assert!(config.files.is_empty());
        assert!(config.hooks.iter().any(|hook| hook == "sd-encrypt"));

        assert_eq!(
            target.read(boot_image::CMDLINE_PATH),
            "root=/dev/vg_system/root rootflags=subvol=@ rw\n"
        );
    }

    #[test]
    fn insecure_fallback_embeds_the_key_without_signing() {
        let target = Target::new(true);
        let mut firmware = FirmwareRecorder::default();

        enroll(&mut firmware, TrustState::EncryptedInsecureEmbeddedKey, target.root()).unwrap();

        assert_eq!(firmware.trace, vec!["mkinitcpio"]);

        let config = BootImageConfig::parse(&target.read(boot_image::CONFIG_PATH));
        assert_eq!(config.files, vec![TARGET_KEY_PATH]);
        assert!(target.read(TARGET_FRAGMENT_PATH).contains(TARGET_KEY_PATH));
        assert!(!within(target.root(), boot_image::CMDLINE_PATH).exists());
    }

    #[test]
    fn unencrypted_systems_only_rebuild() {
        let target = Target::new(false);
        let mut firmware = FirmwareRecorder::default();

        enroll(&mut firmware, TrustState::NoEncryption, target.root()).unwrap();

        assert_eq!(firmware.trace, vec!["mkinitcpio"]);
        let config = BootImageConfig::parse(&target.read(boot_image::CONFIG_PATH));
        assert!(!config.hooks.iter().any(|hook| hook == "sd-encrypt"));
        assert!(config.files.is_empty());
    }

    #[test]
    fn missing_keyfile_fails_before_any_change() {
        let target = Target::new(false);
        let before = target.read(boot_image::CONFIG_PATH);
        let mut firmware = FirmwareRecorder::default();

        for state in [
            TrustState::EncryptedSealedToHardware,
            TrustState::EncryptedInsecureEmbeddedKey,
        ] {
            let result = enroll(&mut firmware, state, target.root());
            assert!(matches!(result, Err(TrustError::MissingKeyfile(_))));
        }

        assert!(firmware.trace.is_empty());
        assert_eq!(target.read(boot_image::CONFIG_PATH), before);
        assert!(target.read(TARGET_FRAGMENT_PATH).contains(TARGET_KEY_PATH));
    }
}
