// Copyright 2021 System76 <info@system76.com>
// SPDX-License-Identifier: LGPL-3.0-only

use cradle::prelude::*;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Commands run inside the target while enrolling trust.
pub trait FirmwareOps {
    /// Binds the volume with `uuid` to the TPM, authorized by `keyfile`.
    fn enroll_tpm(&mut self, uuid: &str, keyfile: &Path) -> Result<(), cradle::Error>;

    fn create_secure_boot_keys(&mut self) -> Result<(), cradle::Error>;

    /// Enrolls local keys alongside the vendor's certificates.
    fn enroll_secure_boot_keys(&mut self) -> Result<(), cradle::Error>;

    fn rebuild_boot_image(&mut self) -> Result<(), cradle::Error>;

    fn sign(&mut self, binary: &Path) -> Result<(), cradle::Error>;
}

pub struct SystemFirmware;

impl FirmwareOps for SystemFirmware {
    fn enroll_tpm(&mut self, uuid: &str, keyfile: &Path) -> Result<(), cradle::Error> {
        tracing::info!("sealing LUKS volume {} to the TPM", uuid);
        run_result!(
            "systemd-cryptenroll",
            "--wipe-slot=empty",
            "--tpm2-device=auto",
            format!("--unlock-key-file={}", keyfile.display()),
            format!("/dev/disk/by-uuid/{}", uuid)
        )
    }

    fn create_secure_boot_keys(&mut self) -> Result<(), cradle::Error> {
        tracing::info!("creating SecureBoot keys");
        run_result!("sbctl", "create-keys")
    }

    fn enroll_secure_boot_keys(&mut self) -> Result<(), cradle::Error> {
        tracing::info!("enrolling SecureBoot keys");
        run_result!("sbctl", "enroll-keys", "--microsoft")
    }

    fn rebuild_boot_image(&mut self) -> Result<(), cradle::Error> {
        tracing::info!("rebuilding boot images");
        run_result!("mkinitcpio", "-P")
    }

    fn sign(&mut self, binary: &Path) -> Result<(), cradle::Error> {
        tracing::info!("signing {:?}", binary);
        run_result!("sbctl", "sign", "-s", binary)
    }
}

/// EFI binaries below `dir`, sorted.
pub fn efi_binaries(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    collect_efi_binaries(dir, &mut found)?;
    found.sort();
    Ok(found)
}

fn collect_efi_binaries(dir: &Path, found: &mut Vec<PathBuf>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            collect_efi_binaries(&path, found)?;
        } else if file_type.is_file()
            && path
                .extension()
                .map_or(false, |ext| ext.eq_ignore_ascii_case("efi"))
        {
            found.push(path);
        }
    }

    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    #[derive(Default)]
    pub struct FirmwareRecorder {
        pub trace: Vec<String>,
    }

    impl FirmwareOps for FirmwareRecorder {
        fn enroll_tpm(&mut self, uuid: &str, keyfile: &Path) -> Result<(), cradle::Error> {
            self.trace.push(format!("cryptenroll {} {}", uuid, keyfile.display()));
            Ok(())
        }

        fn create_secure_boot_keys(&mut self) -> Result<(), cradle::Error> {
            self.trace.push("create-keys".into());
            Ok(())
        }

        fn enroll_secure_boot_keys(&mut self) -> Result<(), cradle::Error> {
            self.trace.push("enroll-keys".into());
            Ok(())
        }

        fn rebuild_boot_image(&mut self) -> Result<(), cradle::Error> {
            self.trace.push("mkinitcpio".into());
            Ok(())
        }

        fn sign(&mut self, binary: &Path) -> Result<(), cradle::Error> {
            self.trace.push(format!("sign {}", binary.display()));
            Ok(())
        }
    }
}
