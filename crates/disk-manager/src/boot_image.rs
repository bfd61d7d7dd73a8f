// Copyright 2021 System76 <info@system76.com>
// SPDX-License-Identifier: LGPL-3.0-only

//! In-place edits of the initramfs build configuration and the kernel command line.

use crate::volumes::{volume_path, ROOT_VOLUME};

pub const CONFIG_PATH: &str = "/etc/mkinitcpio.conf";
pub const CMDLINE_PATH: &str = "/etc/kernel/cmdline";

const MODULES: &[&str] = &["btrfs", "dm-thin-pool", "dm-raid", "raid1", "raid456"];
const BINARIES: &[&str] = &["/usr/bin/btrfs"];

const HOOKS_BEFORE_ENCRYPT: &[&str] = &[
    "base",
    "systemd",
    "autodetect",
    "microcode",
    "modconf",
    "kms",
    "keyboard",
    "sd-vconsole",
    "block",
];
const HOOKS_AFTER_ENCRYPT: &[&str] = &["lvm2", "filesystems", "fsck"];

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BootImageConfig {
    pub modules: Vec<String>,
    pub hooks: Vec<String>,
    pub binaries: Vec<String>,
    pub files: Vec<String>,
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}

/// Items of a `KEY=(a b c)` line, if `line` assigns `key`.
fn array<'a>(line: &'a str, key: &str) -> Option<Vec<&'a str>> {
    let value = line.trim().strip_prefix(key)?.strip_prefix("=(")?;
    let value = value.split(')').next().unwrap_or_default();
    Some(
        value
            .split_whitespace()
            .map(|item| item.trim_matches(|c| c == '"' || c == '\''))
            .collect(),
    )
}

impl BootImageConfig {
    pub fn parse(contents: &str) -> Self {
        let mut config = BootImageConfig::default();

        for line in contents.lines() {
            for (key, field) in [
                ("MODULES", &mut config.modules),
                ("HOOKS", &mut config.hooks),
                ("BINARIES", &mut config.binaries),
                ("FILES", &mut config.files),
            ] {
                if let Some(items) = array(line, key) {
                    *field = items.into_iter().map(String::from).collect();
                }
            }
        }

        config
    }

    /// The configuration a provisioned system boots with, keeping any files
    /// already listed in `existing`.
    pub fn for_target(existing: &str, encrypted: bool) -> Self {
        let mut hooks = strings(HOOKS_BEFORE_ENCRYPT);
        if encrypted {
            hooks.push("sd-encrypt".into());
        }
        hooks.extend(strings(HOOKS_AFTER_ENCRYPT));

        BootImageConfig {
            modules: strings(MODULES),
            hooks,
            binaries: strings(BINARIES),
            files: BootImageConfig::parse(existing).files,
        }
    }

    pub fn embed_file(&mut self, path: &str) {
        if !self.files.iter().any(|file| file == path) {
            self.files.push(path.to_owned());
        }
    }

    pub fn remove_file(&mut self, path: &str) {
        self.files.retain(|file| file != path);
    }

    /// Rewrites the array assignments of `contents` in place; assignments
    /// which are missing are appended.
    pub fn apply(&self, contents: &str) -> String {
        let fields = [
            ("MODULES", &self.modules),
            ("HOOKS", &self.hooks),
            ("BINARIES", &self.binaries),
            ("FILES", &self.files),
        ];

        let mut written = [false; 4];
        let mut output = String::with_capacity(contents.len());

        for line in contents.lines() {
            let replaced = fields
                .iter()
                .position(|(key, _)| array(line, key).is_some());

            match replaced {
                Some(index) => {
                    let (key, values) = fields[index];
                    output.push_str(&format!("{}=({})", key, values.join(" ")));
                    written[index] = true;
                }
                None => output.push_str(line),
            }

            output.push('\n');
        }

        for (index, (key, values)) in fields.iter().enumerate() {
            if !written[index] {
                output.push_str(&format!("{}=({})\n", key, values.join(" ")));
            }
        }

        output
    }
}

/// Kernel parameters which locate the root filesystem.
pub fn root_parameters() -> Vec<String> {
    vec![
        format!("root={}", volume_path(ROOT_VOLUME).display()),
        "rootflags=subvol=@".to_owned(),
        "rw".to_owned(),
    ]
}

/// Appends the parameters missing from a kernel command line.
pub fn append_parameters(cmdline: &str, parameters: &[String]) -> String {
    let mut words = cmdline.split_whitespace().map(String::from).collect::<Vec<_>>();
    for parameter in parameters {
        if !words.contains(parameter) {
            words.push(parameter.clone());
        }
    }

    let mut line = words.join(" ");
    line.push('\n');
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    const STOCK: &str = "# vim:set ft=sh\n\
                         MODULES=()\n\
                         BINARIES=()\n\
                         FILES=(/etc/existing.conf)\n\
                         HOOKS=(base udev autodetect microcode modconf kms keyboard keymap consolefont block filesystems fsck)\n\
                         #COMPRESSION=\"zstd\"\n";

    #[test]
    fn parses_array_assignments() {
        let config = BootImageConfig::parse(STOCK);
        assert!(config.modules.is_empty());
        assert_eq!(config.files, vec!["/etc/existing.conf"]);
        assert_eq!(config.hooks[1], "udev");
        assert_eq!(config.hooks.len(), 12);
    }

    #[test]
    fn encryption_adds_the_unlock_hook_before_lvm() {
        let plain = BootImageConfig::for_target(STOCK, false);
        assert!(!plain.hooks.iter().any(|hook| hook == "sd-encrypt"));

        let encrypted = BootImageConfig::for_target(STOCK, true);
        let position = |name: &str| encrypted.hooks.iter().position(|hook| hook == name).unwrap();
        assert!(position("block") < position("sd-encrypt"));
        assert!(position("sd-encrypt") < position("lvm2"));
        assert!(position("lvm2") < position("filesystems"));
        assert_eq!(encrypted.files, vec!["/etc/existing.conf"]);
    }

    #[test]
    fn embedded_files_are_unique_and_removable() {
        let mut config = BootImageConfig::for_target("", true);
        config.embed_file("/etc/cryptsetup-keys.d/root.key");
        config.embed_file("/etc/cryptsetup-keys.d/root.key");
        assert_eq!(config.files, vec!["/etc/cryptsetup-keys.d/root.key"]);

        config.remove_file("/etc/cryptsetup-keys.d/root.key");
        assert!(config.files.is_empty());
    }

    #[test]
    fn rewrites_lines_in_place() {
        let mut config = BootImageConfig::for_target(STOCK, true);
        config.embed_file("/etc/cryptsetup-keys.d/root.key");

        let rewritten = config.apply(STOCK);
        let lines = rewritten.lines().collect::<Vec<_>>();

        assert_eq!(lines[0], "# vim:set ft=sh");
        assert_eq!(lines[1], "MODULES=(btrfs dm-thin-pool dm-raid raid1 raid456)");
        assert_eq!(lines[2], "BINARIES=(/usr/bin/btrfs)");
        assert_eq!(
            lines[3],
            "FILES=(/etc/existing.conf /etc/cryptsetup-keys.d/root.key)"
        );
        assert_eq!(
            lines[4],
            "HOOKS=(base systemd autodetect microcode modconf kms keyboard sd-vconsole block sd-encrypt lvm2 filesystems fsck)"
        );
        assert_eq!(lines[5], "#COMPRESSION=\"zstd\"");
        assert_eq!(lines.len(), 6);

        assert_eq!(BootImageConfig::parse(&rewritten), config);
    }

    #[test]
    fn missing_assignments_are_appended() {
        let config = BootImageConfig::for_target("", false);
        let written = config.apply("COMPRESSION=\"zstd\"\n");
        assert!(written.starts_with("COMPRESSION=\"zstd\"\nMODULES=("));
        assert!(written.contains("\nFILES=()\n"));
    }

    #[test]
    fn root_parameters_are_appended_once() {
        let cmdline = append_parameters("quiet splash", &root_parameters());
        assert_eq!(
            cmdline,
            "quiet splash root=/dev/vg_system/root rootflags=subvol=@ rw\n"
        );
        assert_eq!(append_parameters(&cmdline, &root_parameters()), cmdline);
    }
}
