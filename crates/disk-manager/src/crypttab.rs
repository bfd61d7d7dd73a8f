// Copyright 2021 System76 <info@system76.com>
// SPDX-License-Identifier: LGPL-3.0-only

//! `crypttab` lines, as written during provisioning and rewritten when sealing.

use std::fmt;
use std::str::FromStr;

/// Option which has systemd unlock a volume with the TPM.
pub const TPM_OPTION: &str = "tpm2-device=auto";

/// One line of `/etc/crypttab`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrypttabEntry {
    pub name: String,
    pub source: String,
    pub key: Option<String>,
    pub options: Vec<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("crypttab line `{0}` needs between two and four fields")]
pub struct CrypttabError(pub String);

impl CrypttabEntry {
    pub fn with_keyfile(name: &str, uuid: &str, keyfile: &str) -> Self {
        CrypttabEntry {
            name: name.to_owned(),
            source: format!("UUID={}", uuid),
            key: Some(keyfile.to_owned()),
            options: vec!["luks".to_owned()],
        }
    }

    pub fn uuid(&self) -> Option<&str> {
        self.source.strip_prefix("UUID=")
    }

    /// Drops the key reference in favour of a TPM unlock.
    pub fn seal_to_tpm(&mut self) {
        self.key = None;
        if !self.options.iter().any(|option| option == TPM_OPTION) {
            self.options.push(TPM_OPTION.to_owned());
        }
    }
}

impl fmt::Display for CrypttabEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}",
            self.name,
            self.source,
            self.key.as_deref().unwrap_or("none")
        )?;

        if !self.options.is_empty() {
            write!(f, " {}", self.options.join(","))?;
        }

        Ok(())
    }
}

impl FromStr for CrypttabEntry {
    type Err = CrypttabError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let fields = line.split_whitespace().collect::<Vec<_>>();
        if !(2..=4).contains(&fields.len()) {
            return Err(CrypttabError(line.to_owned()));
        }

        let key = fields
            .get(2)
            .filter(|key| !matches!(**key, "none" | "-"))
            .map(|key| key.to_string());

        let options = fields
            .get(3)
            .map(|options| options.split(',').map(String::from).collect())
            .unwrap_or_default();

        Ok(CrypttabEntry {
            name: fields[0].to_owned(),
            source: fields[1].to_owned(),
            key,
            options,
        })
    }
}

/// Renders entries as a crypttab document.
pub fn render(entries: &[CrypttabEntry]) -> String {
    entries.iter().map(|entry| format!("{}\n", entry)).collect()
}

/// Rewrites every entry unlocked by `keyfile` to unlock through the TPM instead.
///
/// Comments and unrelated entries are kept as they are. Returns the new
/// document and the UUIDs of the volumes which must be enrolled.
pub fn seal(contents: &str, keyfile: &str) -> Result<(String, Vec<String>), CrypttabError> {
    let mut output = String::with_capacity(contents.len());
    let mut sealed = Vec::new();

    for line in contents.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            output.push_str(line);
            output.push('\n');
            continue;
        }

        let mut entry = trimmed.parse::<CrypttabEntry>()?;
        if entry.key.as_deref() == Some(keyfile) {
            if let Some(uuid) = entry.uuid() {
                sealed.push(uuid.to_owned());
            }

            entry.seal_to_tpm();
            output.push_str(&entry.to_string());
        } else {
            output.push_str(line);
        }

        output.push('\n');
    }

    Ok((output, sealed))
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "/etc/cryptsetup-keys.d/root.key";

    #[test]
    fn keyfile_entries_render_as_crypttab_lines() {
        let entries = vec![
            CrypttabEntry::with_keyfile("luks-sda2", "1111", KEY),
            CrypttabEntry::with_keyfile("luks-sdb2", "2222", KEY),
        ];

        assert_eq!(
            render(&entries),
            format!(
                "luks-sda2 UUID=1111 {key} luks\nluks-sdb2 UUID=2222 {key} luks\n",
                key = KEY
            )
        );
    }

    #[test]
    fn parses_lines_with_optional_fields() {
        let entry: CrypttabEntry = "home UUID=abcd none".parse().unwrap();
        assert_eq!(entry.key, None);
        assert!(entry.options.is_empty());
        assert_eq!(entry.uuid(), Some("abcd"));

        let entry: CrypttabEntry = "swap /dev/sdb3 /dev/urandom swap,cipher=aes".parse().unwrap();
        assert_eq!(entry.key.as_deref(), Some("/dev/urandom"));
        assert_eq!(entry.options, vec!["swap", "cipher=aes"]);
        assert_eq!(entry.uuid(), None);

        assert!("lonely".parse::<CrypttabEntry>().is_err());
    }

    #[test]
    fn sealing_replaces_only_keyfile_references() {
        let contents = format!(
            "# provisioned\nluks-sda2 UUID=1111 {key} luks\nother UUID=9999 /etc/other.key luks\nluks-sdb2 UUID=2222 {key} luks\n",
            key = KEY
        );

        let (sealed, uuids) = seal(&contents, KEY).unwrap();

        assert_eq!(uuids, vec!["1111", "2222"]);
        assert_eq!(
            sealed,
            "# provisioned\n\
             luks-sda2 UUID=1111 none luks,tpm2-device=auto\n\
             other UUID=9999 /etc/other.key luks\n\
             luks-sdb2 UUID=2222 none luks,tpm2-device=auto\n"
        );

        let (again, uuids) = seal(&sealed, KEY).unwrap();
        assert_eq!(again, sealed);
        assert!(uuids.is_empty());
    }
}
