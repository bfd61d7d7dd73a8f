// Copyright 2021 System76 <info@system76.com>
// SPDX-License-Identifier: LGPL-3.0-only

use bitflags::bitflags;
use std::collections::BTreeMap;
use std::fmt::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Disk,
    Partition,
    Other,
}

impl DeviceKind {
    fn as_str(self) -> &'static str {
        match self {
            DeviceKind::Disk => "disk",
            DeviceKind::Partition => "part",
            DeviceKind::Other => "other",
        }
    }
}

bitflags! {
    /// Storage properties which only hold for a device set if every member has them.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Capabilities: u8 {
        const DISCARD_ZEROES = 1;
        const NON_ROTATIONAL = 1 << 1;
    }
}

/// A snapshot of one block device, taken once when devices are classified.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDevice {
    /// Display name, such as `nvme0n1`.
    pub name: String,
    /// Kernel name, which identifies the device.
    pub kname: String,
    /// Kernel name of the parent device, if any.
    pub parent: Option<String>,
    pub path: PathBuf,
    /// Size in bytes.
    pub size: u64,
    pub kind: DeviceKind,
    pub hotplug: bool,
    pub rotational: bool,
    pub discard_zeroes: bool,
    pub serial: String,
    pub model: String,
    pub fstype: Option<String>,
    pub sector_size: u64,
}

impl BlockDevice {
    pub fn capabilities(&self) -> Capabilities {
        let mut caps = Capabilities::empty();
        caps.set(Capabilities::DISCARD_ZEROES, self.discard_zeroes);
        caps.set(Capabilities::NON_ROTATIONAL, !self.rotational);
        caps
    }

    /// Path of the `number`th partition node, following kernel naming.
    ///
    /// Disks whose name ends in a digit (`nvme0n1`, `mmcblk0`) separate the
    /// partition number with a `p`.
    pub fn partition_path(&self, number: u32) -> PathBuf {
        let base = self.path.to_string_lossy();
        let separator = if base.ends_with(|c: char| c.is_ascii_digit()) {
            "p"
        } else {
            ""
        };

        PathBuf::from(format!("{}{}{}", base, separator, number))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("expected `=` after `{0}`")]
    MissingEquals(String),
    #[error("value of `{0}` is not quoted")]
    Unquoted(String),
    #[error("value of `{0}` is not terminated")]
    Unterminated(String),
    #[error("invalid escape sequence in `{0}`")]
    BadEscape(String),
    #[error("field `{0}` appears more than once")]
    Duplicate(String),
    #[error("unknown field `{0}`")]
    Unknown(String),
    #[error("required field `{0}` is missing")]
    Missing(&'static str),
    #[error("field `{field}` has invalid value `{value}`")]
    Invalid { field: &'static str, value: String },
}

const FIELDS: [&str; 13] = [
    "NAME", "KNAME", "PKNAME", "PATH", "TYPE", "SIZE", "HOTPLUG", "ROTA", "DISC-ZERO", "SERIAL",
    "MODEL", "FSTYPE", "LOG-SEC",
];

/// Records are a single line of `KEY="value"` pairs, as `lsblk -P` writes them.
impl fmt::Display for BlockDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let size = self.size.to_string();
        let sector_size = self.sector_size.to_string();
        let path = self.path.to_string_lossy();

        let values: [&str; 13] = [
            &self.name,
            &self.kname,
            self.parent.as_deref().unwrap_or_default(),
            &path,
            self.kind.as_str(),
            &size,
            flag(self.hotplug),
            flag(self.rotational),
            flag(self.discard_zeroes),
            &self.serial,
            &self.model,
            self.fstype.as_deref().unwrap_or_default(),
            &sector_size,
        ];

        for (index, (key, value)) in FIELDS.iter().zip(values.iter()).enumerate() {
            if index != 0 {
                f.write_char(' ')?;
            }

            write!(f, "{}=\"", key)?;
            for c in value.chars() {
                match c {
                    '"' | '\\' => write!(f, "\\x{:02x}", c as u32)?,
                    c if c.is_control() => write!(f, "\\x{:02x}", c as u32)?,
                    c => f.write_char(c)?,
                }
            }
            f.write_char('"')?;
        }

        Ok(())
    }
}

impl FromStr for BlockDevice {
    type Err = RecordError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut fields = parse_pairs(line)?;

        let mut take = |key: &'static str| fields.remove(key);

        let name = required(take("NAME"), "NAME")?;
        let kname = required(take("KNAME"), "KNAME")?;
        let path = required(take("PATH"), "PATH")?;
        let kind = match required(take("TYPE"), "TYPE")?.as_str() {
            "disk" => DeviceKind::Disk,
            "part" | "partition" => DeviceKind::Partition,
            _ => DeviceKind::Other,
        };

        let size = number(required(take("SIZE"), "SIZE")?, "SIZE")?;
        let hotplug = boolean(required(take("HOTPLUG"), "HOTPLUG")?, "HOTPLUG")?;
        let rotational = boolean(required(take("ROTA"), "ROTA")?, "ROTA")?;
        let discard_zeroes = boolean(required(take("DISC-ZERO"), "DISC-ZERO")?, "DISC-ZERO")?;
        let sector_size = match take("LOG-SEC") {
            Some(value) => number(value, "LOG-SEC")?,
            None => 512,
        };

        if sector_size == 0 {
            return Err(RecordError::Invalid {
                field: "LOG-SEC",
                value: "0".into(),
            });
        }

        Ok(BlockDevice {
            name,
            kname,
            parent: take("PKNAME").filter(|value| !value.is_empty()),
            path: PathBuf::from(path),
            size,
            kind,
            hotplug,
            rotational,
            discard_zeroes,
            serial: take("SERIAL").unwrap_or_default(),
            model: take("MODEL").unwrap_or_default(),
            fstype: take("FSTYPE").filter(|value| !value.is_empty()),
            sector_size,
        })
    }
}

fn flag(value: bool) -> &'static str {
    if value {
        "1"
    } else {
        "0"
    }
}

fn required(value: Option<String>, field: &'static str) -> Result<String, RecordError> {
    match value {
        Some(value) if !value.is_empty() => Ok(value),
        Some(value) => Err(RecordError::Invalid { field, value }),
        None => Err(RecordError::Missing(field)),
    }
}

fn number(value: String, field: &'static str) -> Result<u64, RecordError> {
    value
        .parse::<u64>()
        .map_err(|_| RecordError::Invalid { field, value })
}

fn boolean(value: String, field: &'static str) -> Result<bool, RecordError> {
    match value.as_str() {
        "1" => Ok(true),
        "0" => Ok(false),
        _ => Err(RecordError::Invalid { field, value }),
    }
}

/// Split a record into its fields, decoding `\xHH` escapes.
fn parse_pairs(line: &str) -> Result<BTreeMap<&'static str, String>, RecordError> {
    let mut fields = BTreeMap::new();
    let mut rest = line.trim();

    while !rest.is_empty() {
        let equals = match rest.find(|c: char| c == '=' || c.is_whitespace()) {
            Some(position) if rest[position..].starts_with('=') => position,
            _ => {
                let key = rest.split_whitespace().next().unwrap_or(rest);
                return Err(RecordError::MissingEquals(key.to_owned()));
            }
        };

        let key = &rest[..equals];
        let known = FIELDS
            .iter()
            .find(|field| **field == key)
            .ok_or_else(|| RecordError::Unknown(key.to_owned()))?;

        let quoted = rest[equals + 1..]
            .strip_prefix('"')
            .ok_or_else(|| RecordError::Unquoted(key.to_owned()))?;

        let mut value = String::new();
        let mut chars = quoted.char_indices();
        let mut end = None;

        while let Some((index, c)) = chars.next() {
            match c {
                '"' => {
                    end = Some(index);
                    break;
                }
                '\\' => {
                    let escape = (chars.next(), chars.next(), chars.next());
                    let decoded = match escape {
                        (Some((_, 'x')), Some((_, hi)), Some((_, lo))) => hi
                            .to_digit(16)
                            .zip(lo.to_digit(16))
                            .and_then(|(hi, lo)| char::from_u32(hi * 16 + lo)),
                        _ => None,
                    };

                    value.push(decoded.ok_or_else(|| RecordError::BadEscape(key.to_owned()))?);
                }
                c => value.push(c),
            }
        }

        let end = end.ok_or_else(|| RecordError::Unterminated(key.to_owned()))?;

        if fields.insert(*known, value).is_some() {
            return Err(RecordError::Duplicate(key.to_owned()));
        }

        rest = quoted[end + 1..].trim_start();
    }

    Ok(fields)
}

/// Path to the device node backing a kernel name.
pub fn device_node(kname: &str) -> PathBuf {
    Path::new("/dev").join(kname)
}

#[cfg(any(test, feature = "testing"))]
pub mod fixtures {
    use super::*;

    pub fn disk(kname: &str) -> BlockDevice {
        BlockDevice {
            name: kname.to_owned(),
            kname: kname.to_owned(),
            parent: None,
            path: device_node(kname),
            size: 512 * 1024 * 1024 * 1024,
            kind: DeviceKind::Disk,
            hotplug: false,
            rotational: false,
            discard_zeroes: true,
            serial: format!("SN-{}", kname),
            model: "Example SSD".to_owned(),
            fstype: None,
            sector_size: 512,
        }
    }
}
