// Copyright 2021 System76 <info@system76.com>
// SPDX-License-Identifier: GPL-3.0-only

use envfile::EnvFile;
use std::path::{Path, PathBuf};

pub const CONFIG_PATH: &str = "/etc/keystone.conf";
pub const CONFIG_ENV: &str = "KEYSTONE_CONFIG";

pub const DEFAULT_HOSTNAME: &str = "keystone";
pub const DEFAULT_LOCALE: &str = "en_US.UTF-8";
pub const DEFAULT_TIMEZONE: &str = "UTC";

/// Site defaults which command line flags override.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Defaults {
    pub hostname: Option<String>,
    pub fullname: Option<String>,
    pub username: Option<String>,
    pub locale: Option<String>,
    pub timezone: Option<String>,
    pub pool: Option<String>,
    pub encrypt: bool,
    pub packages: Vec<String>,
}

impl Defaults {
    pub fn load() -> Self {
        let path = std::env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(CONFIG_PATH));

        Self::from_path(&path)
    }

    pub fn from_path(path: &Path) -> Self {
        if !path.exists() {
            return Defaults::default();
        }

        match EnvFile::new(path) {
            Ok(env) => {
                tracing::info!("loaded defaults from {:?}", path);
                Self::from_env(&env)
            }
            Err(why) => {
                tracing::warn!("ignoring unreadable config {:?}: {}", path, why);
                Defaults::default()
            }
        }
    }

    fn from_env(env: &EnvFile) -> Self {
        let get = |key: &str| {
            env.get(key)
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(String::from)
        };

        Defaults {
            hostname: get("HOSTNAME"),
            fullname: get("FULLNAME"),
            username: get("USERNAME"),
            locale: get("LOCALE"),
            timezone: get("TIMEZONE"),
            pool: get("POOL"),
            encrypt: env.get("ENCRYPT").map_or(false, |value| value.trim() == "1"),
            packages: env
                .get("PACKAGES")
                .map(|value| value.split_whitespace().map(String::from).collect())
                .unwrap_or_default(),
        }
    }
}

/// The flag if given, else the configured value, else the built-in default.
pub fn pick(flag: Option<String>, configured: &Option<String>, fallback: &str) -> String {
    flag.or_else(|| configured.clone())
        .unwrap_or_else(|| fallback.to_owned())
}
