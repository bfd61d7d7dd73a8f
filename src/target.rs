// Copyright 2021 System76 <info@system76.com>
// SPDX-License-Identifier: GPL-3.0-only

use crate::config::{self, Defaults};
use anyhow::Context;
use cradle::prelude::*;
use keystone_disk_manager::firmware::SystemFirmware;
use keystone_disk_manager::mounts::within;
use keystone_disk_manager::trust::{self, HardwareFacts, TrustState};
use std::fs;
use std::io;
use std::os::unix::fs::symlink;
use std::path::Path;

#[derive(clap::Args, Debug)]
pub struct TargetArgs {
    /// The system partitions were encrypted
    #[arg(short = 'E')]
    pub encrypt: bool,

    #[arg(short = 'H')]
    pub hostname: Option<String>,

    #[arg(short = 'N')]
    pub fullname: Option<String>,

    #[arg(short = 'U')]
    pub username: Option<String>,

    /// Password of the created user
    #[arg(short = 'P')]
    pub password: Option<String>,

    #[arg(short = 'L')]
    pub locale: Option<String>,

    #[arg(short = 'R', value_name = "TIMEZONE")]
    pub timezone: Option<String>,
}

pub fn run(args: TargetArgs, defaults: &Defaults) -> anyhow::Result<()> {
    let root = Path::new("/");
    let encrypt = args.encrypt || defaults.encrypt;

    trust::require_keyfile(root, encrypt).context("refusing to configure the target")?;

    let hostname = config::pick(args.hostname, &defaults.hostname, config::DEFAULT_HOSTNAME);
    let locale = config::pick(args.locale, &defaults.locale, config::DEFAULT_LOCALE);
    let timezone = config::pick(args.timezone, &defaults.timezone, config::DEFAULT_TIMEZONE);

    set_hostname(root, &hostname)?;
    set_locale(root, &locale)?;
    let () = run_result!("locale-gen").context("locale-gen failed")?;
    set_timezone(root, &timezone)?;

    match args.username.or_else(|| defaults.username.clone()) {
        Some(username) => {
            let fullname = args.fullname.or_else(|| defaults.fullname.clone());
            create_user(&username, fullname.as_deref(), args.password.as_deref())?;
        }
        None => tracing::warn!("no username given, only root will be able to log in"),
    }

    tracing::info!("installing the boot manager");
    let () = run_result!("bootctl", "install").context("bootctl install failed")?;

    let state = trust::evaluate(encrypt, HardwareFacts::probe());
    if state == TrustState::EncryptedInsecureEmbeddedKey {
        tracing::warn!("the disk key is not sealed to this machine's hardware");
    }

    trust::enroll(&mut SystemFirmware, state, root)
        .with_context(|| format!("failed to enroll trust as {:?}", state))
}

fn set_hostname(root: &Path, hostname: &str) -> anyhow::Result<()> {
    if !hostname_validator::is_valid(hostname) {
        anyhow::bail!("`{}` is not a valid hostname", hostname);
    }

    let path = within(root, "/etc/hostname");
    fs::write(&path, format!("{}\n", hostname))
        .with_context(|| format!("failed to write {:?}", path))
}

/// Writes `/etc/locale.conf` and enables the locale in `/etc/locale.gen`.
fn set_locale(root: &Path, locale: &str) -> anyhow::Result<()> {
    let conf = within(root, "/etc/locale.conf");
    fs::write(&conf, format!("LANG={}\n", locale))
        .with_context(|| format!("failed to write {:?}", conf))?;

    let gen = within(root, "/etc/locale.gen");
    let contents = match fs::read_to_string(&gen) {
        Ok(contents) => contents,
        Err(why) if why.kind() == io::ErrorKind::NotFound => String::new(),
        Err(why) => return Err(why).with_context(|| format!("failed to read {:?}", gen)),
    };

    fs::write(&gen, enable_locale(&contents, locale))
        .with_context(|| format!("failed to write {:?}", gen))
}

fn enable_locale(contents: &str, locale: &str) -> String {
    let charset = locale.split('.').nth(1).unwrap_or("UTF-8");
    let wanted = format!("{} {}", locale, charset);

    let mut found = false;
    let mut output = String::with_capacity(contents.len() + wanted.len() + 1);

    for line in contents.lines() {
        let uncommented = line.trim_start_matches('#').trim();
        if uncommented.split_whitespace().next() == Some(locale) {
            found = true;
            output.push_str(uncommented);
        } else {
            output.push_str(line);
        }
        output.push('\n');
    }

    if !found {
        output.push_str(&wanted);
        output.push('\n');
    }

    output
}

fn set_timezone(root: &Path, timezone: &str) -> anyhow::Result<()> {
    let zone = Path::new("/usr/share/zoneinfo").join(timezone);
    if !within(root, &zone.to_string_lossy()).is_file() {
        anyhow::bail!("unknown timezone `{}`", timezone);
    }

    let localtime = within(root, "/etc/localtime");
    if fs::symlink_metadata(&localtime).is_ok() {
        fs::remove_file(&localtime).with_context(|| format!("failed to remove {:?}", localtime))?;
    }

    symlink(&zone, &localtime).with_context(|| format!("failed to link {:?}", localtime))
}

fn create_user(username: &str, fullname: Option<&str>, password: Option<&str>) -> anyhow::Result<()> {
    tracing::info!("creating user {}", username);
    let () = run_result!(
        "useradd",
        "--create-home",
        "--groups",
        "wheel",
        "--comment",
        fullname.unwrap_or(username),
        username
    )
    .context("useradd failed")?;

    match password {
        Some(password) => {
            let () = run_result!(Stdin(format!("{}:{}\n", username, password)), "chpasswd")
                .context("chpasswd failed")?;
        }
        None => tracing::warn!("no password given for {}, the account stays locked", username),
    }

    Ok(())
}
