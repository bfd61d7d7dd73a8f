// Copyright 2021 System76 <info@system76.com>
// SPDX-License-Identifier: GPL-3.0-only

mod clean;
mod config;
mod disk;
mod setup;
mod target;

use crate::config::Defaults;
use clap::{Parser, Subcommand};
use std::fmt;
use std::process::exit;
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "KEYSTONE_LOG";

#[derive(Parser, Debug)]
#[command(name = "keystone")]
#[command(about = "Provisions encrypted, redundant workstation storage from a live environment")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Provision the disks, install a system, and configure it
    Setup(setup::SetupArgs),
    /// Configure the installed system; runs inside the provisioned root
    Target(target::TargetArgs),
    /// List the disks which would be provisioned
    Disk(disk::DiskArgs),
    /// Unmount and securely erase everything a previous setup created
    Clean,
}

/// A requirement of the invocation which the system does not meet.
#[derive(Debug)]
pub struct PreconditionFailed(pub String);

impl fmt::Display for PreconditionFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "precondition failed: {}", self.0)
    }
}

impl std::error::Error for PreconditionFailed {}

fn exit_code(error: &anyhow::Error) -> i32 {
    if error.downcast_ref::<PreconditionFailed>().is_some() {
        3
    } else {
        1
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    better_panic::install();
    init_logging();

    let cli = Cli::parse();
    let defaults = Defaults::load();

    let result = match cli.command {
        Command::Setup(args) => setup::run(args, &defaults),
        Command::Target(args) => target::run(args, &defaults),
        Command::Disk(args) => disk::run(args),
        Command::Clean => clean::run(),
    };

    if let Err(why) = result {
        tracing::error!("{:?}", why);
        exit(exit_code(&why));
    }
}
