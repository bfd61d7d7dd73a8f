// Copyright 2021 System76 <info@system76.com>
// SPDX-License-Identifier: LGPL-3.0-only

#[macro_use]
extern crate serde;
#[macro_use]
extern crate thiserror;

mod block_types;
pub mod boot_image;
pub mod classify;
pub mod compose;
pub mod crypttab;
pub mod encrypt;
pub mod firmware;
pub mod luks;
pub mod lvm;
pub mod mounts;
pub mod ops;
pub mod partition;
pub mod plan;
pub mod system;
pub mod trust;
mod udev;
pub mod volumes;
pub mod wipe;

pub use self::block_types::*;
pub use self::udev::*;
