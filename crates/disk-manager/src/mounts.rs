// Copyright 2021 System76 <info@system76.com>
// SPDX-License-Identifier: LGPL-3.0-only

use procfs::process::{MountInfo, Process};
use procfs::ProcResult;
use std::io;
use std::path::{Path, PathBuf};
use sys_mount::UnmountFlags;

/// Joins an absolute path from the target's point of view onto the directory it is mounted at.
pub fn within(root: &Path, path: &str) -> PathBuf {
    match path.trim_start_matches('/') {
        "" => root.to_owned(),
        relative => root.join(relative),
    }
}

fn mount_table() -> ProcResult<Vec<MountInfo>> {
    Ok(Process::myself()?.mountinfo()?.into_iter().collect())
}

/// The source device of the filesystem mounted at `mount_point`, if any.
pub fn source_of(mount_point: &Path) -> ProcResult<Option<String>> {
    let source = mount_table()?
        .into_iter()
        .rev()
        .find(|info| info.mount_point == mount_point)
        .and_then(|info| info.mount_source);

    Ok(source)
}

pub fn is_mount_point(path: &Path) -> ProcResult<bool> {
    Ok(mount_table()?.iter().any(|info| info.mount_point == path))
}

/// Mount points at or below `root`, deepest first.
pub fn mounted_under(root: &Path) -> ProcResult<Vec<PathBuf>> {
    let mut points = mount_table()?
        .into_iter()
        .map(|info| info.mount_point)
        .filter(|point| point.starts_with(root))
        .collect::<Vec<_>>();

    sort_deepest_first(&mut points);
    points.dedup();
    Ok(points)
}

fn sort_deepest_first(points: &mut [PathBuf]) {
    points.sort_by(|a, b| {
        b.components()
            .count()
            .cmp(&a.components().count())
            .then_with(|| a.cmp(b))
    });
}

/// Unmounts every filesystem mounted at or below `root`.
pub fn unmount_tree(root: &Path) -> io::Result<()> {
    let points = mounted_under(root).map_err(|why| io::Error::new(io::ErrorKind::Other, why))?;

    for point in points {
        tracing::info!("unmounting {:?}", point);
        sys_mount::unmount(&point, UnmountFlags::empty())?;
    }

    Ok(())
}
