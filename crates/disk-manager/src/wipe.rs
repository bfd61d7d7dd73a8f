// Copyright 2021 System76 <info@system76.com>
// SPDX-License-Identifier: LGPL-3.0-only

use devicemapper::{DevId, DmError, DmOptions, DM};
use rand::RngCore;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;

const CHUNK_SIZE: usize = 4 << 20;

const EIO: i32 = 5;
const ENOSPC: i32 = 28;

/// How a device reports that it has no more room.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backing {
    /// Partitions, physical volumes, and linear volumes end with `ENOSPC`.
    Linear,
    /// A thin volume is larger than its pool. Once the pool is exhausted,
    /// dm-thin fails further writes with `EIO`.
    Thin,
}

impl Backing {
    fn is_full(self, why: &io::Error) -> bool {
        match why.raw_os_error() {
            Some(ENOSPC) => true,
            Some(EIO) => self == Backing::Thin,
            _ => false,
        }
    }
}

/// Fills `writer` with random data until it accepts no more, returning the bytes written.
pub fn fill<W: Write>(writer: &mut W, backing: Backing) -> io::Result<u64> {
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut rng = rand::thread_rng();
    let mut written = 0;

    loop {
        rng.fill_bytes(&mut buffer);
        match writer.write(&buffer) {
            Ok(0) => break,
            Ok(count) => written += count as u64,
            Err(why) if backing.is_full(&why) => break,
            Err(why) if why.kind() == io::ErrorKind::Interrupted => continue,
            Err(why) => return Err(why),
        }
    }

    match writer.flush() {
        Err(why) if backing.is_full(&why) => (),
        result => result?,
    }

    Ok(written)
}

/// Overwrites a whole block device with random data.
pub fn overwrite(device: &Path, backing: Backing) -> io::Result<u64> {
    tracing::info!("overwriting {:?} with random data", device);
    let mut file = OpenOptions::new().write(true).open(device)?;
    let written = fill(&mut file, backing)?;

    match file.sync_all() {
        Err(why) if backing.is_full(&why) => {
            tracing::warn!("{:?} exhausted its pool while syncing", device)
        }
        result => result?,
    }

    tracing::info!("wrote {} bytes to {:?}", written, device);
    Ok(written)
}

/// Removes every device-mapper mapping whose name starts with `prefix`.
pub fn remove_mappings(prefix: &str) -> Result<Vec<String>, DmError> {
    let dm = DM::new()?;
    let mut removed = Vec::new();

    for (name, _, _) in dm.list_devices()? {
        let display_name = name.to_string();
        if !display_name.starts_with(prefix) {
            continue;
        }

        tracing::info!("removing device map {}", display_name);
        dm.device_remove(&DevId::Name(&name), DmOptions::default())?;
        removed.push(display_name);
    }

    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fills_until_the_device_is_full() {
        let mut device = vec![0u8; CHUNK_SIZE + CHUNK_SIZE / 2];
        let written = fill(&mut device.as_mut_slice(), Backing::Linear).unwrap();

        assert_eq!(written, device.len() as u64);
        assert!(device.iter().any(|&byte| byte != 0));
    }

    struct Full;

    impl Write for Full {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(io::Error::from_raw_os_error(ENOSPC))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn no_space_ends_the_overwrite() {
        assert_eq!(fill(&mut Full, Backing::Linear).unwrap(), 0);
        assert_eq!(fill(&mut Full, Backing::Thin).unwrap(), 0);
    }

    /// Accepts a number of chunks, then fails the way an exhausted thin pool does.
    struct ExhaustedPool {
        chunks: usize,
    }

    impl Write for ExhaustedPool {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.chunks == 0 {
                return Err(io::Error::from_raw_os_error(EIO));
            }

            self.chunks -= 1;
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn exhausted_thin_pool_ends_the_overwrite() {
        let written = fill(&mut ExhaustedPool { chunks: 2 }, Backing::Thin).unwrap();
        assert_eq!(written, 2 * CHUNK_SIZE as u64);
    }

    #[test]
    fn io_errors_on_linear_devices_are_fatal() {
        let error = fill(&mut ExhaustedPool { chunks: 2 }, Backing::Linear).unwrap_err();
        assert_eq!(error.raw_os_error(), Some(EIO));
    }
}
