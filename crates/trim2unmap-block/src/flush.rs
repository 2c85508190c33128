//! Buffer-cache flush

#![allow(unsafe_code)]

use std::os::fd::{AsRawFd, BorrowedFd};

use tracing::debug;

use crate::device::PhysicalDevice;
use crate::error::{Error, Result};

nix::ioctl_none!(blkflsbuf_ioctl, 0x12, 97);

/// Issue BLKFLSBUF against a block device
pub fn blkflsbuf(fd: BorrowedFd<'_>) -> Result<()> {
    // SAFETY: BLKFLSBUF takes no argument.
    unsafe { blkflsbuf_ioctl(fd.as_raw_fd()) }.map_err(Error::Flush)?;
    Ok(())
}

/// Ask the device to purge its buffer cache
pub fn flush<D: PhysicalDevice + ?Sized>(dev: &mut D) -> Result<()> {
    debug!("Flush: Begin");
    dev.flush_buffers()?;
    debug!("Flush: Done");
    Ok(())
}
