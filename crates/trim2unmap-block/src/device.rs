//! Physical device handle and geometry
//!
//! The device is opened once, its size and logical block size are queried
//! once, and the result is frozen into a [`DeviceContext`] that every backend
//! operation borrows.

#![allow(unsafe_code)]

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::fd::{AsFd, AsRawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use parking_lot::{Mutex, MutexGuard};
use tracing::info;

use crate::error::{Error, Result};
use crate::flush;
use crate::sg_io;
use crate::unmap::UnmapCommand;

nix::ioctl_read!(blkgetsize64, 0x12, 114, u64);
nix::ioctl_read_bad!(blksszget, nix::request_code_none!(0x12, 104), libc::c_int);

/// Size and logical block size advertised to the virtual device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Total device size in bytes
    pub device_size: u64,
    /// Logical block size in bytes
    pub block_size: u32,
}

/// Operations the backend needs from the physical device.
///
/// Positioned I/O comes from `Read + Write + Seek`; the two device commands
/// are separate so tests can run against memory.
pub trait PhysicalDevice: Read + Write + Seek + Send {
    /// Submit an UNMAP command and wait for it to complete
    fn unmap(&mut self, cmd: &UnmapCommand) -> Result<()>;

    /// Purge the device's buffer cache
    fn flush_buffers(&mut self) -> Result<()>;
}

/// A block device node opened read/write
#[derive(Debug)]
pub struct RawDevice {
    file: File,
    path: String,
}

impl RawDevice {
    /// Open `path` for read/write with large-file support
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_LARGEFILE)
            .open(&path)
            .map_err(|source| Error::Open {
                path: path_str.clone(),
                source,
            })?;

        Ok(Self {
            file,
            path: path_str,
        })
    }

    /// Device path as given at open time
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Query size (BLKGETSIZE64) and logical block size (BLKSSZGET)
    pub fn query_geometry(&self) -> Result<Geometry> {
        let fd = self.file.as_raw_fd();

        let mut device_size: u64 = 0;
        // SAFETY: BLKGETSIZE64 writes one u64 through the pointer.
        unsafe { blkgetsize64(fd, &mut device_size) }.map_err(|source| Error::Geometry {
            path: self.path.clone(),
            what: "size",
            source,
        })?;

        let mut block_size: libc::c_int = 0;
        // SAFETY: BLKSSZGET writes one int through the pointer.
        unsafe { blksszget(fd, &mut block_size) }.map_err(|source| Error::Geometry {
            path: self.path.clone(),
            what: "block size",
            source,
        })?;

        let block_size = u32::try_from(block_size).map_err(|_| Error::InvalidGeometry {
            path: self.path.clone(),
            reason: format!("negative block size {block_size}"),
        })?;

        Ok(Geometry {
            device_size,
            block_size,
        })
    }
}

impl Read for RawDevice {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.file.read(buf)
    }
}

impl Write for RawDevice {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file.flush()
    }
}

impl Seek for RawDevice {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.file.seek(pos)
    }
}

impl PhysicalDevice for RawDevice {
    fn unmap(&mut self, cmd: &UnmapCommand) -> Result<()> {
        sg_io::execute(self.file.as_fd(), cmd)
    }

    fn flush_buffers(&mut self) -> Result<()> {
        flush::blkflsbuf(self.file.as_fd())
    }
}

/// Device handle plus frozen geometry.
///
/// The handle carries a file position shared by every operation, so it sits
/// behind a mutex: one seek-and-transfer sequence or device command at a
/// time, whatever the calling engine does.
#[derive(Debug)]
pub struct DeviceContext<D = RawDevice> {
    handle: Mutex<D>,
    geometry: Geometry,
}

impl DeviceContext<RawDevice> {
    /// Open the physical device and query its geometry
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let device = RawDevice::open(path)?;
        let geometry = device.query_geometry()?;

        info!(
            "The size of this device is {} bytes.",
            geometry.device_size
        );
        info!(
            "The block size of this device is {} bytes.",
            geometry.block_size
        );

        let path = device.path().to_string();
        Self::new(device, geometry).map_err(|e| match e {
            Error::InvalidGeometry { reason, .. } => Error::InvalidGeometry { path, reason },
            other => other,
        })
    }
}

impl<D: PhysicalDevice> DeviceContext<D> {
    /// Wrap an already opened device. Rejects a zero block size.
    pub fn new(handle: D, geometry: Geometry) -> Result<Self> {
        if geometry.block_size == 0 {
            return Err(Error::InvalidGeometry {
                path: String::new(),
                reason: "block size is zero".into(),
            });
        }
        Ok(Self {
            handle: Mutex::new(handle),
            geometry,
        })
    }

    /// Frozen geometry
    pub const fn geometry(&self) -> Geometry {
        self.geometry
    }

    /// Logical block size in bytes
    pub const fn block_size(&self) -> u32 {
        self.geometry.block_size
    }

    /// Total device size in bytes
    pub const fn device_size(&self) -> u64 {
        self.geometry.device_size
    }

    /// Exclusive access to the device handle
    pub(crate) fn lock(&self) -> MutexGuard<'_, D> {
        self.handle.lock()
    }

    /// Consume the context and return the device handle
    pub fn into_handle(self) -> D {
        self.handle.into_inner()
    }
}
