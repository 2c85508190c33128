//! The operation set handed to the virtual block-device engine
//!
//! The engine advertises [`BlockBackend::geometry`] for the virtual device
//! and calls the four operations for each request it receives.

use tracing::debug;

use crate::device::{DeviceContext, Geometry, PhysicalDevice};
use crate::error::Result;
use crate::flush;
use crate::passthrough;
use crate::unmap::UnmapCommand;

/// Read / write / trim / flush entry points of a virtual block device
pub trait BlockBackend: Send + Sync {
    /// Size and logical block size to advertise
    fn geometry(&self) -> Geometry;

    /// Fill `buf` from byte `offset`
    fn read(&self, buf: &mut [u8], offset: u64) -> Result<()>;

    /// Write all of `buf` at byte `offset`
    fn write(&self, buf: &[u8], offset: u64) -> Result<()>;

    /// Discard `len` bytes starting at byte `offset`
    fn trim(&self, offset: u64, len: u32) -> Result<()>;

    /// Flush buffered data
    fn flush(&self) -> Result<()>;
}

impl<D: PhysicalDevice> BlockBackend for DeviceContext<D> {
    fn geometry(&self) -> Geometry {
        DeviceContext::geometry(self)
    }

    fn read(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        passthrough::read_at(&mut *self.lock(), buf, offset)
    }

    fn write(&self, buf: &[u8], offset: u64) -> Result<()> {
        passthrough::write_at(&mut *self.lock(), buf, offset)
    }

    fn trim(&self, offset: u64, len: u32) -> Result<()> {
        debug!("Trim: start={offset}, len={len}");

        // Validation happens before the device is touched.
        let cmd = UnmapCommand::build(offset, len, self.block_size())?;
        self.lock().unmap(&cmd)
    }

    fn flush(&self) -> Result<()> {
        flush::flush(&mut *self.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, ErrorKind};
    use std::io::{Cursor, Read, Seek, SeekFrom, Write};

    /// In-memory device that records submitted UNMAP commands
    #[derive(Debug, Default)]
    struct MemDevice {
        data: Cursor<Vec<u8>>,
        unmaps: Vec<UnmapCommand>,
        flushes: usize,
        fail_flush: bool,
    }

    impl MemDevice {
        fn with_size(size: usize) -> Self {
            Self {
                data: Cursor::new(vec![0u8; size]),
                ..Self::default()
            }
        }
    }

    impl Read for MemDevice {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.data.read(buf)
        }
    }

    impl Write for MemDevice {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.data.write(buf)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Seek for MemDevice {
        fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
            self.data.seek(pos)
        }
    }

    impl PhysicalDevice for MemDevice {
        fn unmap(&mut self, cmd: &UnmapCommand) -> Result<()> {
            self.unmaps.push(cmd.clone());
            Ok(())
        }

        fn flush_buffers(&mut self) -> Result<()> {
            if self.fail_flush {
                return Err(Error::Flush(nix::Error::EIO));
            }
            self.flushes += 1;
            Ok(())
        }
    }

    fn context(dev: MemDevice) -> DeviceContext<MemDevice> {
        let geometry = Geometry {
            device_size: dev.data.get_ref().len() as u64,
            block_size: 512,
        };
        DeviceContext::new(dev, geometry).unwrap()
    }

    #[test]
    fn test_zero_block_size_rejected() {
        let geometry = Geometry {
            device_size: 4096,
            block_size: 0,
        };
        let err = DeviceContext::new(MemDevice::with_size(4096), geometry).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Setup);
    }

    #[test]
    fn test_write_then_read() {
        let ctx = context(MemDevice::with_size(8192));
        assert_eq!(ctx.geometry().device_size, 8192);

        ctx.write(b"hello, block", 1000).unwrap();
        let mut buf = [0u8; 12];
        ctx.read(&mut buf, 1000).unwrap();
        assert_eq!(&buf, b"hello, block");
    }

    #[test]
    fn test_trim_submits_unmap() {
        let ctx = context(MemDevice::with_size(8192));
        ctx.trim(512, 1024).unwrap();

        let dev = ctx.into_handle();
        assert_eq!(dev.unmaps.len(), 1);
        assert_eq!(dev.unmaps[0].lba(), 1);
        assert_eq!(dev.unmaps[0].block_count(), 2);
        assert_eq!(&dev.unmaps[0].parameters()[12..20], &[0, 0, 0, 1, 0, 0, 0, 2]);
    }

    #[test]
    fn test_misaligned_trim_never_reaches_device() {
        let ctx = context(MemDevice::with_size(8192));

        let err = ctx.trim(100, 512).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        let err = ctx.trim(512, 100).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        assert!(ctx.into_handle().unmaps.is_empty());
    }

    #[test]
    fn test_out_of_range_trim_never_reaches_device() {
        let ctx = context(MemDevice::with_size(8192));

        let err = ctx.trim((u64::from(u32::MAX) + 1) * 512, 512).unwrap_err();
        assert!(matches!(err, Error::OutOfRange { what: "LBA", .. }));
        assert!(ctx.into_handle().unmaps.is_empty());
    }

    #[test]
    fn test_flush() {
        let ctx = context(MemDevice::with_size(512));
        ctx.flush().unwrap();
        ctx.flush().unwrap();
        assert_eq!(ctx.into_handle().flushes, 2);
    }

    #[test]
    fn test_flush_failure_names_flush() {
        let ctx = context(MemDevice {
            fail_flush: true,
            ..MemDevice::with_size(512)
        });

        let err = ctx.flush().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(err.to_string().starts_with("Flush"));
    }

    #[test]
    fn test_read_past_end_fails() {
        let ctx = context(MemDevice::with_size(1024));
        let mut buf = [0u8; 512];
        let err = ctx.read(&mut buf, 768).unwrap_err();
        assert!(matches!(err, Error::ZeroTransfer { op: "Read", .. }));
    }
}
