//! Positioned read/write against the physical device
//!
//! Virtual-device byte ranges map 1:1 onto the physical device. A transfer
//! call may move fewer bytes than asked; the loop keeps going until the whole
//! range is done. A call that moves nothing or fails ends the operation.

use std::io::{Read, Seek, SeekFrom, Write};

use crate::error::{Error, Result};

/// Fill `buf` from the device starting at byte `offset`
pub fn read_at<D: Read + Seek + ?Sized>(dev: &mut D, buf: &mut [u8], offset: u64) -> Result<()> {
    seek(dev, "Read", offset)?;

    let mut done = 0;
    while done < buf.len() {
        let pos = offset + done as u64;
        match dev.read(&mut buf[done..]) {
            Ok(0) => {
                return Err(Error::ZeroTransfer {
                    op: "Read",
                    offset: pos,
                    remaining: buf.len() - done,
                });
            }
            Ok(n) => done += n,
            Err(source) => {
                return Err(Error::Io {
                    op: "Read",
                    offset: pos,
                    source,
                });
            }
        }
    }
    Ok(())
}

/// Write all of `buf` to the device starting at byte `offset`
pub fn write_at<D: Write + Seek + ?Sized>(dev: &mut D, buf: &[u8], offset: u64) -> Result<()> {
    seek(dev, "Write", offset)?;

    let mut done = 0;
    while done < buf.len() {
        let pos = offset + done as u64;
        match dev.write(&buf[done..]) {
            Ok(0) => {
                return Err(Error::ZeroTransfer {
                    op: "Write",
                    offset: pos,
                    remaining: buf.len() - done,
                });
            }
            Ok(n) => done += n,
            Err(source) => {
                return Err(Error::Io {
                    op: "Write",
                    offset: pos,
                    source,
                });
            }
        }
    }
    Ok(())
}

fn seek<D: Seek + ?Sized>(dev: &mut D, op: &'static str, offset: u64) -> Result<()> {
    dev.seek(SeekFrom::Start(offset))
        .map_err(|source| Error::Io { op, offset, source })?;
    Ok(())
}
