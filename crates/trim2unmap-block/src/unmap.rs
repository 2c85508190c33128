//! SCSI UNMAP command encoding
//!
//! A discard request becomes a 10-byte UNMAP CDB plus a 24-byte parameter
//! list holding exactly one block descriptor:
//!
//! ```text
//! CDB (10 bytes)
//! ┌──────┬────────────────────────┬──────┬──────┐
//! │ 0x42 │ 0 (bytes 1-7)          │ 0x18 │ 0    │
//! └──────┴────────────────────────┴──────┴──────┘
//!
//! Parameter list (24 bytes, big-endian)
//!  0..2   data length            = 22
//!  2..4   block descriptor length = 16
//!  4..8   reserved
//!  8..16  LBA (upper 32 bits always zero)
//! 16..20  number of logical blocks
//! 20..24  reserved
//! ```

use crate::error::{Error, Result};

/// UNMAP operation code
pub const UNMAP_OPCODE: u8 = 0x42;

/// CDB length
pub const CDB_LEN: usize = 10;

/// Parameter list length (header + one descriptor)
pub const PARAM_LEN: usize = 24;

const PARAM_DATA_LEN: u16 = (PARAM_LEN - 2) as u16;
const BLOCK_DESC_DATA_LEN: u16 = 16;

// Field offsets within the parameter list
const OFF_DATA_LEN: usize = 0;
const OFF_DESC_LEN: usize = 2;
const OFF_LBA: usize = 12;
const OFF_COUNT: usize = 16;

// CDB parameter list length field (byte 8 is its low byte)
const OFF_CDB_PARAM_LEN: usize = 8;

/// Encoded UNMAP command for one block range
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnmapCommand {
    cdb: [u8; CDB_LEN],
    params: [u8; PARAM_LEN],
}

impl UnmapCommand {
    /// Build the command for a byte range on a device with `block_size`
    /// byte logical blocks.
    ///
    /// Fails if either value is not block aligned or if the resulting LBA or
    /// block count does not fit the 32-bit descriptor fields.
    pub fn build(offset: u64, length: u32, block_size: u32) -> Result<Self> {
        let bs = u64::from(block_size);
        let length = u64::from(length);

        if offset % bs != 0 {
            return Err(Error::Misaligned {
                what: "start position",
                value: offset,
                block_size,
            });
        }
        if length % bs != 0 {
            return Err(Error::Misaligned {
                what: "length",
                value: length,
                block_size,
            });
        }

        let lba = u32::try_from(offset / bs).map_err(|_| Error::OutOfRange {
            what: "LBA",
            value: offset / bs,
        })?;
        let count = u32::try_from(length / bs).map_err(|_| Error::OutOfRange {
            what: "NUM",
            value: length / bs,
        })?;

        Ok(Self::encode(lba, count))
    }

    /// Encode an already validated (lba, count) pair
    #[must_use]
    pub fn encode(lba: u32, count: u32) -> Self {
        let mut cdb = [0u8; CDB_LEN];
        cdb[0] = UNMAP_OPCODE;
        cdb[OFF_CDB_PARAM_LEN] = PARAM_LEN as u8;

        let mut params = [0u8; PARAM_LEN];
        params[OFF_DATA_LEN..OFF_DATA_LEN + 2].copy_from_slice(&PARAM_DATA_LEN.to_be_bytes());
        params[OFF_DESC_LEN..OFF_DESC_LEN + 2].copy_from_slice(&BLOCK_DESC_DATA_LEN.to_be_bytes());
        params[OFF_LBA..OFF_LBA + 4].copy_from_slice(&lba.to_be_bytes());
        params[OFF_COUNT..OFF_COUNT + 4].copy_from_slice(&count.to_be_bytes());

        Self { cdb, params }
    }

    /// Command descriptor block
    #[must_use]
    pub const fn cdb(&self) -> &[u8; CDB_LEN] {
        &self.cdb
    }

    /// Parameter list sent to the device
    #[must_use]
    pub const fn parameters(&self) -> &[u8; PARAM_LEN] {
        &self.params
    }

    /// First logical block of the unmapped range
    #[must_use]
    pub fn lba(&self) -> u32 {
        read_be32(&self.params, OFF_LBA)
    }

    /// Number of logical blocks to unmap
    #[must_use]
    pub fn block_count(&self) -> u32 {
        read_be32(&self.params, OFF_COUNT)
    }
}

fn read_be32(buf: &[u8], off: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&buf[off..off + 4]);
    u32::from_be_bytes(word)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    const EXPECTED_CDB: [u8; CDB_LEN] = [0x42, 0, 0, 0, 0, 0, 0, 0, 0x18, 0];

    #[test]
    fn test_build_concrete_range() {
        // 512-byte blocks, start 512, length 1024 → LBA 1, 2 blocks
        let cmd = UnmapCommand::build(512, 1024, 512).unwrap();

        assert_eq!(cmd.cdb(), &EXPECTED_CDB);
        assert_eq!(
            cmd.parameters(),
            &[
                0x00, 0x16, 0x00, 0x10, // header
                0, 0, 0, 0, 0, 0, 0, 0, // reserved + LBA high word
                0x00, 0x00, 0x00, 0x01, // LBA
                0x00, 0x00, 0x00, 0x02, // count
                0, 0, 0, 0, // reserved
            ]
        );
        assert_eq!(cmd.lba(), 1);
        assert_eq!(cmd.block_count(), 2);
    }

    #[test]
    fn test_build_layout_across_block_sizes() {
        for &bs in &[512u32, 4096, 520] {
            for &(lba, count) in &[(0u64, 0u64), (7, 1), (0xdead_beef, 3), (u64::from(u32::MAX), 1)] {
                let count_bytes = u32::try_from(count * u64::from(bs)).unwrap();
                let cmd = UnmapCommand::build(lba * u64::from(bs), count_bytes, bs).unwrap();
                let p = cmd.parameters();

                assert_eq!(cmd.cdb(), &EXPECTED_CDB);
                assert_eq!(&p[0..4], &[0x00, 0x16, 0x00, 0x10]);
                assert!(p[4..12].iter().all(|&b| b == 0));
                assert_eq!(&p[12..16], &(lba as u32).to_be_bytes());
                assert_eq!(&p[16..20], &(count as u32).to_be_bytes());
                assert!(p[20..24].iter().all(|&b| b == 0));
            }
        }
    }

    #[test]
    fn test_misaligned_offset() {
        let err = UnmapCommand::build(513, 512, 512).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(matches!(
            err,
            Error::Misaligned {
                what: "start position",
                value: 513,
                block_size: 512
            }
        ));
    }

    #[test]
    fn test_misaligned_length() {
        let err = UnmapCommand::build(0, 1000, 512).unwrap_err();
        assert!(matches!(
            err,
            Error::Misaligned {
                what: "length",
                value: 1000,
                ..
            }
        ));
    }

    #[test]
    fn test_lba_out_of_range() {
        // First block past the 32-bit LBA field
        let offset = (u64::from(u32::MAX) + 1) * 512;
        let err = UnmapCommand::build(offset, 512, 512).unwrap_err();
        assert!(matches!(
            err,
            Error::OutOfRange {
                what: "LBA",
                value
            } if value == u64::from(u32::MAX) + 1
        ));
    }

    #[test]
    fn test_count_at_limit() {
        // block_size 1 is the only way a u32 length reaches the count limit
        let cmd = UnmapCommand::build(0, u32::MAX, 1).unwrap();
        assert_eq!(cmd.block_count(), u32::MAX);
    }
}
