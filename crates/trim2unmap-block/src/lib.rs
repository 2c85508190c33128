//! trim2unmap block backend
//!
//! Serves a physical disk as a virtual block device. Reads, writes and
//! flushes pass straight through; discard (TRIM) requests are translated
//! into SCSI UNMAP commands submitted through SG_IO.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐
//! │ virtual block device │  (NBD engine, external to this crate)
//! └──────────┬───────────┘
//!            │ read / write / trim / flush
//! ┌──────────▼───────────┐
//! │    DeviceContext     │  BlockBackend impl
//! │  - passthrough I/O   │
//! │  - UnmapCommand      │
//! │  - SG_IO executor    │
//! │  - BLKFLSBUF flush   │
//! └──────────┬───────────┘
//!            │
//! ┌──────────▼───────────┐
//! │   physical device    │
//! └──────────────────────┘
//! ```

pub mod backend;
pub mod device;
pub mod error;
pub mod flush;
pub mod passthrough;
pub mod sg_io;
pub mod unmap;

pub use backend::BlockBackend;
pub use device::{DeviceContext, Geometry, PhysicalDevice, RawDevice};
pub use error::{Error, ErrorKind, Result};
pub use unmap::UnmapCommand;
