//! Error types for the trim2unmap backend
//!
//! Every failure the backend can hit is fatal to the process once it reaches
//! the CLI boundary, but the library only reports it. Callers that want to
//! act differently per failure class use [`Error::kind`].

use thiserror::Error;

/// Result type for backend operations
pub type Result<T> = std::result::Result<T, Error>;

/// Broad failure class, used by the embedding engine to pick a shutdown path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Device open or geometry query failed at startup
    Setup,
    /// Request rejected before any hardware access
    Validation,
    /// The device or the kernel transport reported a failure
    Transport,
}

/// Backend error
#[derive(Debug, Error)]
pub enum Error {
    // Setup errors
    #[error("failed to open `{path}': {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to get {what} of `{path}': {source}")]
    Geometry {
        path: String,
        what: &'static str,
        #[source]
        source: nix::Error,
    },

    #[error("invalid geometry for `{path}': {reason}")]
    InvalidGeometry { path: String, reason: String },

    // Validation errors
    #[error("Trim: {what} ({value}) is not multiple of block size ({block_size})")]
    Misaligned {
        what: &'static str,
        value: u64,
        block_size: u32,
    },

    #[error("Trim: calculated {what} ({value}) exceeds u32::MAX")]
    OutOfRange { what: &'static str, value: u64 },

    // Transport errors
    #[error("{op}: I/O error at offset {offset}: {source}")]
    Io {
        op: &'static str,
        offset: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("{op}: device returned no data at offset {offset} with {remaining} bytes outstanding")]
    ZeroTransfer {
        op: &'static str,
        offset: u64,
        remaining: usize,
    },

    #[error("Trim: SG_IO ioctl failed: {0}")]
    SgIo(#[source] nix::Error),

    #[error(
        "Trim: UNMAP rejected (status {status:#04x}, host {host_status:#06x}, driver {driver_status:#06x}, sense key {sense_key:#x})"
    )]
    ScsiStatus {
        status: u8,
        host_status: u16,
        driver_status: u16,
        sense_key: u8,
    },

    #[error("Flush: BLKFLSBUF ioctl failed: {0}")]
    Flush(#[source] nix::Error),
}

impl Error {
    /// Failure class of this error
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Open { .. } | Self::Geometry { .. } | Self::InvalidGeometry { .. } => {
                ErrorKind::Setup
            }
            Self::Misaligned { .. } | Self::OutOfRange { .. } => ErrorKind::Validation,
            Self::Io { .. }
            | Self::ZeroTransfer { .. }
            | Self::SgIo(_)
            | Self::ScsiStatus { .. }
            | Self::Flush(_) => ErrorKind::Transport,
        }
    }
}
