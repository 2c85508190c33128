//! SG_IO submission of UNMAP commands
//!
//! Linux only: the command goes through the generic SCSI pass-through ioctl
//! on the block device node, with data flowing to the device.

#![allow(unsafe_code)]

use std::os::fd::{AsRawFd, BorrowedFd};
use std::time::Duration;

use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::unmap::{CDB_LEN, PARAM_LEN, UnmapCommand};

/// Timeout applied to every UNMAP submission
pub const UNMAP_TIMEOUT: Duration = Duration::from_secs(60);

/// Sense buffer allowance
pub const SENSE_LEN: usize = 64;

const SG_INTERFACE_ID: i32 = b'S' as i32;
const SG_DXFER_TO_DEV: i32 = -2;

const SENSE_KEY_RECOVERED_ERROR: u8 = 0x01;

/// `struct sg_io_hdr` from `<scsi/sg.h>`
#[repr(C)]
#[derive(Debug)]
#[allow(dead_code)]
pub struct SgIoHdr {
    interface_id: libc::c_int,
    dxfer_direction: libc::c_int,
    cmd_len: libc::c_uchar,
    mx_sb_len: libc::c_uchar,
    iovec_count: libc::c_ushort,
    dxfer_len: libc::c_uint,
    dxferp: *mut libc::c_void,
    cmdp: *mut libc::c_uchar,
    sbp: *mut libc::c_uchar,
    timeout: libc::c_uint,
    flags: libc::c_uint,
    pack_id: libc::c_int,
    usr_ptr: *mut libc::c_void,
    status: libc::c_uchar,
    masked_status: libc::c_uchar,
    msg_status: libc::c_uchar,
    sb_len_wr: libc::c_uchar,
    host_status: libc::c_ushort,
    driver_status: libc::c_ushort,
    resid: libc::c_int,
    duration: libc::c_uint,
    info: libc::c_uint,
}

nix::ioctl_readwrite_bad!(sg_io, 0x2285, SgIoHdr);

/// Submit `cmd` to the device behind `fd` and wait for completion.
///
/// A failed ioctl or any non-GOOD completion status is an error, except a
/// GOOD status carrying RECOVERED ERROR sense. Nothing is retried.
pub fn execute(fd: BorrowedFd<'_>, cmd: &UnmapCommand) -> Result<()> {
    // The kernel only reads these, but the header wants mutable pointers.
    let mut cdb = *cmd.cdb();
    let mut params = *cmd.parameters();
    let mut sense = [0u8; SENSE_LEN];

    let mut hdr = SgIoHdr {
        interface_id: SG_INTERFACE_ID,
        dxfer_direction: SG_DXFER_TO_DEV,
        cmd_len: CDB_LEN as libc::c_uchar,
        mx_sb_len: SENSE_LEN as libc::c_uchar,
        iovec_count: 0,
        dxfer_len: PARAM_LEN as libc::c_uint,
        dxferp: params.as_mut_ptr().cast(),
        cmdp: cdb.as_mut_ptr(),
        sbp: sense.as_mut_ptr(),
        timeout: UNMAP_TIMEOUT.as_millis() as libc::c_uint,
        flags: 0,
        pack_id: 0,
        usr_ptr: std::ptr::null_mut(),
        status: 0,
        masked_status: 0,
        msg_status: 0,
        sb_len_wr: 0,
        host_status: 0,
        driver_status: 0,
        resid: 0,
        duration: 0,
        info: 0,
    };

    // SAFETY: every pointer in `hdr` refers to a local buffer that outlives
    // the call, and the lengths match the buffers.
    unsafe { sg_io(fd.as_raw_fd(), &mut hdr) }.map_err(Error::SgIo)?;

    trace!(
        "SG_IO done: status={:#x} host={:#x} driver={:#x} duration={}ms",
        hdr.status, hdr.host_status, hdr.driver_status, hdr.duration
    );

    check_completion(&hdr, &sense)
}

fn check_completion(hdr: &SgIoHdr, sense: &[u8; SENSE_LEN]) -> Result<()> {
    if hdr.status == 0 && hdr.host_status == 0 && hdr.driver_status == 0 {
        return Ok(());
    }
    let written = usize::from(hdr.sb_len_wr).min(SENSE_LEN);
    let key = sense_key(&sense[..written]);

    // GOOD status with only sense data attached: the command completed.
    if hdr.status == 0 && hdr.host_status == 0 && key == SENSE_KEY_RECOVERED_ERROR {
        debug!(
            "SG_IO: UNMAP completed with RECOVERED ERROR sense (driver {:#x})",
            hdr.driver_status
        );
        return Ok(());
    }

    Err(Error::ScsiStatus {
        status: hdr.status,
        host_status: hdr.host_status,
        driver_status: hdr.driver_status,
        sense_key: key,
    })
}

/// Extract the sense key from fixed (0x70/0x71) or descriptor (0x72/0x73)
/// format sense data. Returns 0 when no sense data is present.
fn sense_key(sense: &[u8]) -> u8 {
    match sense.first().map(|b| b & 0x7f) {
        Some(0x70 | 0x71) if sense.len() > 2 => sense[2] & 0x0f,
        Some(0x72 | 0x73) if sense.len() > 1 => sense[1] & 0x0f,
        _ => 0,
    }
}
