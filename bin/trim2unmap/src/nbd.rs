//! NBD kernel-driver engine
//!
//! Hands one end of a Unix socketpair to the Linux NBD driver and serves the
//! driver's requests on the other end. There is no handshake: geometry and
//! transmission flags go to the driver through ioctls on the `/dev/nbdX`
//! node, and the driver then speaks the plain request/reply protocol.

#![allow(unsafe_code)]
#![allow(clippy::cast_possible_truncation)]

use std::fs::{File, OpenOptions};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::Path;
use std::sync::{Arc, mpsc};
use std::thread::JoinHandle;

use anyhow::{Context, anyhow};
use nix::sys::ioctl::ioctl_param_type;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::{debug, info, warn};
use trim2unmap_block::{BlockBackend, Geometry};

// ── NBD protocol constants ────────────────────────────────────────────────────

const NBD_REQUEST_MAGIC: u32 = 0x2560_9513;
const NBD_REPLY_MAGIC: u32 = 0x6744_6698;

// Transmission flags
const NBD_FLAG_HAS_FLAGS: u16 = 0x0001;
const NBD_FLAG_READ_ONLY: u16 = 0x0002;
const NBD_FLAG_SEND_FLUSH: u16 = 0x0004;
const NBD_FLAG_SEND_TRIM: u16 = 0x0020;

// Commands
const NBD_CMD_READ: u16 = 0;
const NBD_CMD_WRITE: u16 = 1;
const NBD_CMD_DISC: u16 = 2;
const NBD_CMD_FLUSH: u16 = 3;
const NBD_CMD_TRIM: u16 = 4;

// ── NBD driver ioctls ─────────────────────────────────────────────────────────

nix::ioctl_write_int_bad!(nbd_set_sock, nix::request_code_none!(0xab, 0));
nix::ioctl_write_int_bad!(nbd_set_blksize, nix::request_code_none!(0xab, 1));
nix::ioctl_none!(nbd_do_it, 0xab, 3);
nix::ioctl_none!(nbd_clear_sock, 0xab, 4);
nix::ioctl_none!(nbd_clear_que, 0xab, 5);
nix::ioctl_write_int_bad!(nbd_set_size_blocks, nix::request_code_none!(0xab, 7));
nix::ioctl_none!(nbd_disconnect, 0xab, 8);
nix::ioctl_write_int_bad!(nbd_set_timeout, nix::request_code_none!(0xab, 9));
nix::ioctl_write_int_bad!(nbd_set_flags, nix::request_code_none!(0xab, 10));

/// Engine errors other than backend failures
#[derive(Debug, Error)]
pub enum ServeError {
    #[error("NBD socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error("NBD socket closed before the first request")]
    ClosedBeforeFirstRequest,

    #[error("bad request magic: {0:#x}")]
    BadMagic(u32),

    #[error("backend task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error(transparent)]
    Backend(#[from] trim2unmap_block::Error),
}

/// How the virtual device is presented to the kernel
#[derive(Debug, Clone, Copy, Default)]
pub struct NbdConfig {
    /// Advertise the device read-only and refuse writes/trims
    pub read_only: bool,
    /// Driver request timeout in seconds, 0 keeps the driver default
    pub io_timeout: u64,
}

impl NbdConfig {
    /// Transmission flags for NBD_SET_FLAGS
    pub const fn flags(&self) -> u16 {
        let mut flags = NBD_FLAG_HAS_FLAGS | NBD_FLAG_SEND_FLUSH | NBD_FLAG_SEND_TRIM;
        if self.read_only {
            flags |= NBD_FLAG_READ_ONLY;
        }
        flags
    }
}

/// An opened `/dev/nbdX` node
#[derive(Debug)]
pub struct NbdDevice {
    file: File,
    path: String,
}

impl NbdDevice {
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        Ok(Self {
            file,
            path: path.as_ref().to_string_lossy().to_string(),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Push geometry and timeout to the driver and drop any stale socket
    fn configure(&self, geometry: Geometry, config: &NbdConfig) -> nix::Result<()> {
        let fd = self.file.as_raw_fd();
        let blocks = geometry.device_size / u64::from(geometry.block_size);

        // SAFETY: these ioctls take their argument by value.
        unsafe {
            nbd_set_blksize(fd, geometry.block_size as ioctl_param_type)?;
            nbd_set_size_blocks(fd, blocks as ioctl_param_type)?;
            if config.io_timeout > 0 {
                nbd_set_timeout(fd, config.io_timeout as ioctl_param_type)?;
            }
            nbd_clear_sock(fd)?;
        }
        Ok(())
    }

    /// Ask the driver to send DISC and tear the device down
    pub fn disconnect(&self) -> nix::Result<()> {
        // SAFETY: NBD_DISCONNECT takes no argument.
        unsafe { nbd_disconnect(self.file.as_raw_fd()) }?;
        Ok(())
    }

    /// Hand the kernel its end of the socketpair and set transmission flags
    fn connect(&self, sock: RawFd, flags: u16) -> nix::Result<()> {
        let fd = self.file.as_raw_fd();

        // SAFETY: NBD_SET_SOCK/NBD_SET_FLAGS take their argument by value.
        let result = unsafe {
            nbd_set_sock(fd, sock as ioctl_param_type)
                .and_then(|_| nbd_set_flags(fd, ioctl_param_type::from(flags)))
        };
        if result.is_err() {
            // SAFETY: no-argument ioctl.
            let _ = unsafe { nbd_clear_sock(fd) };
        }
        result.map(|_| ())
    }

    /// Run the driver's transmission loop until disconnect
    fn transmit(&self) -> nix::Result<()> {
        let fd = self.file.as_raw_fd();

        // SAFETY: no-argument ioctls.
        let result = unsafe { nbd_do_it(fd) };
        unsafe {
            let _ = nbd_clear_que(fd);
            let _ = nbd_clear_sock(fd);
        }
        result.map(|_| ())
    }
}

/// Start the driver thread.
///
/// `connect` runs first and its outcome is reported back before `transmit`
/// starts; a failed connect is returned here and `transmit` never runs.
fn spawn_driver<C, T>(connect: C, transmit: T) -> anyhow::Result<JoinHandle<nix::Result<()>>>
where
    C: FnOnce() -> nix::Result<()> + Send + 'static,
    T: FnOnce() -> nix::Result<()> + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    let handle = std::thread::Builder::new()
        .name("nbd-driver".into())
        .spawn(move || {
            let connected = connect();
            let ok = connected.is_ok();
            let _ = tx.send(connected);
            if ok { transmit() } else { Ok(()) }
        })
        .context("spawn NBD driver thread")?;

    match rx.recv() {
        Ok(Ok(())) => Ok(handle),
        Ok(Err(e)) => {
            let _ = handle.join();
            Err(e).context("connect NBD socket")
        }
        Err(_) => Err(anyhow!("NBD driver thread exited before connecting")),
    }
}

/// Connect `nbd` to a fresh socketpair and start the driver thread.
///
/// Returns the server end of the pair and the driver thread, which finishes
/// once the device is disconnected. Fails if the driver refuses the socket.
pub fn attach(
    nbd: &Arc<NbdDevice>,
    geometry: Geometry,
    config: &NbdConfig,
) -> anyhow::Result<(UnixStream, JoinHandle<nix::Result<()>>)> {
    nbd.configure(geometry, config)
        .with_context(|| format!("configure {}", nbd.path()))?;

    let (ours, kernel) = StdUnixStream::pair().context("create socketpair")?;

    let flags = config.flags();
    let kernel_fd = kernel.as_raw_fd();
    let connector = Arc::clone(nbd);
    let driver = Arc::clone(nbd);
    let handle = spawn_driver(
        move || connector.connect(kernel_fd, flags),
        // `kernel` stays open for the whole NBD_DO_IT call.
        move || {
            let result = driver.transmit();
            drop(kernel);
            result
        },
    )
    .with_context(|| format!("attach {}", nbd.path()))?;

    ours.set_nonblocking(true)
        .context("set socket non-blocking")?;
    let stream = UnixStream::from_std(ours).context("register socket with runtime")?;

    info!("NBD: attached {}", nbd.path());
    Ok((stream, handle))
}

/// Serve driver requests until DISC or end of stream.
///
/// Requests are handled strictly one at a time, so the backend never sees
/// two operations in flight.
pub async fn serve<S, B>(stream: &mut S, backend: Arc<B>, read_only: bool) -> Result<(), ServeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    B: BlockBackend + 'static,
{
    let mut served: u64 = 0;
    loop {
        // Request header: magic(4) + flags(2) + type(2) + handle(8) + offset(8) + length(4) = 28 bytes
        let magic = match stream.read_u32().await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                if served == 0 {
                    return Err(ServeError::ClosedBeforeFirstRequest);
                }
                info!("NBD: socket closed after {served} requests");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        if magic != NBD_REQUEST_MAGIC {
            return Err(ServeError::BadMagic(magic));
        }
        let _flags = stream.read_u16().await?;
        let cmd = stream.read_u16().await?;
        let handle = stream.read_u64().await?;
        let offset = stream.read_u64().await?;
        let length = stream.read_u32().await?;

        match cmd {
            NBD_CMD_READ => {
                let backend = Arc::clone(&backend);
                let data = blocking(move || {
                    let mut buf = vec![0u8; length as usize];
                    backend.read(&mut buf, offset).map(|()| buf)
                })
                .await?;

                send_reply(stream, handle, 0).await?;
                stream.write_all(&data).await?;
            }

            NBD_CMD_WRITE => {
                let mut data = vec![0u8; length as usize];
                stream.read_exact(&mut data).await?;
                if read_only {
                    send_reply(stream, handle, libc::EPERM as u32).await?;
                    continue;
                }

                let backend = Arc::clone(&backend);
                blocking(move || backend.write(&data, offset)).await?;
                send_reply(stream, handle, 0).await?;
            }

            NBD_CMD_TRIM => {
                if read_only {
                    send_reply(stream, handle, libc::EPERM as u32).await?;
                    continue;
                }
                let backend = Arc::clone(&backend);
                blocking(move || backend.trim(offset, length)).await?;
                send_reply(stream, handle, 0).await?;
            }

            NBD_CMD_FLUSH => {
                let backend = Arc::clone(&backend);
                blocking(move || backend.flush()).await?;
                send_reply(stream, handle, 0).await?;
            }

            NBD_CMD_DISC => {
                info!("NBD: driver sent disconnect");
                return Ok(());
            }

            _ => {
                warn!("NBD: unknown command {cmd}");
                send_reply(stream, handle, libc::EINVAL as u32).await?;
            }
        }
        served += 1;
        debug!("NBD: cmd={cmd} offset={offset} len={length} done");
    }
}

async fn send_reply<S: AsyncWrite + Unpin>(
    stream: &mut S,
    handle: u64,
    error: u32,
) -> std::io::Result<()> {
    stream.write_u32(NBD_REPLY_MAGIC).await?;
    stream.write_u32(error).await?;
    stream.write_u64(handle).await?;
    stream.flush().await
}

/// Run a backend call off the async workers
async fn blocking<T, F>(f: F) -> Result<T, ServeError>
where
    T: Send + 'static,
    F: FnOnce() -> trim2unmap_block::Result<T> + Send + 'static,
{
    Ok(tokio::task::spawn_blocking(f).await??)
}
