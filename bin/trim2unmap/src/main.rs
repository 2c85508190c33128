//! trim2unmap
//!
//! Exposes a physical disk as an NBD block device. Reads, writes and flushes
//! pass straight through; TRIM on the virtual device becomes SCSI UNMAP on
//! the physical one.

mod nbd;

use std::fmt::Display;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use trim2unmap_block::DeviceContext;

use crate::nbd::{NbdConfig, NbdDevice};

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(
    name = "trim2unmap",
    about = "Serve a disk through NBD, translating TRIM into SCSI UNMAP"
)]
struct Args {
    /// Physical block device (e.g. /dev/sdb)
    physical_device: PathBuf,

    /// Virtual NBD device to attach (e.g. /dev/nbd0)
    virtual_device: PathBuf,

    /// Advertise the virtual device read-only
    #[arg(long)]
    read_only: bool,

    /// NBD driver request timeout in seconds (0 = driver default)
    #[arg(long, default_value_t = 0)]
    io_timeout: u64,

    /// Log level (trace / debug / info / warn / error)
    #[arg(long, env = "TRIM2UNMAP_LOG", default_value = "info")]
    log_level: String,
}

impl Args {
    const fn nbd_config(&self) -> NbdConfig {
        NbdConfig {
            read_only: self.read_only,
            io_timeout: self.io_timeout,
        }
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    // ── Physical device ───────────────────────────────────────────────────────
    let backend = match DeviceContext::open(&args.physical_device) {
        Ok(ctx) => Arc::new(ctx),
        Err(e) => fatal(&e),
    };
    let geometry = backend.geometry();

    // ── Virtual device ────────────────────────────────────────────────────────
    let nbd = match NbdDevice::open(&args.virtual_device) {
        Ok(dev) => Arc::new(dev),
        Err(e) => fatal(&format_args!(
            "failed to open `{}': {e}",
            args.virtual_device.display()
        )),
    };
    let config = args.nbd_config();
    let (mut stream, driver) = match nbd::attach(&nbd, geometry, &config) {
        Ok(attached) => attached,
        Err(e) => fatal(&format_args!("{e:#}")),
    };

    tokio::spawn(disconnect_on_signal(Arc::clone(&nbd)));

    info!(
        "Serving {} as {}",
        args.physical_device.display(),
        nbd.path()
    );

    // ── Serving loop ──────────────────────────────────────────────────────────
    if let Err(e) = nbd::serve(&mut stream, backend, config.read_only).await {
        fatal(&e);
    }
    drop(stream);

    match tokio::task::spawn_blocking(move || driver.join()).await? {
        Ok(Ok(())) => info!("NBD: {} detached", nbd.path()),
        Ok(Err(e)) => fatal(&format_args!("NBD: driver loop on {} failed: {e}", nbd.path())),
        Err(_) => fatal(&"NBD: driver thread panicked"),
    }

    Ok(())
}

/// Report a failure on standard error and terminate abnormally
fn fatal(err: &dyn Display) -> ! {
    error!("{err}");
    eprintln!("trim2unmap: {err}");
    std::process::abort();
}

/// Disconnect the virtual device on SIGINT / SIGTERM so the serving loop
/// receives DISC and exits
async fn disconnect_on_signal(nbd: Arc<NbdDevice>) {
    let mut term = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!("cannot install SIGTERM handler: {e}");
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }

    info!("Signal received, disconnecting {}", nbd.path());
    if let Err(e) = nbd.disconnect() {
        error!("NBD_DISCONNECT on {} failed: {e}", nbd.path());
    }
}
