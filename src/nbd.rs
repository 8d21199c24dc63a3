//! Expose disk image files as kernel block devices over NBD.
//!
//! The bridge binds an image to one of the fixed device nodes (/dev/nbd0 for
//! the source, /dev/nbd1 for the destination) with `qemu-nbd`, so the rest of
//! the pipeline can treat the image as a regular disk. The nbd kernel module
//! is process-wide state and the device nodes are not namespaced per
//! invocation: two builds running concurrently on the same host will collide,
//! so concurrent builds must be serialized externally.

use std::path::{Path, PathBuf};

use crate::cmd;

/// Error while binding or releasing an NBD device
#[derive(Debug, thiserror::Error)]
pub enum NbdError {
    /// The nbd kernel module could not be loaded
    #[error("cannot load nbd module: {0}")]
    Module(#[source] cmd::ToolError),

    /// The image could not be connected to its device node
    #[error("cannot connect {} to {}: {e}", .image.display(), .device.display())]
    Connect {
        /// The disk image path
        image: PathBuf,
        /// The target device node
        device: PathBuf,
        /// The underlying tool failure
        #[source]
        e: cmd::ToolError,
    },
}
type Result<T> = core::result::Result<T, NbdError>;

/// Device node used for the source image
pub const SRC_DEVICE: &str = "/dev/nbd0";
/// Device node used for the destination image
pub const DST_DEVICE: &str = "/dev/nbd1";

/// Load the nbd kernel module with partition scanning enabled. Idempotent at
/// the kernel level; shared across all connections in this process.
pub fn load_module() -> Result<()> {
    cmd::run("modprobe", ["nbd", "max_part=8"]).map_err(NbdError::Module)
}

/// Unload the nbd kernel module. Best-effort: the module may still be in use
/// by another process, which is not our error to report.
pub fn unload_module() {
    cmd::run_ok("modprobe", ["-r", "nbd"]);
}

/// An image bound to a kernel block device node. The binding owns the node
/// for its lifetime; dropping it disconnects.
#[derive(Debug)]
pub struct NbdConnection {
    device: PathBuf,
    connected: bool,
}

impl NbdConnection {
    /// Connect @image to the block device node @device.
    pub fn connect(device: &str, image: &Path) -> Result<NbdConnection> {
        let device = PathBuf::from(device);
        let mut connect_arg = std::ffi::OsString::from("--connect=");
        connect_arg.push(&device);
        cmd::run("qemu-nbd", [connect_arg.as_os_str(), image.as_os_str()]).map_err(|e| {
            NbdError::Connect {
                image: image.to_owned(),
                device: device.clone(),
                e,
            }
        })?;
        Ok(NbdConnection {
            device,
            connected: true,
        })
    }

    /// The device node this image is bound to
    pub fn device(&self) -> &Path {
        &self.device
    }

    /// Release the device node. Idempotent: releasing an already-released
    /// connection is a no-op, so cleanup paths may call this repeatedly.
    /// A failed disconnect is logged, never raised; we are either unwinding
    /// or about to unload the module anyway.
    pub fn disconnect(&mut self) {
        if !self.connected {
            return;
        }
        self.connected = false;
        log::info!("Disconnecting {}", self.device.display());
        cmd::run_ok("qemu-nbd", ["--disconnect".as_ref(), self.device.as_os_str()]);
    }
}

impl Drop for NbdConnection {
    fn drop(&mut self) {
        if self.connected {
            log::warn!("{} still connected at drop", self.device.display());
            self.disconnect();
        }
    }
}
