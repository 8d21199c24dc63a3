//! Temporary mount points for the source and destination filesystems.

use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::cmd;

/// Error while mounting or unmounting
#[derive(Debug, thiserror::Error)]
pub enum MountError {
    /// No temporary mount point could be created
    #[error("cannot create mount point: {0}")]
    MountPoint(#[from] std::io::Error),

    /// mount or umount failed
    #[error(transparent)]
    Tool(#[from] cmd::ToolError),
}
type Result<T> = core::result::Result<T, MountError>;

/// A block device mounted on a temporary directory. The guard must be
/// unmounted before the underlying device binding is released; dropping it
/// unmounts best-effort and then removes the directory.
#[derive(Debug)]
pub struct MountGuard {
    dir: TempDir,
    device: PathBuf,
    mounted: bool,
}

impl MountGuard {
    /// Mount @device on a fresh temporary directory.
    pub fn mount(device: &Path) -> Result<MountGuard> {
        let dir = TempDir::new()?;
        cmd::run("mount", [device.as_os_str(), dir.path().as_os_str()])?;
        Ok(MountGuard {
            dir,
            device: device.to_owned(),
            mounted: true,
        })
    }

    /// The mount point
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Unmount. Idempotent; a second call is a silent no-op. Unlike the
    /// drop path, an unmount failure here is returned to the caller:
    /// leaving the filesystem mounted while the device is manipulated
    /// corrupts it silently.
    pub fn unmount(&mut self) -> Result<()> {
        if !self.mounted {
            return Ok(());
        }
        cmd::run("umount", ["-q".as_ref(), self.dir.path().as_os_str()])?;
        self.mounted = false;
        Ok(())
    }
}

impl Drop for MountGuard {
    fn drop(&mut self) {
        if self.mounted {
            log::warn!(
                "{} still mounted on {} at drop",
                self.device.display(),
                self.dir.path().display()
            );
            cmd::run_ok("umount", ["-q".as_ref(), self.dir.path().as_os_str()]);
        }
    }
}
