//! The dm-verity image build pipeline.
//!
//! Strictly sequential: allocate the output image, bind both images to NBD
//! devices, locate the source root filesystem, format and mount the
//! destination, copy the full tree, inject the guest content, harden, then
//! unmount and compute the hash tree. The first failure aborts the
//! remaining steps; [`BuildSession`] releases every acquired resource in
//! reverse order on every exit path.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::cmd;
use crate::harden;
use crate::mount::MountGuard;
use crate::nbd::{self, NbdConnection};
use crate::rootfs::{self, Confirm, LvmState};
use crate::utils;
use crate::verity;

/// Inputs of the verity image build
#[derive(Debug)]
pub struct SetupArgs<'a> {
    /// Source VM image (raw or qcow2)
    pub image: &'a Path,
    /// Directory holding the guest payload bundles
    pub content_dir: &'a Path,
    /// Output verity disk image
    pub out_image: &'a Path,
    /// Output hash tree
    pub out_hash_tree: &'a Path,
    /// Output root hash file
    pub out_root_hash: &'a Path,
    /// Keep interactive access in the image for troubleshooting
    pub debug: bool,
    /// Skip root filesystem detection and use this device
    pub root_device: Option<&'a Path>,
}

// Full-fidelity copy: preserve permissions, ownership (numeric, the two
// systems need not share a user database), xattrs, ACLs, hardlinks and
// sparseness.
const RSYNC_FLAGS: &[&str] = &["-axHAWXS", "--numeric-ids", "--info=progress2"];

/// Every resource acquired by the pipeline, released in reverse order:
/// mounts before LVM deactivation before NBD disconnect before module
/// unload. Release is idempotent and never raises; failures while unwinding
/// are logged so they cannot mask the original pipeline error.
#[derive(Debug, Default)]
struct BuildSession {
    lvm: Option<LvmState>,
    module_loaded: bool,
    src_nbd: Option<NbdConnection>,
    dst_nbd: Option<NbdConnection>,
    src_mount: Option<MountGuard>,
    dst_mount: Option<MountGuard>,
}

impl BuildSession {
    // Planned unmount on the success path. Unlike release(), a failure here
    // is fatal: hashing a device with a live mount fingerprints a filesystem
    // that is still changing.
    fn unmount(&mut self) -> core::result::Result<(), crate::mount::MountError> {
        if let Some(mut mount) = self.src_mount.take() {
            mount.unmount()?;
        }
        if let Some(mut mount) = self.dst_mount.take() {
            mount.unmount()?;
        }
        Ok(())
    }

    fn release(&mut self) {
        for mount in [self.src_mount.take(), self.dst_mount.take()] {
            if let Some(mut mount) = mount {
                if let Err(e) = mount.unmount() {
                    log::warn!("cleanup: {e}");
                }
            }
        }
        if let Some(lvm) = self.lvm.take() {
            lvm.deactivate();
        }
        let mut disconnected = false;
        for conn in [self.src_nbd.take(), self.dst_nbd.take()] {
            if let Some(mut conn) = conn {
                conn.disconnect();
                disconnected = true;
            }
        }
        if std::mem::take(&mut self.module_loaded) {
            if disconnected {
                // qemu-nbd returns before the kernel has fully torn down
                // the device; give it a moment before unloading the module.
                std::thread::sleep(Duration::from_secs(2));
            }
            nbd::unload_module();
        }
    }
}

impl Drop for BuildSession {
    fn drop(&mut self) {
        self.release();
    }
}

fn with_slash(path: &Path) -> OsString {
    let mut s = path.as_os_str().to_owned();
    s.push("/");
    s
}

// Allocate the destination image at the source's virtual size.
fn create_output_image(src: &Path, dst: &Path) -> Result<()> {
    let info = cmd::output("qemu-img", ["info".as_ref(), src.as_os_str()])?;
    let size = utils::parse_virtual_size(&info)
        .with_context(|| format!("sizing {}", src.display()))?;
    log::info!("Source virtual size: {}", utils::format_size(size));
    cmd::run(
        "qemu-img",
        [
            "create".as_ref(),
            "-f".as_ref(),
            "qcow2".as_ref(),
            dst.as_os_str(),
            size.to_string().as_ref(),
        ],
    )?;
    Ok(())
}

// Copy the whole source tree into the destination. Trailing slashes make
// rsync copy directory contents rather than the directories themselves.
fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    let mut args: Vec<OsString> = RSYNC_FLAGS.iter().map(OsString::from).collect();
    args.push(with_slash(src));
    args.push(with_slash(dst));
    cmd::run("rsync", args)?;
    Ok(())
}

fn rsync_into(src: &Path, dst: &Path) -> Result<()> {
    let mut args: Vec<OsString> = RSYNC_FLAGS.iter().map(OsString::from).collect();
    args.push(src.into());
    args.push(dst.into());
    cmd::run("rsync", args)?;
    Ok(())
}

// Payload bundles in the content directory come in pairs: a `<name>.service`
// unit file next to a `<name>` payload. The payload lands in /root, the unit
// in /etc/systemd/system, and the service is enabled inside the destination
// tree.
fn inject_content(content_dir: &Path, dst_root: &Path) -> Result<()> {
    let mut units = Vec::new();
    for entry in fs::read_dir(content_dir)
        .with_context(|| format!("reading {}", content_dir.display()))?
    {
        let name = entry?.file_name();
        if let Some(stem) = name.to_string_lossy().strip_suffix(".service") {
            units.push(String::from(stem));
        }
    }
    // Deterministic injection order
    units.sort();

    if units.is_empty() {
        bail!("no service units found in {}", content_dir.display());
    }

    for unit in &units {
        let payload = content_dir.join(unit);
        if !payload.is_dir() {
            bail!("{unit}.service has no payload directory {}", payload.display());
        }

        log::info!("Copying {unit}");
        rsync_into(&payload, &dst_root.join("root"))?;

        log::info!("Copying {unit} service unit");
        rsync_into(
            &content_dir.join(format!("{unit}.service")),
            &dst_root.join("etc/systemd/system").join(format!("{unit}.service")),
        )?;

        log::info!("Enabling {unit} service");
        cmd::chroot(dst_root, "systemctl", ["enable", &format!("{unit}.service")])
            .with_context(|| format!("enabling {unit}.service"))?;
    }
    Ok(())
}

/// Build the verity-protected guest image and return the root hash. The
/// root hash is computed strictly after the destination tree is final and
/// written to `args.out_root_hash` before this returns.
pub fn setup_guest_image(args: &SetupArgs, confirm: &dyn Confirm) -> Result<String> {
    let mut session = BuildSession::default();
    let result = run_pipeline(&mut session, args, confirm);
    // One release on every exit path; Drop only backstops a panic.
    session.release();
    result
}

fn run_pipeline(
    session: &mut BuildSession,
    args: &SetupArgs,
    confirm: &dyn Confirm,
) -> Result<String> {
    log::info!("Creating output image");
    create_output_image(args.image, args.out_image).context("allocating output image")?;

    // The LVM baseline must predate the source binding, or a volume group
    // activated by the kernel scan would go undetected.
    session.lvm = Some(LvmState::snapshot());

    log::info!("Initializing NBD devices");
    nbd::load_module()?;
    session.module_loaded = true;
    session.src_nbd = Some(NbdConnection::connect(nbd::SRC_DEVICE, args.image)?);
    session.dst_nbd = Some(NbdConnection::connect(nbd::DST_DEVICE, args.out_image)?);
    let src_device = PathBuf::from(nbd::SRC_DEVICE);
    let dst_device = PathBuf::from(nbd::DST_DEVICE);

    log::info!("Finding root filesystem");
    let root_device = match args.root_device {
        Some(dev) => dev.to_owned(),
        None => {
            let lvm = session.lvm.as_ref().expect("snapshot taken above");
            rootfs::locate(&src_device, lvm, confirm).context("locating root filesystem")?
        }
    };
    log::info!("Root filesystem device: {}", root_device.display());

    log::info!("Creating ext4 filesystem on the output device");
    cmd::run("mkfs.ext4", [&dst_device])?;

    log::info!("Mounting images");
    let src_mount = MountGuard::mount(&root_device)?;
    let dst_mount = MountGuard::mount(&dst_device)?;
    let src_root = src_mount.path().to_owned();
    let dst_root = dst_mount.path().to_owned();
    session.src_mount = Some(src_mount);
    session.dst_mount = Some(dst_mount);

    log::info!("Copying filesystem (this may take some time)");
    copy_tree(&src_root, &dst_root).context("copying filesystem")?;

    log::info!("Injecting guest content");
    inject_content(args.content_dir, &dst_root).context("injecting guest content")?;

    log::info!("Preparing output filesystem for dm-verity");
    harden::harden(&dst_root, args.debug).context("hardening filesystem")?;

    log::info!("Unmounting images");
    session.unmount().context("unmounting images")?;

    log::info!("Computing hash tree");
    let root_hash = verity::format_hash_tree(&dst_device, args.out_hash_tree)
        .context("computing hash tree")?;
    verity::write_root_hash(args.out_root_hash, &root_hash)
        .with_context(|| format!("writing {}", args.out_root_hash.display()))?;
    log::info!("Root hash: {root_hash}");

    Ok(root_hash)
}
