//! Locate the root filesystem inside a source disk image.
//!
//! Once the source image is bound to a block device, the root filesystem is
//! either on an LVM logical volume that the kernel activated when scanning
//! the device, or on a plain partition. The locator snapshots the LVM state
//! before the device is bound, diffs it afterwards, and otherwise picks the
//! first Linux filesystem partition from the partition table. Operator
//! confirmation is injected through the [`Confirm`] trait so the locator
//! works both on a terminal and in fully automated builds.

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::cmd;

/// Error while locating the root filesystem
#[derive(Debug, thiserror::Error)]
pub enum LocateError {
    /// The guest's LVM stack did not activate cleanly. Continuing with a
    /// half-activated volume group risks corrupting the source image.
    #[error("LVM activation reported warnings, cannot continue safely:\n{0}")]
    LvmActivation(String),

    /// No root filesystem candidate was found
    #[error("cannot identify a root filesystem on {}", .0.display())]
    NotFound(PathBuf),

    /// The operator-supplied device path does not exist
    #[error("no such device: {}", .0.display())]
    NoSuchDevice(PathBuf),

    /// An external tool failed
    #[error(transparent)]
    Tool(#[from] cmd::ToolError),

    /// Operator input could not be read
    #[error("cannot read operator input: {0}")]
    Input(#[from] io::Error),
}
type Result<T> = core::result::Result<T, LocateError>;

/// Operator decision about a root filesystem candidate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Use the candidate
    Accept,
    /// Use this device instead
    Override(PathBuf),
}

/// Decision policy for root filesystem selection. Implemented by the terminal
/// prompt for interactive runs and by [`AcceptFirst`] for automated ones.
pub trait Confirm {
    /// Present @candidate (with the partition @listing for context) and
    /// decide whether to use it.
    fn confirm(&self, candidate: &Path, listing: &str) -> io::Result<Decision>;

    /// No candidate was found. Return a device path to use anyway, or None
    /// to give up.
    fn fallback(&self, listing: &str) -> io::Result<Option<PathBuf>>;
}

/// Non-interactive policy: take the first candidate, never recover from a
/// missing one.
#[derive(Debug, Default)]
pub struct AcceptFirst;

impl Confirm for AcceptFirst {
    fn confirm(&self, _candidate: &Path, _listing: &str) -> io::Result<Decision> {
        Ok(Decision::Accept)
    }

    fn fallback(&self, _listing: &str) -> io::Result<Option<PathBuf>> {
        Ok(None)
    }
}

/// Terminal prompt policy
#[derive(Debug, Default)]
pub struct TerminalConfirm;

fn prompt(msg: &str) -> io::Result<String> {
    print!("{msg}");
    io::stdout().flush()?;
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(String::from(input.trim()))
}

impl Confirm for TerminalConfirm {
    fn confirm(&self, candidate: &Path, listing: &str) -> io::Result<Decision> {
        println!("{listing}");
        println!("Found the following filesystem: {}", candidate.display());
        let choice = prompt("Do you confirm that this is correct? (y/n): ")?;
        if choice.eq_ignore_ascii_case("y") {
            return Ok(Decision::Accept);
        }
        let dev = prompt("Enter device containing the root filesystem: ")?;
        Ok(Decision::Override(PathBuf::from(dev)))
    }

    fn fallback(&self, listing: &str) -> io::Result<Option<PathBuf>> {
        println!("{listing}");
        println!("Failed to identify the root filesystem.");
        let dev = prompt("Enter device containing the root filesystem: ")?;
        Ok(Some(PathBuf::from(dev)))
    }
}

/// Number of `LV Path` entries in lvdisplay output
pub fn count_lv_paths(lvdisplay: &str) -> usize {
    lvdisplay
        .lines()
        .filter(|l| l.trim_start().starts_with("LV Path"))
        .count()
}

/// Path of the most recently listed logical volume
pub fn last_lv_path(lvdisplay: &str) -> Option<String> {
    lvdisplay
        .lines()
        .filter(|l| l.trim_start().starts_with("LV Path"))
        .last()
        .and_then(|l| l.split_whitespace().last())
        .map(String::from)
}

/// Name of the most recently listed volume group
pub fn vg_name(lvdisplay: &str) -> Option<String> {
    lvdisplay
        .lines()
        .filter(|l| l.trim_start().starts_with("VG Name"))
        .last()
        .and_then(|l| l.split_whitespace().last())
        .map(String::from)
}

/// First partition tagged as a generic Linux filesystem in `fdisk -l` output
pub fn first_linux_partition(fdisk: &str) -> Option<String> {
    fdisk
        .lines()
        .find(|l| l.contains("Linux filesystem"))
        .and_then(|l| l.split_whitespace().next())
        .map(String::from)
}

/// LVM state snapshot, taken before the source image is bound so that
/// volumes activated by the binding can be detected and later deactivated.
#[derive(Debug)]
pub struct LvmState {
    baseline: usize,
}

fn lvdisplay() -> (String, String) {
    // lvdisplay fails when no volume group exists at all; treat that the
    // same as an empty listing.
    match cmd::capture("lvdisplay", [] as [&str; 0]) {
        Ok(out) => (
            String::from_utf8_lossy(&out.stdout).into_owned(),
            String::from_utf8_lossy(&out.stderr).into_owned(),
        ),
        Err(e) => {
            log::debug!("lvdisplay unavailable: {e}");
            (String::new(), String::new())
        }
    }
}

impl LvmState {
    /// Record the number of active logical volumes on the host.
    pub fn snapshot() -> LvmState {
        let (stdout, _) = lvdisplay();
        let baseline = count_lv_paths(&stdout);
        if baseline > 0 {
            log::warn!(
                "{baseline} LVM volume(s) already active on this host; \
                 detection may misfire if the guest image also uses LVM"
            );
        }
        LvmState { baseline }
    }

    /// Check whether binding the source image activated a new logical
    /// volume. Returns its path, or None when the count is unchanged.
    pub fn newly_activated(&self) -> Result<Option<String>> {
        let (stdout, stderr) = lvdisplay();
        if stderr.contains("WARNING") {
            return Err(LocateError::LvmActivation(stderr));
        }
        if count_lv_paths(&stdout) > self.baseline {
            return Ok(last_lv_path(&stdout));
        }
        Ok(None)
    }

    /// Deactivate any volume that appeared after the snapshot. Best-effort,
    /// used on cleanup.
    pub fn deactivate(&self) {
        let (stdout, _) = lvdisplay();
        if count_lv_paths(&stdout) <= self.baseline {
            return;
        }
        log::info!("Deactivating guest LVM volume");
        if let Some(lv) = last_lv_path(&stdout) {
            cmd::run_ok("lvchange", ["-an", &lv]);
        }
        if let Some(vg) = vg_name(&stdout) {
            cmd::run_ok("vgchange", ["-an", &vg]);
        }
    }
}

/// Locate the device holding the source root filesystem. Resolved once per
/// build; the caller caches the result for the whole pipeline.
pub fn locate(
    source_device: &Path,
    lvm: &LvmState,
    confirm: &dyn Confirm,
) -> Result<PathBuf> {
    if let Some(lv) = lvm.newly_activated()? {
        log::info!("Found LVM2 filesystem: {lv}");
        return Ok(PathBuf::from(lv));
    }

    let listing = cmd::output("fdisk", ["-l".as_ref(), source_device.as_os_str()])?;
    let candidate = first_linux_partition(&listing).map(PathBuf::from);

    resolve_candidate(source_device, candidate, &listing, confirm)
}

// Confirmation step, separated from the tool invocations so the decision
// logic is testable without a terminal or root privileges.
fn resolve_candidate(
    source_device: &Path,
    candidate: Option<PathBuf>,
    listing: &str,
    confirm: &dyn Confirm,
) -> Result<PathBuf> {
    let chosen = match candidate {
        Some(part) => match confirm.confirm(&part, listing)? {
            Decision::Accept => part,
            Decision::Override(dev) => dev,
        },
        None => match confirm.fallback(listing)? {
            Some(dev) => dev,
            None => return Err(LocateError::NotFound(source_device.to_owned())),
        },
    };
    if !chosen.exists() {
        return Err(LocateError::NoSuchDevice(chosen));
    }
    Ok(chosen)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LVDISPLAY: &str = "\
  --- Logical volume ---
  LV Path                /dev/vg0/host-root
  LV Name                host-root
  VG Name                vg0
  LV Status              available
  --- Logical volume ---
  LV Path                /dev/ubuntu-vg/ubuntu-lv
  LV Name                ubuntu-lv
  VG Name                ubuntu-vg
  LV Status              available
";

    const FDISK: &str = "\
Disk /dev/nbd0: 10 GiB, 10737418240 bytes, 20971520 sectors
Units: sectors of 1 * 512 = 512 bytes
Disklabel type: gpt

Device        Start      End  Sectors  Size Type
/dev/nbd0p1  227328 20971486 20744159  9.9G Linux filesystem
/dev/nbd0p14   2048    10239     8192    4M BIOS boot
/dev/nbd0p15  10240   227327   217088  106M EFI System
";

    #[test]
    fn test_lvdisplay_parsing() {
        assert_eq!(count_lv_paths(LVDISPLAY), 2);
        assert_eq!(
            last_lv_path(LVDISPLAY).unwrap(),
            "/dev/ubuntu-vg/ubuntu-lv"
        );
        assert_eq!(vg_name(LVDISPLAY).unwrap(), "ubuntu-vg");

        assert_eq!(count_lv_paths(""), 0);
        assert!(last_lv_path("").is_none());
        assert!(vg_name("").is_none());
    }

    #[test]
    fn test_fdisk_parsing() {
        assert_eq!(first_linux_partition(FDISK).unwrap(), "/dev/nbd0p1");
        assert!(first_linux_partition("Disklabel type: dos\n").is_none());
    }

    struct Reject(PathBuf);

    impl Confirm for Reject {
        fn confirm(&self, _candidate: &Path, _listing: &str) -> io::Result<Decision> {
            Ok(Decision::Override(self.0.clone()))
        }

        fn fallback(&self, _listing: &str) -> io::Result<Option<PathBuf>> {
            Ok(Some(self.0.clone()))
        }
    }

    #[test]
    fn test_resolve_candidate() {
        let src = Path::new("/dev/nbd0");
        let exists = PathBuf::from("/dev/null");

        // Accepted candidates must exist
        let got =
            resolve_candidate(src, Some(exists.clone()), FDISK, &AcceptFirst).unwrap();
        assert_eq!(got, exists);

        // No candidate, no fallback
        let e = resolve_candidate(src, None, FDISK, &AcceptFirst).unwrap_err();
        assert!(matches!(e, LocateError::NotFound(_)));

        // Operator override is validated for existence
        let got = resolve_candidate(
            src,
            Some(PathBuf::from("/dev/nbd0p1")),
            FDISK,
            &Reject(exists.clone()),
        )
        .unwrap();
        assert_eq!(got, exists);

        let e = resolve_candidate(
            src,
            None,
            FDISK,
            &Reject(PathBuf::from("/dev/does-not-exist")),
        )
        .unwrap_err();
        assert!(matches!(e, LocateError::NoSuchDevice(_)));
    }
}
