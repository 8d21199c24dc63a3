//! Prepare a copied root filesystem for use as an immutable verity root.
//!
//! The destination tree keeps running services but must not keep any
//! interactive entry point: sshd, the virtual consoles and the serial
//! console are disabled and masked, login shells are neutralized and the
//! bootloader's console parameters are stripped. Mutable directories are
//! relocated to `*_ro` so a runtime overlay can mount fresh writable copies
//! over the verified tree at boot.
//!
//! The passwd and GRUB edits are pure text transforms, kept separate from
//! the privileged plumbing so they can be tested without root.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

use crate::cmd;

/// Account that keeps its interactive shell
const SUPERUSER: &str = "root";

/// Replacement for interactive login shells
const NOLOGIN: &str = "/usr/sbin/nologin";

/// TTY device nodes renamed so nothing can reopen them by name
const TTY_DEVICES: &[&str] = &[
    "tty", "tty0", "tty1", "tty2", "tty3", "tty4", "tty5", "tty6", "ttyS0",
];

fn is_interactive_shell(shell: &str) -> bool {
    let base = shell.rsplit('/').next().unwrap_or(shell);
    matches!(base, "bash" | "sh" | "dash" | "zsh" | "ksh" | "fish")
}

/// Rewrite every interactive login shell in @passwd to the nologin shell,
/// except for @keep_user. Lines that are not seven-field passwd entries are
/// passed through untouched.
pub fn rewrite_login_shells(passwd: &str, keep_user: &str) -> String {
    let mut out = String::with_capacity(passwd.len());
    for line in passwd.lines() {
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() == 7 && fields[0] != keep_user && is_interactive_shell(fields[6]) {
            let mut fields = fields;
            fields[6] = NOLOGIN;
            out.push_str(&fields.join(":"));
        } else {
            out.push_str(line);
        }
        out.push('\n');
    }
    out
}

fn strip_console_tokens(value: &str) -> String {
    value
        .split_whitespace()
        .filter(|tok| !tok.starts_with("console="))
        .collect::<Vec<_>>()
        .join(" ")
}

fn rewrite_cmdline(value: &str, append_console_none: bool) -> String {
    let mut stripped = strip_console_tokens(value);
    if append_console_none {
        if !stripped.is_empty() {
            stripped.push(' ');
        }
        stripped.push_str("console=none");
    }
    stripped
}

/// Strip kernel console parameters from the GRUB default configuration and
/// mark the console as disabled on the default command line.
pub fn disable_grub_console(grub: &str) -> String {
    let mut out = String::with_capacity(grub.len());
    for line in grub.lines() {
        let rewritten = ["GRUB_CMDLINE_LINUX_DEFAULT=", "GRUB_CMDLINE_LINUX="]
            .iter()
            .find_map(|key| {
                let value = line.strip_prefix(key)?;
                let value = value.trim_matches('"');
                let value =
                    rewrite_cmdline(value, *key == "GRUB_CMDLINE_LINUX_DEFAULT=");
                Some(format!("{key}\"{value}\""))
            });
        out.push_str(&rewritten.unwrap_or_else(|| String::from(line)));
        out.push('\n');
    }
    out
}

fn disable_unit(root: &Path, unit: &str) -> Result<()> {
    // A partially hardened image must never ship: both operations are fatal.
    cmd::chroot(root, "systemctl", ["disable", unit])
        .with_context(|| format!("disabling {unit}"))?;
    cmd::chroot(root, "systemctl", ["mask", unit])
        .with_context(|| format!("masking {unit}"))?;
    Ok(())
}

fn remove_ssh_host_keys(root: &Path) -> Result<()> {
    let ssh_dir = root.join("etc/ssh");
    if !ssh_dir.is_dir() {
        return Ok(());
    }
    for entry in fs::read_dir(&ssh_dir)
        .with_context(|| format!("reading {}", ssh_dir.display()))?
    {
        let entry = entry?;
        if entry
            .file_name()
            .to_string_lossy()
            .starts_with("ssh_host_")
        {
            fs::remove_file(entry.path())
                .with_context(|| format!("removing {}", entry.path().display()))?;
        }
    }
    Ok(())
}

fn disable_login_surfaces(root: &Path) -> Result<()> {
    log::info!("Disabling SSH service");
    disable_unit(root, "ssh.service")?;

    log::info!("Disabling login for all users except {SUPERUSER}");
    let passwd_path = root.join("etc/passwd");
    let passwd = fs::read_to_string(&passwd_path)
        .with_context(|| format!("reading {}", passwd_path.display()))?;
    fs::write(&passwd_path, rewrite_login_shells(&passwd, SUPERUSER))
        .with_context(|| format!("writing {}", passwd_path.display()))?;

    log::info!("Disabling all TTY services");
    for i in 1..=6 {
        disable_unit(root, &format!("getty@tty{i}.service"))?;
    }

    log::info!("Disabling serial console (ttyS0)");
    disable_unit(root, "serial-getty@ttyS0.service")?;

    let grub_path = root.join("etc/default/grub");
    if grub_path.exists() {
        log::info!("Removing TTY kernel console configuration from GRUB");
        let grub = fs::read_to_string(&grub_path)
            .with_context(|| format!("reading {}", grub_path.display()))?;
        fs::write(&grub_path, disable_grub_console(&grub))
            .with_context(|| format!("writing {}", grub_path.display()))?;
    }

    log::info!("Disabling TTY devices");
    for dev in TTY_DEVICES {
        let path = root.join("dev").join(dev);
        if path.exists() {
            let disabled = root.join("dev").join(format!("{dev}_disabled"));
            if let Err(e) = fs::rename(&path, &disabled) {
                log::debug!("cannot rename {}: {e}", path.display());
            }
        }
    }

    log::info!("Disabling kernel messages to the console");
    // Best-effort: some environments already have console logging off.
    if let Err(e) = cmd::chroot(root, "dmesg", ["--console-off"]) {
        log::debug!("dmesg --console-off: {e}");
    }

    Ok(())
}

fn relocate_mutable_dirs(root: &Path) -> Result<()> {
    // The verified tree stays untouched at runtime; a tmpfs/overlay provides
    // the writable copies of these directories at boot.
    let tmp = root.join("tmp");
    if tmp.exists() {
        fs::remove_dir_all(&tmp)
            .with_context(|| format!("clearing {}", tmp.display()))?;
    }

    for dir in ["root", "etc", "var"] {
        let src = root.join(dir);
        if !src.exists() {
            continue;
        }
        let dst = root.join(format!("{dir}_ro"));
        if dst.exists() {
            fs::remove_dir_all(&dst)
                .with_context(|| format!("removing stale {}", dst.display()))?;
        }
        fs::rename(&src, &dst)
            .with_context(|| format!("relocating {dir} to {dir}_ro"))?;
    }

    for dir in ["home", "etc", "var", "tmp"] {
        let path = root.join(dir);
        // home is not relocated above, so clear it explicitly: all four
        // directories start empty and are populated by the runtime overlay.
        if path.exists() {
            fs::remove_dir_all(&path)
                .with_context(|| format!("clearing {dir}"))?;
        }
        fs::create_dir_all(&path).with_context(|| format!("creating fresh {dir}"))?;
    }

    // root's content must remain usable at boot; the canonical reference
    // copy stays under root_ro.
    let root_ro = root.join("root_ro");
    if root_ro.exists() {
        cmd::run(
            "cp",
            [
                "-a".as_ref(),
                root_ro.as_os_str(),
                root.join("root").as_os_str(),
            ],
        )
        .context("restoring root from root_ro")?;
    }

    Ok(())
}

/// Harden the destination tree mounted at @root. With @debug set, all
/// login-surface mutations are skipped so the image stays reachable for
/// troubleshooting; the directory relocation happens in both modes.
pub fn harden(root: &Path, debug: bool) -> Result<()> {
    if debug {
        log::info!("Debug mode enabled, keeping interactive access");
    } else {
        remove_ssh_host_keys(root).context("removing SSH host keys")?;
        disable_login_surfaces(root)?;
        log::info!("No TTY or console interface left accessible");
    }

    relocate_mutable_dirs(root)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rewrite_login_shells() {
        let passwd = "\
root:x:0:0:root:/root:/bin/bash
daemon:x:1:1:daemon:/usr/sbin:/usr/sbin/nologin
sync:x:4:65534:sync:/bin:/bin/sync
ubuntu:x:1000:1000:Ubuntu:/home/ubuntu:/bin/bash
svc:x:999:999::/var/lib/svc:/bin/sh
";
        let out = rewrite_login_shells(passwd, "root");
        let lines: Vec<&str> = out.lines().collect();
        // The superuser keeps its shell
        assert_eq!(lines[0], "root:x:0:0:root:/root:/bin/bash");
        // Non-interactive shells are untouched
        assert_eq!(lines[1], "daemon:x:1:1:daemon:/usr/sbin:/usr/sbin/nologin");
        assert_eq!(lines[2], "sync:x:4:65534:sync:/bin:/bin/sync");
        // Interactive shells are rewritten
        assert_eq!(lines[3], "ubuntu:x:1000:1000:Ubuntu:/home/ubuntu:/usr/sbin/nologin");
        assert_eq!(lines[4], "svc:x:999:999::/var/lib/svc:/usr/sbin/nologin");
    }

    #[test]
    fn test_rewrite_login_shells_malformed() {
        // Comment-ish or truncated lines pass through verbatim
        let passwd = "# a comment\nbroken:line\n";
        assert_eq!(rewrite_login_shells(passwd, "root"), passwd);
    }

    #[test]
    fn test_disable_grub_console() {
        let grub = "\
GRUB_DEFAULT=0
GRUB_CMDLINE_LINUX_DEFAULT=\"console=ttyS0 earlyprintk=serial quiet\"
GRUB_CMDLINE_LINUX=\"console=tty1\"
GRUB_TERMINAL=console
";
        let out = disable_grub_console(grub);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], "GRUB_DEFAULT=0");
        assert_eq!(
            lines[1],
            "GRUB_CMDLINE_LINUX_DEFAULT=\"earlyprintk=serial quiet console=none\""
        );
        assert_eq!(lines[2], "GRUB_CMDLINE_LINUX=\"\"");
        // Unrelated keys (even ones mentioning console) stay untouched
        assert_eq!(lines[3], "GRUB_TERMINAL=console");
    }

    #[test]
    fn test_disable_grub_console_empty_default() {
        let out = disable_grub_console("GRUB_CMDLINE_LINUX_DEFAULT=\"\"\n");
        assert_eq!(out, "GRUB_CMDLINE_LINUX_DEFAULT=\"console=none\"\n");
    }

    #[test]
    fn test_relocation() {
        let tree = tempfile::tempdir().unwrap();
        let root = tree.path();
        for dir in ["root", "etc", "var", "tmp", "home", "dev"] {
            fs::create_dir(root.join(dir)).unwrap();
        }
        fs::write(root.join("root/.profile"), "export X=1\n").unwrap();
        fs::write(root.join("etc/hostname"), "guest\n").unwrap();
        fs::write(root.join("tmp/stale"), "").unwrap();
        fs::write(root.join("home/leftover"), "").unwrap();

        // Debug mode must still relocate, without touching services
        harden(root, true).unwrap();

        for dir in ["root_ro", "etc_ro", "var_ro"] {
            assert!(root.join(dir).is_dir(), "{dir} missing");
        }
        for dir in ["home", "etc", "var", "tmp"] {
            assert!(root.join(dir).is_dir(), "{dir} missing");
            assert_eq!(
                fs::read_dir(root.join(dir)).unwrap().count(),
                0,
                "{dir} not empty"
            );
        }
        // root is restored from root_ro
        assert_eq!(
            fs::read_to_string(root.join("root/.profile")).unwrap(),
            "export X=1\n"
        );
        assert_eq!(
            fs::read_to_string(root.join("root_ro/.profile")).unwrap(),
            "export X=1\n"
        );
    }
}
