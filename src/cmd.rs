//! Thin wrapper around external tool invocations.
//!
//! Every privileged operation (disk, mount, chroot) goes through structured
//! argument vectors; nothing here interpolates shell strings. Callers pick
//! the variant matching how they consume the tool: [`run`] streams the tool's
//! output to the terminal, [`output`] captures stdout for parsing, [`capture`]
//! returns the raw output for callers that interpret failure themselves, and
//! [`run_ok`] is for best-effort cleanup steps.

use std::ffi::OsStr;
use std::path::Path;
use std::process::{Command, ExitStatus, Output};

/// Error from an external tool invocation
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    /// The tool could not be started at all
    #[error("cannot run `{tool}`: {e}")]
    Spawn {
        /// Name of the tool
        tool: String,
        /// The underlying I/O error
        e: std::io::Error,
    },

    /// The tool ran and reported failure
    #[error("`{tool}` failed with {status}{}", fmt_stderr(.stderr))]
    Status {
        /// Name of the tool
        tool: String,
        /// Its exit status
        status: ExitStatus,
        /// Captured stderr, empty when the output was streamed
        stderr: String,
    },

    /// The tool produced non-UTF-8 output
    #[error("`{tool}` produced non-UTF-8 output")]
    Utf8 {
        /// Name of the tool
        tool: String,
    },
}
/// A Result for ToolError
pub type Result<T> = core::result::Result<T, ToolError>;

fn fmt_stderr(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!(": {trimmed}")
    }
}

/// Run @tool with @args, streaming its output to the terminal. Returns an
/// error if the exit status is non-zero.
pub fn run<I, S>(tool: &str, args: I) -> Result<()>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let status = Command::new(tool)
        .args(args)
        .status()
        .map_err(|e| ToolError::Spawn {
            tool: String::from(tool),
            e,
        })?;
    if !status.success() {
        return Err(ToolError::Status {
            tool: String::from(tool),
            status,
            stderr: String::new(),
        });
    }
    Ok(())
}

/// Run @tool with @args and return its stdout. stderr is captured and carried
/// in the error when the exit status is non-zero.
pub fn output<I, S>(tool: &str, args: I) -> Result<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let out = capture(tool, args)?;
    if !out.status.success() {
        return Err(ToolError::Status {
            tool: String::from(tool),
            status: out.status,
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
        });
    }
    String::from_utf8(out.stdout).map_err(|_| ToolError::Utf8 {
        tool: String::from(tool),
    })
}

/// Run @tool with @args and return the raw output without checking the exit
/// status. For tools like lvdisplay whose failure the caller interprets.
pub fn capture<I, S>(tool: &str, args: I) -> Result<Output>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(tool)
        .args(args)
        .output()
        .map_err(|e| ToolError::Spawn {
            tool: String::from(tool),
            e,
        })
}

/// Best-effort variant of [`run`] for cleanup paths: failures are logged and
/// swallowed, never escalated, since the caller is already unwinding.
pub fn run_ok<I, S>(tool: &str, args: I)
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    if let Err(e) = run(tool, args) {
        log::warn!("cleanup: {e}");
    }
}

/// Run @tool with @args inside a chroot at @root. Used for service-manager
/// operations on the destination tree.
pub fn chroot<I, S>(root: &Path, tool: &str, args: I) -> Result<()>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut full: Vec<std::ffi::OsString> = vec![root.into(), tool.into()];
    full.extend(args.into_iter().map(|a| a.as_ref().to_owned()));
    run("chroot", full).map_err(|e| match e {
        // Report the tool that failed inside the chroot, not chroot itself
        ToolError::Status { status, stderr, .. } => ToolError::Status {
            tool: format!("chroot {}", tool),
            status,
            stderr,
        },
        other => other,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run() {
        assert!(run("true", [] as [&str; 0]).is_ok());

        let e = run("false", [] as [&str; 0]).unwrap_err();
        assert!(matches!(e, ToolError::Status { .. }));
        assert!(e.to_string().contains("`false` failed"));

        let e = run("/nonexistent/tool", [] as [&str; 0]).unwrap_err();
        assert!(matches!(e, ToolError::Spawn { .. }));
    }

    #[test]
    fn test_output() {
        let out = output("echo", ["hello"]).unwrap();
        assert_eq!(out, "hello\n");

        // stderr ends up in the error message
        let e = output("sh", ["-c", "echo oops >&2; exit 3"]).unwrap_err();
        let msg = e.to_string();
        assert!(msg.contains("oops"), "{msg}");
    }

    #[test]
    fn test_capture_tolerates_failure() {
        let out = capture("sh", ["-c", "echo partial; exit 5"]).unwrap();
        assert!(!out.status.success());
        assert_eq!(String::from_utf8_lossy(&out.stdout), "partial\n");
    }
}
