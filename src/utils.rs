use anyhow::{bail, Result};

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;
pub const GIB: u64 = 1024 * MIB;

/// Extract the virtual size in bytes from `qemu-img info` output. The
/// human-readable prefix is truncated ("10 GiB"), so parse the exact byte
/// count in parentheses:
///
/// `virtual size: 10 GiB (10737418240 bytes)`
pub fn parse_virtual_size(info: &str) -> Result<u64> {
    for line in info.lines() {
        let Some(rest) = line.strip_prefix("virtual size:") else {
            continue;
        };
        let Some((_, paren)) = rest.split_once('(') else {
            bail!("malformed virtual size line: {line}");
        };
        let Some(bytes) = paren.trim_end().strip_suffix("bytes)") else {
            bail!("malformed virtual size line: {line}");
        };
        return Ok(bytes.trim().parse()?);
    }
    bail!("no virtual size in image info");
}

/// Format @n bytes for progress narration, using the largest fitting unit.
pub fn format_size(n: u64) -> String {
    if n >= GIB {
        format!("{:.1} GiB", n as f64 / GIB as f64)
    } else if n >= MIB {
        format!("{:.1} MiB", n as f64 / MIB as f64)
    } else {
        format!("{n} B")
    }
}
