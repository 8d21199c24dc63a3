//! Compute the dm-verity hash tree of the destination device.
//!
//! `veritysetup format` builds the Merkle tree over the device content and
//! prints the root hash, the single trust anchor for the verified
//! filesystem. The hash is extracted from the tool's output and written to
//! its own file, from where it is later embedded into the kernel command
//! line.

use std::fs;
use std::path::Path;

use crate::cmd;

/// Error while computing the hash tree
#[derive(Debug, thiserror::Error)]
pub enum HashTreeError {
    /// veritysetup failed
    #[error(transparent)]
    Tool(#[from] cmd::ToolError),

    /// The tool output contained no parseable root hash. Failing here beats
    /// writing an empty or placeholder trust anchor.
    #[error("no root hash found in veritysetup output")]
    Parse,

    /// The root hash file could not be written
    #[error("cannot write root hash file: {0}")]
    Write(#[from] std::io::Error),
}
type Result<T> = core::result::Result<T, HashTreeError>;

/// Extract the root hash value from veritysetup output. Only the exact
/// `Root hash:` key is accepted, and the value must be a non-empty hex
/// token.
pub fn parse_root_hash(output: &str) -> Option<String> {
    for line in output.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        if key.trim() != "Root hash" {
            continue;
        }
        let value = value.trim();
        if !value.is_empty() && value.chars().all(|c| c.is_ascii_hexdigit()) {
            return Some(String::from(value));
        }
    }
    None
}

/// Run the hash tree generator over @device, storing the tree at
/// @hash_tree. Returns the root hash.
pub fn format_hash_tree(device: &Path, hash_tree: &Path) -> Result<String> {
    let output = cmd::output(
        "veritysetup",
        ["format".as_ref(), device.as_os_str(), hash_tree.as_os_str()],
    )?;
    log::debug!("veritysetup output:\n{output}");
    parse_root_hash(&output).ok_or(HashTreeError::Parse)
}

/// Write @root_hash to @path as a single hex token, no trailing whitespace.
pub fn write_root_hash(path: &Path, root_hash: &str) -> Result<()> {
    fs::write(path, root_hash)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const VERITYSETUP: &str = "\
VERITY header information for /tmp/hash_tree.bin
UUID:            	f0ddbd81-0b41-4ab3-b764-ff9a73b0b9f3
Hash type:       	1
Data blocks:     	2621440
Data block size: 	4096
Hash block size: 	4096
Hash algorithm:  	sha256
Salt:            	3ec1a58bfa1a3b1b25996bbf7722757c224ba04cd1ed51ed5d21b616b6576461
Root hash:      	2d8bb7f541d4a7cd6fbcf8b7244fd4cfa2f49b208595bed4f3d6b41a2d7c72f8
";

    #[test]
    fn test_parse_root_hash() {
        assert_eq!(
            parse_root_hash(VERITYSETUP).unwrap(),
            "2d8bb7f541d4a7cd6fbcf8b7244fd4cfa2f49b208595bed4f3d6b41a2d7c72f8"
        );

        // The parse is strict: a missing or mangled root hash line is an
        // error, not an empty hash.
        assert!(parse_root_hash("").is_none());
        assert!(parse_root_hash("Hash type: 1\n").is_none());
        assert!(parse_root_hash("Root hash:\n").is_none());
        assert!(parse_root_hash("Root hash: not-hex!\n").is_none());
        // The exact key is required
        assert!(parse_root_hash("Root hash thing: abcd\n").is_none());
    }

    #[test]
    fn test_write_root_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roothash.txt");
        write_root_hash(&path, "abc123").unwrap();
        // Verbatim, no trailing newline
        assert_eq!(fs::read_to_string(&path).unwrap(), "abc123");
    }
}
