//! Assemble the inputs of the expected launch measurement.
//!
//! The VM definition binds the boot components together: kernel, initrd,
//! OVMF firmware and the kernel command line carrying the verity root hash
//! produced by the image build. The definition is written as TOML and
//! handed to the external digest calculator, whose JSON output is the
//! measurement artifact consumed by the attestation workflow.

use std::fs;
use std::path::{Path, PathBuf};

use vm_definition::{VmDefinition, VmDefinitionOverlay};

use crate::cmd;

/// Error while assembling measurement inputs
#[derive(Debug, thiserror::Error)]
pub enum MeasureError {
    /// A kernel path pattern resolved to nothing
    #[error("kernel path pattern `{0}` did not match any file")]
    AmbiguousKernelPath(String),

    /// Wildcards outside the file name are not supported
    #[error("wildcards are only supported in the kernel file name: `{0}`")]
    UnsupportedPattern(String),

    /// The root hash file exists but holds no hash
    #[error("root hash file {} is empty", .0.display())]
    EmptyRootHash(PathBuf),

    /// File access error
    #[error("file {filename} error: {e}")]
    File {
        /// The underlying I/O error
        #[source]
        e: std::io::Error,
        /// The file being accessed
        filename: String,
    },

    /// A configuration overlay or definition could not be parsed
    #[error("cannot parse {0}")]
    Config(String),

    /// The digest calculator failed
    #[error(transparent)]
    Tool(#[from] cmd::ToolError),

    /// The digest calculator did not produce a JSON object
    #[error("digest calculator output is not a JSON object: {0}")]
    Output(String),
}
type Result<T> = core::result::Result<T, MeasureError>;

fn file_err(path: &Path) -> impl FnOnce(std::io::Error) -> MeasureError + '_ {
    move |e| MeasureError::File {
        e,
        filename: path.display().to_string(),
    }
}

// Glob-style match with `*` wildcards, anchored at both ends.
fn matches_pattern(name: &str, pattern: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return name == pattern;
    }
    let Some(mut rest) = name.strip_prefix(parts[0]) else {
        return false;
    };
    for part in &parts[1..parts.len() - 1] {
        if part.is_empty() {
            continue;
        }
        match rest.find(part) {
            Some(i) => rest = &rest[i + part.len()..],
            None => return false,
        }
    }
    rest.ends_with(parts[parts.len() - 1])
}

/// Resolve a kernel path that may contain `*` wildcards in its file name
/// (e.g. `build/kernel/boot/vmlinuz-*`) to a single concrete file. Multiple
/// matches pick the first in sorted order — deliberately not "newest
/// version": the tie-break carries no version semantics, so it is logged.
pub fn resolve_kernel_path(pattern: &str) -> Result<PathBuf> {
    if !pattern.contains('*') {
        return Ok(PathBuf::from(pattern));
    }

    let (dir, file_pattern) = match pattern.rfind('/') {
        Some(i) => (&pattern[..i], &pattern[i + 1..]),
        None => (".", pattern),
    };
    let dir = if dir.is_empty() { "/" } else { dir };
    if dir.contains('*') {
        return Err(MeasureError::UnsupportedPattern(String::from(pattern)));
    }

    let mut matches: Vec<PathBuf> = Vec::new();
    for entry in fs::read_dir(dir).map_err(file_err(Path::new(dir)))? {
        let entry = entry.map_err(file_err(Path::new(dir)))?;
        if matches_pattern(&entry.file_name().to_string_lossy(), file_pattern) {
            matches.push(entry.path());
        }
    }
    matches.sort();

    match matches.len() {
        0 => Err(MeasureError::AmbiguousKernelPath(String::from(pattern))),
        1 => Ok(matches.remove(0)),
        n => {
            log::info!(
                "kernel pattern `{pattern}` matched {n} files, using {}",
                matches[0].display()
            );
            Ok(matches.remove(0))
        }
    }
}

/// Substitute @root_hash at the `verity_roothash=` parameter of the command
/// line template, appending the parameter when the template has none.
pub fn embed_root_hash(template: &str, root_hash: &str) -> String {
    const KEY: &str = "verity_roothash=";
    if let Some(start) = template.find(KEY) {
        let value_start = start + KEY.len();
        let value_end = template[value_start..]
            .find(char::is_whitespace)
            .map_or(template.len(), |i| value_start + i);
        format!(
            "{}{root_hash}{}",
            &template[..value_start],
            &template[value_end..]
        )
    } else if template.is_empty() {
        format!("{KEY}{root_hash}")
    } else {
        format!("{template} {KEY}{root_hash}")
    }
}

/// Read the root hash produced by the image build
pub fn read_root_hash(path: &Path) -> Result<String> {
    let hash = fs::read_to_string(path).map_err(file_err(path))?;
    let hash = String::from(hash.trim());
    if hash.is_empty() {
        return Err(MeasureError::EmptyRootHash(path.to_owned()));
    }
    Ok(hash)
}

fn load_overlay(path: &Path) -> Result<VmDefinitionOverlay> {
    let content = fs::read_to_string(path).map_err(file_err(path))?;
    toml::from_str(&content)
        .map_err(|e| MeasureError::Config(format!("{}: {e}", path.display())))
}

/// Boot components assembled into a VM definition
#[derive(Debug)]
pub struct BootComponents<'a> {
    /// Kernel path, may contain `*` wildcards in the file name
    pub kernel: &'a str,
    /// Initrd path
    pub initrd: &'a Path,
    /// OVMF firmware path
    pub ovmf: &'a Path,
    /// Kernel command line template; the verity root hash is substituted at
    /// its `verity_roothash=` parameter
    pub cmdline: &'a str,
    /// File holding the root hash produced by the image build
    pub root_hash: &'a Path,
}

/// Build the VM definition from configuration overlays and the boot
/// components, and write it as TOML to @out. All inputs are resolved before
/// anything is written, so a failure leaves no partial file behind.
pub fn write_vm_definition(
    out: &Path,
    components: &BootComponents,
    overlays: &[PathBuf],
) -> Result<VmDefinition> {
    let mut def = VmDefinition::default();
    for path in overlays {
        load_overlay(path)?
            .apply(&mut def)
            .map_err(|e| MeasureError::Config(format!("{}: {e}", path.display())))?;
    }

    let kernel = resolve_kernel_path(components.kernel)?;
    let root_hash = read_root_hash(components.root_hash)?;

    def.kernel_file = kernel.display().to_string();
    def.initrd_file = components.initrd.display().to_string();
    def.ovmf_file = components.ovmf.display().to_string();
    def.kernel_cmdline = embed_root_hash(components.cmdline, &root_hash);

    let toml = toml::to_string(&def)
        .map_err(|e| MeasureError::Config(format!("VM definition: {e}")))?;
    fs::write(out, toml).map_err(file_err(out))?;
    log::info!("Written VM definition to {}", out.display());
    Ok(def)
}

/// Remove the self-reported `expected_hash` from the measurement object.
/// The attestation-initialization endpoint must recompute trust from the
/// raw inputs, never accept a precomputed hash.
pub fn trusted_inputs(measurement: &str) -> Result<serde_json::Value> {
    let mut value: serde_json::Value = serde_json::from_str(measurement)
        .map_err(|e| MeasureError::Output(e.to_string()))?;
    let Some(object) = value.as_object_mut() else {
        return Err(MeasureError::Output(String::from("not an object")));
    };
    object.remove("expected_hash");
    Ok(value)
}

/// Invoke the external digest calculator on @vm_definition and write its
/// output verbatim to @out. With @trusted_out set, also write the object
/// with `expected_hash` stripped, for forwarding to the attestation
/// endpoint. Returns the raw measurement output.
pub fn compute_measurement(
    digest_calc: &Path,
    vm_definition: &Path,
    out: &Path,
    trusted_out: Option<&Path>,
) -> Result<String> {
    let tool = digest_calc.display().to_string();
    let measurement = cmd::output(
        &tool,
        ["--vm-definition".as_ref(), vm_definition.as_os_str()],
    )?;
    fs::write(out, &measurement).map_err(file_err(out))?;
    log::info!("Written measurement inputs to {}", out.display());

    let trusted = trusted_inputs(&measurement)?;
    if let Some(path) = trusted_out {
        let pretty = serde_json::to_string_pretty(&trusted)
            .map_err(|e| MeasureError::Output(e.to_string()))?;
        fs::write(path, pretty).map_err(file_err(path))?;
        log::info!("Written trusted launch inputs to {}", path.display());
    }
    Ok(measurement)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches_pattern() {
        assert!(matches_pattern("vmlinuz-6.8.0-snp", "vmlinuz-*"));
        assert!(matches_pattern("vmlinuz-6.8.0-snp", "*"));
        assert!(matches_pattern("linux-image-6.8.deb", "linux-image-*.deb"));
        assert!(!matches_pattern("linux-headers-6.8.deb", "linux-image-*.deb"));
        assert!(!matches_pattern("vmlinuz", "vmlinuz-*"));
        assert!(matches_pattern("vmlinuz", "vmlinuz"));
        assert!(!matches_pattern("initrd.img", "vmlinuz"));
    }

    #[test]
    fn test_resolve_kernel_path() {
        let dir = tempfile::tempdir().unwrap();
        let touch = |name: &str| fs::write(dir.path().join(name), "").unwrap();

        // Literal paths pass through unresolved
        let p = resolve_kernel_path("/boot/vmlinuz").unwrap();
        assert_eq!(p, PathBuf::from("/boot/vmlinuz"));

        let pattern = format!("{}/vmlinuz-*", dir.path().display());

        // Zero matches is a named failure
        let e = resolve_kernel_path(&pattern).unwrap_err();
        assert!(matches!(e, MeasureError::AmbiguousKernelPath(_)));

        touch("vmlinuz-6.8.0-1009-snp");
        touch("initrd.img-6.8.0-1009-snp");
        let p = resolve_kernel_path(&pattern).unwrap();
        assert_eq!(p, dir.path().join("vmlinuz-6.8.0-1009-snp"));

        // Multiple matches resolve deterministically to the sorted first
        touch("vmlinuz-6.5.0-generic");
        let p = resolve_kernel_path(&pattern).unwrap();
        assert_eq!(p, dir.path().join("vmlinuz-6.5.0-generic"));
    }

    #[test]
    fn test_embed_root_hash() {
        // The template usually carries an empty-valued parameter
        let cmdline = "console=ttyS0 root=/dev/sda boot=verity \
                       verity_disk=/dev/sdb verity_roothash=";
        let out = embed_root_hash(cmdline, "abc123");
        assert!(out.ends_with("verity_roothash=abc123"));
        assert!(out.starts_with("console=ttyS0 "));

        // A stale value is replaced, not duplicated
        let out = embed_root_hash("verity_roothash=old quiet", "new");
        assert_eq!(out, "verity_roothash=new quiet");

        // Appended when the template has no parameter
        let out = embed_root_hash("console=ttyS0", "abc");
        assert_eq!(out, "console=ttyS0 verity_roothash=abc");
        assert_eq!(embed_root_hash("", "abc"), "verity_roothash=abc");
    }

    #[test]
    fn test_read_root_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roothash.txt");

        fs::write(&path, "2d8bb7f5\n").unwrap();
        assert_eq!(read_root_hash(&path).unwrap(), "2d8bb7f5");

        fs::write(&path, "  \n").unwrap();
        assert!(matches!(
            read_root_hash(&path),
            Err(MeasureError::EmptyRootHash(_))
        ));

        assert!(matches!(
            read_root_hash(&dir.path().join("missing")),
            Err(MeasureError::File { .. })
        ));
    }

    #[test]
    fn test_write_vm_definition() {
        let dir = tempfile::tempdir().unwrap();
        let root_hash = dir.path().join("roothash.txt");
        fs::write(&root_hash, "feedc0de").unwrap();
        let out = dir.path().join("vm-config.toml");

        let components = BootComponents {
            kernel: "/boot/vmlinuz",
            initrd: Path::new("/boot/initrd.img"),
            ovmf: Path::new("/usr/share/ovmf/OVMF.fd"),
            cmdline: "root=/dev/sda verity_roothash=",
            root_hash: &root_hash,
        };
        let def = write_vm_definition(&out, &components, &[]).unwrap();
        assert_eq!(def.kernel_cmdline, "root=/dev/sda verity_roothash=feedc0de");

        // The written file parses back to the same definition
        let written = fs::read_to_string(&out).unwrap();
        let back: VmDefinition = toml::from_str(&written).unwrap();
        assert_eq!(back, def);
        assert!(written.contains("verity_roothash=feedc0de"));
    }

    #[test]
    fn test_no_partial_write() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("vm-config.toml");
        let pattern = format!("{}/vmlinuz-*", dir.path().display());
        let missing_hash = dir.path().join("roothash.txt");
        let components = BootComponents {
            kernel: &pattern,
            initrd: Path::new("initrd.img"),
            ovmf: Path::new("OVMF.fd"),
            cmdline: "",
            root_hash: &missing_hash,
        };
        assert!(write_vm_definition(&out, &components, &[]).is_err());
        assert!(!out.exists());
    }

    #[test]
    fn test_trusted_inputs() {
        let measurement = r#"{
            "kernel": "/boot/vmlinuz",
            "initrd": "/boot/initrd.img",
            "append": "root=/dev/sda verity_roothash=abc",
            "firmware": "OVMF.fd",
            "vcpus": 1,
            "vcpu_type": 5,
            "guest_features": "0x1",
            "expected_hash": "deadbeef"
        }"#;
        let trusted = trusted_inputs(measurement).unwrap();
        assert!(trusted.get("expected_hash").is_none());
        assert_eq!(trusted["kernel"], "/boot/vmlinuz");
        assert_eq!(trusted["vcpus"], 1);

        assert!(trusted_inputs("[1, 2]").is_err());
        assert!(trusted_inputs("not json").is_err());
    }
}
