//! Structures describing an AMD SEV-SNP guest definition
//!
//! This library provides the guest definition consumed by the launch digest
//! calculator: CPU family, vCPU count, boot components, guest policy and the
//! minimum committed TCB. The definition is serialized to a TOML file, which
//! is the contract with the external tool, so field names and spellings
//! (including `min_commited_tcb`) must not change.
#![warn(missing_docs)]
use bitflags::bitflags;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Length of the family and image identifiers, in bytes
pub const VM_ID_BYTES: usize = 16;

/// Error from the VM definition library
#[derive(Debug, thiserror::Error)]
pub enum VmDefinitionError {
    /// Unknown CPU family name
    #[error("unknown CPU family `{0}`")]
    UnknownCpuFamily(String),

    /// Identifier is not a hex string of the expected length
    #[error("invalid identifier `{0}`: expected 32 hex characters")]
    InvalidId(String),
}
type Result<T> = core::result::Result<T, VmDefinitionError>;

/// Host CPU generation the guest runs on. Determines the vCPU type measured
/// into the VMSA.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CpuFamily {
    /// 3rd Gen EPYC (SEV-SNP introduction)
    #[default]
    Milan,
    /// 4th Gen EPYC
    Genoa,
}

impl fmt::Display for CpuFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CpuFamily::Milan => write!(f, "Milan"),
            CpuFamily::Genoa => write!(f, "Genoa"),
        }
    }
}

impl FromStr for CpuFamily {
    type Err = VmDefinitionError;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Milan" => Ok(CpuFamily::Milan),
            "Genoa" => Ok(CpuFamily::Genoa),
            _ => Err(VmDefinitionError::UnknownCpuFamily(String::from(s))),
        }
    }
}

bitflags! {
/// Guest policy bits, passed to the hypervisor at launch and reflected in the
/// attestation report (SEV-SNP firmware ABI, GUEST_POLICY)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GuestPolicy: u64 {
    /// SMT is allowed
    const SMT = 1 << 16;
    /// Reserved, must be one
    const RESERVED = 1 << 17;
    /// Association with a migration agent is allowed
    const MIGRATE_MA = 1 << 18;
    /// Debugging of the guest is allowed
    const DEBUG = 1 << 19;
    /// The guest may only run on a single socket
    const SINGLE_SOCKET = 1 << 20;
}
}

impl Default for GuestPolicy {
    // 0x30000: SMT allowed, reserved bit set
    fn default() -> Self {
        GuestPolicy::SMT | GuestPolicy::RESERVED
    }
}

// The policy is an opaque bitmask on the wire. Serialize the raw bits and
// keep unknown bits on deserialization instead of dropping them.
impl Serialize for GuestPolicy {
    fn serialize<S: Serializer>(&self, serializer: S) -> core::result::Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.bits())
    }
}

impl<'de> Deserialize<'de> for GuestPolicy {
    fn deserialize<D: Deserializer<'de>>(
        deserializer: D,
    ) -> core::result::Result<Self, D::Error> {
        let bits = u64::deserialize(deserializer)?;
        Ok(GuestPolicy::from_bits_retain(bits))
    }
}

/// Minimum committed TCB component versions the platform must report.
/// Committed means the platform cannot be rolled back to an earlier version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TcbVersion {
    /// Bootloader security version number
    pub bootloader: u8,
    /// TEE security version number
    pub tee: u8,
    /// SNP firmware security version number
    pub snp: u8,
    /// Microcode security version number
    pub microcode: u8,
    /// Reserved bytes, kept zero
    #[serde(default)]
    pub _reserved: [u8; 4],
}

impl Default for TcbVersion {
    fn default() -> Self {
        TcbVersion {
            bootloader: 4,
            tee: 0,
            snp: 22,
            microcode: 213,
            _reserved: [0; 4],
        }
    }
}

mod hex_id {
    use super::VM_ID_BYTES;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        id: &[u8; VM_ID_BYTES],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(id))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<[u8; VM_ID_BYTES], D::Error> {
        let s = String::deserialize(deserializer)?;
        super::parse_id(&s).map_err(serde::de::Error::custom)
    }
}

/// Parse a family or image identifier from its hex representation
pub fn parse_id(s: &str) -> Result<[u8; VM_ID_BYTES]> {
    let bytes = hex::decode(s).map_err(|_| VmDefinitionError::InvalidId(String::from(s)))?;
    bytes
        .try_into()
        .map_err(|_| VmDefinitionError::InvalidId(String::from(s)))
}

/// User-facing definition of a SEV-SNP guest, used to compute the expected
/// launch measurement. Serialized as TOML for the digest calculator; the
/// `min_commited_tcb` table must stay last so the scalar fields serialize
/// before it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmDefinition {
    /// Host CPU generation
    pub host_cpu_family: CpuFamily,
    /// Number of virtual CPUs
    pub vcpu_count: u32,
    /// Path to the OVMF firmware image
    pub ovmf_file: String,
    /// SEV_FEATURES value of the VMSA (affects the launch measurement)
    pub guest_features: u64,
    /// Path to the kernel image
    pub kernel_file: String,
    /// Path to the initrd image
    pub initrd_file: String,
    /// Kernel command line
    pub kernel_cmdline: String,
    /// PLATFORM_INFO field expected in the attestation report
    pub platform_info: u64,
    /// Guest policy bitmask
    pub guest_policy: GuestPolicy,
    /// Family identifier, hex encoded on the wire
    #[serde(with = "hex_id")]
    pub family_id: [u8; VM_ID_BYTES],
    /// Image identifier, hex encoded on the wire
    #[serde(with = "hex_id")]
    pub image_id: [u8; VM_ID_BYTES],
    /// Minimum committed TCB
    pub min_commited_tcb: TcbVersion,
}

impl Default for VmDefinition {
    fn default() -> Self {
        VmDefinition {
            host_cpu_family: CpuFamily::default(),
            vcpu_count: 1,
            ovmf_file: String::new(),
            guest_features: 0x1,
            kernel_file: String::new(),
            initrd_file: String::new(),
            kernel_cmdline: String::new(),
            platform_info: 0x3,
            guest_policy: GuestPolicy::default(),
            family_id: [0; VM_ID_BYTES],
            image_id: [0; VM_ID_BYTES],
            min_commited_tcb: TcbVersion::default(),
        }
    }
}

/// Optional overrides for a [`VmDefinition`]. Loaded from configuration
/// files; fields left unset keep the built-in defaults. Identifiers are hex
/// strings, validated when the overlay is applied.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VmDefinitionOverlay {
    /// Host CPU generation
    pub host_cpu_family: Option<CpuFamily>,
    /// Number of virtual CPUs
    pub vcpu_count: Option<u32>,
    /// Path to the OVMF firmware image
    pub ovmf_file: Option<String>,
    /// SEV_FEATURES value of the VMSA
    pub guest_features: Option<u64>,
    /// Path to the kernel image
    pub kernel_file: Option<String>,
    /// Path to the initrd image
    pub initrd_file: Option<String>,
    /// Kernel command line
    pub kernel_cmdline: Option<String>,
    /// PLATFORM_INFO field expected in the attestation report
    pub platform_info: Option<u64>,
    /// Guest policy bitmask
    pub guest_policy: Option<GuestPolicy>,
    /// Family identifier as a hex string
    pub family_id: Option<String>,
    /// Image identifier as a hex string
    pub image_id: Option<String>,
    /// Minimum committed TCB
    pub min_commited_tcb: Option<TcbVersion>,
}

impl VmDefinitionOverlay {
    /// Apply the overlay to @def. Throw an error for any invalid identifier.
    pub fn apply(&self, def: &mut VmDefinition) -> Result<()> {
        if let Some(v) = self.host_cpu_family {
            def.host_cpu_family = v;
        }
        if let Some(v) = self.vcpu_count {
            def.vcpu_count = v;
        }
        if let Some(v) = &self.ovmf_file {
            def.ovmf_file.clone_from(v);
        }
        if let Some(v) = self.guest_features {
            def.guest_features = v;
        }
        if let Some(v) = &self.kernel_file {
            def.kernel_file.clone_from(v);
        }
        if let Some(v) = &self.initrd_file {
            def.initrd_file.clone_from(v);
        }
        if let Some(v) = &self.kernel_cmdline {
            def.kernel_cmdline.clone_from(v);
        }
        if let Some(v) = self.platform_info {
            def.platform_info = v;
        }
        if let Some(v) = self.guest_policy {
            def.guest_policy = v;
        }
        if let Some(v) = &self.family_id {
            def.family_id = parse_id(v)?;
        }
        if let Some(v) = &self.image_id {
            def.image_id = parse_id(v)?;
        }
        if let Some(v) = self.min_commited_tcb {
            def.min_commited_tcb = v;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let def = VmDefinition::default();
        assert_eq!(def.host_cpu_family, CpuFamily::Milan);
        assert_eq!(def.vcpu_count, 1);
        assert_eq!(def.guest_features, 0x1);
        assert_eq!(def.platform_info, 0x3);
        assert_eq!(def.guest_policy.bits(), 0x30000);
        assert_eq!(def.min_commited_tcb.bootloader, 4);
        assert_eq!(def.min_commited_tcb.tee, 0);
        assert_eq!(def.min_commited_tcb.snp, 22);
        assert_eq!(def.min_commited_tcb.microcode, 213);
    }

    #[test]
    fn test_toml_contract() {
        // A default definition must serialize the complete field set the
        // digest calculator expects.
        let toml = toml::to_string(&VmDefinition::default()).unwrap();
        for key in [
            "host_cpu_family",
            "vcpu_count",
            "ovmf_file",
            "guest_features",
            "kernel_file",
            "initrd_file",
            "kernel_cmdline",
            "platform_info",
            "guest_policy",
            "family_id",
            "image_id",
            "[min_commited_tcb]",
            "bootloader",
            "microcode",
            "_reserved",
        ] {
            assert!(toml.contains(key), "missing `{key}` in:\n{toml}");
        }
        assert!(toml.contains("\"Milan\""));
        assert!(toml.contains(&format!("family_id = \"{}\"", "0".repeat(32))));

        let back: VmDefinition = toml::from_str(&toml).unwrap();
        assert_eq!(back, VmDefinition::default());
    }

    #[test]
    fn test_partial_toml() {
        // A partially-specified definition still yields a complete one
        let def: VmDefinition = toml::from_str("vcpu_count = 4").unwrap();
        assert_eq!(def.vcpu_count, 4);
        assert_eq!(def.guest_policy, GuestPolicy::default());

        // TOML hex integers are part of the wire format
        let def: VmDefinition = toml::from_str("guest_policy = 0x30000").unwrap();
        assert_eq!(def.guest_policy, GuestPolicy::SMT | GuestPolicy::RESERVED);

        // Unknown policy bits are kept as-is
        let def: VmDefinition = toml::from_str("guest_policy = 0xf0000").unwrap();
        assert_eq!(def.guest_policy.bits(), 0xf0000);
    }

    #[test]
    fn test_ids() {
        assert_eq!(parse_id(&"00".repeat(16)).unwrap(), [0u8; 16]);
        let id = parse_id("000102030405060708090a0b0c0d0e0f").unwrap();
        assert_eq!(id[1], 0x01);
        assert_eq!(id[15], 0x0f);
        assert!(parse_id("00").is_err());
        assert!(parse_id("not hex").is_err());
    }

    #[test]
    fn test_overlay() {
        let mut def = VmDefinition::default();
        let overlay: VmDefinitionOverlay = toml::from_str(
            r#"
            vcpu_count = 8
            guest_policy = 0xb0000
            image_id = "000102030405060708090a0b0c0d0e0f"
            [min_commited_tcb]
            bootloader = 9
            tee = 0
            snp = 25
            microcode = 220
            "#,
        )
        .unwrap();
        overlay.apply(&mut def).unwrap();
        assert_eq!(def.vcpu_count, 8);
        assert!(def.guest_policy.contains(GuestPolicy::DEBUG));
        assert_eq!(def.image_id[15], 0x0f);
        assert_eq!(def.min_commited_tcb.snp, 25);
        // Untouched fields keep their defaults
        assert_eq!(def.host_cpu_family, CpuFamily::Milan);

        let overlay: VmDefinitionOverlay =
            toml::from_str("family_id = \"xyz\"").unwrap();
        assert!(overlay.apply(&mut def).is_err());
    }
}
