//! Build verifiable guest images for AMD SEV-SNP confidential VMs.
//!
//! This project turns a mutable cloud VM disk image into an immutable boot
//! artifact protected by dm-verity, and assembles the inputs a verifier
//! needs to check the guest's hardware-issued launch measurement.
//!
//! # Image build
//!
//! The pipeline copies the source root filesystem onto a fresh image,
//! injects the guest payload, hardens the tree (no SSH, no consoles, no
//! interactive shells, mutable directories relocated for a runtime
//! overlay) and computes the dm-verity hash tree over the result. The root
//! hash — the single trust anchor of the verified filesystem — is written
//! to its own file.
//!
//! Example
//! ```bash
//! snp-guest-image setup-verity
//!     --image build/guest/base.qcow2      # Source VM image
//!     --content-dir build/content         # Payload bundles to inject
//!     --out-image build/verity/image.qcow2
//!     --out-hash-tree build/verity/hash_tree.bin
//!     --out-root-hash build/verity/roothash.txt
//! ```
//!
//! # Measurement
//!
//! The root hash is embedded into the kernel command line, which together
//! with the kernel, initrd, firmware and guest policy forms the VM
//! definition handed to the external digest calculator. A relying party
//! compares the resulting expected launch digest against the hardware
//! attestation report, and the verify-before-mount kernel command line ties
//! the attested boot chain to the root filesystem content.

#![warn(missing_docs)]
/// Verity image build pipeline
pub mod builder;
/// External tool invocation
pub mod cmd;
/// Command-line surface
pub mod command_line;
/// Login-surface removal and directory relocation
pub mod harden;
/// Launch measurement input assembly
pub mod measure;
/// Temporary mount points
pub mod mount;
/// NBD block device bridge
pub mod nbd;
/// Root filesystem detection
pub mod rootfs;
/// dm-verity hash tree computation
pub mod verity;

mod utils;
