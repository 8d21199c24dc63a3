/// Parse the main command-line.
///
use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Default kernel command line of a verity-protected guest. The root
/// filesystem is the first disk, the hash tree the second, and the root
/// hash is substituted at the trailing parameter.
pub const DEFAULT_CMDLINE: &str = "console=ttyS0 earlyprintk=serial root=/dev/sda \
     boot=verity verity_disk=/dev/sdb verity_roothash=";

// This is the help blurb:
/// Build dm-verity protected root filesystem images for AMD SEV-SNP guests
/// and assemble the inputs of their expected launch measurement.
#[derive(Debug, Parser)]
#[command(version, long_about, verbatim_doc_comment)]
pub struct Args {
    /// Display more information (use multiple times to increase verbosity)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub cmd: Command,
}

/// The selected subcommand
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Build the dm-verity protected guest image (requires root)
    SetupVerity(SetupVerityArgs),
    /// Write the VM definition consumed by the digest calculator
    VmConfig(VmConfigArgs),
    /// Run the digest calculator and collect the measurement inputs
    Measure(MeasureArgs),
    /// Build the whole guest: image, VM definition and measurement
    BuildGuest(BuildGuestArgs),
}

/// Arguments of the verity image build
#[derive(Debug, clap::Args)]
pub struct SetupVerityArgs {
    /// Source VM image (raw or qcow2)
    #[arg(long, value_name = "file")]
    pub image: PathBuf,

    /// Directory holding the guest payload bundles (one `<name>` payload
    /// per `<name>.service` unit file)
    #[arg(long, value_name = "dir")]
    pub content_dir: PathBuf,

    /// Output verity disk image
    #[arg(long, value_name = "file", default_value = "image.qcow2")]
    pub out_image: PathBuf,

    /// Output hash tree
    #[arg(long, value_name = "file", default_value = "hash_tree.bin")]
    pub out_hash_tree: PathBuf,

    /// Output root hash file
    #[arg(long, value_name = "file", default_value = "roothash.txt")]
    pub out_root_hash: PathBuf,

    /// Keep interactive access in the image for troubleshooting
    #[arg(long)]
    pub debug: bool,

    /// Never prompt; accept the detected root filesystem
    #[arg(long)]
    pub non_interactive: bool,

    /// Use this root filesystem device instead of detecting one
    #[arg(long, value_name = "device")]
    pub root_device: Option<PathBuf>,
}

/// Arguments of the VM definition assembly
#[derive(Debug, clap::Args)]
pub struct VmConfigArgs {
    /// Kernel image; `*` wildcards in the file name are resolved
    #[arg(short, long, value_name = "file")]
    pub kernel: String,

    /// Initrd image
    #[arg(short, long, value_name = "file")]
    pub initrd: PathBuf,

    /// OVMF firmware image
    #[arg(long, value_name = "file")]
    pub ovmf: PathBuf,

    /// Kernel command line template; the root hash is substituted at its
    /// verity_roothash= parameter
    #[arg(long, value_name = "cmdline", default_value = DEFAULT_CMDLINE)]
    pub cmdline: String,

    /// File holding the root hash produced by setup-verity
    #[arg(long, value_name = "file", default_value = "roothash.txt")]
    pub root_hash: PathBuf,

    /// Config file overriding VM definition defaults. Can be specified
    /// multiple times; later files override earlier ones.
    #[arg(short, long, verbatim_doc_comment, value_name = "file")]
    pub config: Vec<PathBuf>,

    /// Output VM definition file
    #[arg(long, value_name = "file", default_value = "vm-config.toml")]
    pub out: PathBuf,
}

/// Arguments of the measurement computation
#[derive(Debug, clap::Args)]
pub struct MeasureArgs {
    /// VM definition file
    #[arg(long, value_name = "file", default_value = "vm-config.toml")]
    pub vm_definition: PathBuf,

    /// Digest calculator binary
    #[arg(long, value_name = "file", default_value = "digest_calc")]
    pub digest_calc: PathBuf,

    /// Output measurement inputs file
    #[arg(long, value_name = "file", default_value = "measurement-inputs.json")]
    pub out: PathBuf,

    /// Also write the measurement inputs with expected_hash stripped, for
    /// the attestation-initialization endpoint
    #[arg(long, value_name = "file")]
    pub trusted_out: Option<PathBuf>,
}

/// Arguments of the combined guest build
#[derive(Debug, clap::Args)]
pub struct BuildGuestArgs {
    /// Source VM image (raw or qcow2)
    #[arg(long, value_name = "file")]
    pub image: PathBuf,

    /// Directory holding the guest payload bundles
    #[arg(long, value_name = "dir")]
    pub content_dir: PathBuf,

    /// Directory receiving all build artifacts
    #[arg(long, value_name = "dir", default_value = "build/verity")]
    pub out_dir: PathBuf,

    /// Kernel image; `*` wildcards in the file name are resolved
    #[arg(short, long, value_name = "file")]
    pub kernel: String,

    /// Initrd image
    #[arg(short, long, value_name = "file")]
    pub initrd: PathBuf,

    /// OVMF firmware image
    #[arg(long, value_name = "file")]
    pub ovmf: PathBuf,

    /// Kernel command line template
    #[arg(long, value_name = "cmdline", default_value = DEFAULT_CMDLINE)]
    pub cmdline: String,

    /// Config file overriding VM definition defaults (repeatable)
    #[arg(short, long, value_name = "file")]
    pub config: Vec<PathBuf>,

    /// Digest calculator binary
    #[arg(long, value_name = "file", default_value = "digest_calc")]
    pub digest_calc: PathBuf,

    /// Keep interactive access in the image for troubleshooting
    #[arg(long)]
    pub debug: bool,

    /// Never prompt; accept the detected root filesystem
    #[arg(long)]
    pub non_interactive: bool,

    /// Use this root filesystem device instead of detecting one
    #[arg(long, value_name = "device")]
    pub root_device: Option<PathBuf>,
}
