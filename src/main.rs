use std::fs;
use std::process;

use anyhow::{Context, Result};
use clap::Parser;

use snp_guest_image::builder::{self, SetupArgs};
use snp_guest_image::command_line::*;
use snp_guest_image::measure::{self, BootComponents};
use snp_guest_image::rootfs::{AcceptFirst, Confirm, TerminalConfirm};

fn confirm_policy(non_interactive: bool) -> Box<dyn Confirm> {
    if non_interactive {
        Box::new(AcceptFirst)
    } else {
        Box::new(TerminalConfirm)
    }
}

fn setup_verity(args: &SetupVerityArgs) -> Result<()> {
    let confirm = confirm_policy(args.non_interactive);
    let root_hash = builder::setup_guest_image(
        &SetupArgs {
            image: &args.image,
            content_dir: &args.content_dir,
            out_image: &args.out_image,
            out_hash_tree: &args.out_hash_tree,
            out_root_hash: &args.out_root_hash,
            debug: args.debug,
            root_device: args.root_device.as_deref(),
        },
        confirm.as_ref(),
    )?;
    println!("Root hash: {root_hash}");
    Ok(())
}

fn vm_config(args: &VmConfigArgs) -> Result<()> {
    measure::write_vm_definition(
        &args.out,
        &BootComponents {
            kernel: &args.kernel,
            initrd: &args.initrd,
            ovmf: &args.ovmf,
            cmdline: &args.cmdline,
            root_hash: &args.root_hash,
        },
        &args.config,
    )?;
    Ok(())
}

fn run_measure(args: &MeasureArgs) -> Result<()> {
    let measurement = measure::compute_measurement(
        &args.digest_calc,
        &args.vm_definition,
        &args.out,
        args.trusted_out.as_deref(),
    )?;
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(&measurement) {
        if let Some(hash) = value.get("expected_hash").and_then(|h| h.as_str()) {
            println!("Expected launch digest: {hash}");
        }
    }
    Ok(())
}

fn build_guest(args: &BuildGuestArgs) -> Result<()> {
    fs::create_dir_all(&args.out_dir)
        .with_context(|| format!("creating {}", args.out_dir.display()))?;

    let out_root_hash = args.out_dir.join("roothash.txt");
    let confirm = confirm_policy(args.non_interactive);
    let root_hash = builder::setup_guest_image(
        &SetupArgs {
            image: &args.image,
            content_dir: &args.content_dir,
            out_image: &args.out_dir.join("image.qcow2"),
            out_hash_tree: &args.out_dir.join("hash_tree.bin"),
            out_root_hash: &out_root_hash,
            debug: args.debug,
            root_device: args.root_device.as_deref(),
        },
        confirm.as_ref(),
    )?;

    let vm_definition = args.out_dir.join("vm-config.toml");
    measure::write_vm_definition(
        &vm_definition,
        &BootComponents {
            kernel: &args.kernel,
            initrd: &args.initrd,
            ovmf: &args.ovmf,
            cmdline: &args.cmdline,
            root_hash: &out_root_hash,
        },
        &args.config,
    )?;

    measure::compute_measurement(
        &args.digest_calc,
        &vm_definition,
        &args.out_dir.join("measurement-inputs.json"),
        Some(&args.out_dir.join("snp-trusted.json")),
    )?;

    println!("Root hash: {root_hash}");
    println!("Guest build complete in {}", args.out_dir.display());
    Ok(())
}

fn run(args: &Args) -> Result<()> {
    match &args.cmd {
        Command::SetupVerity(a) => setup_verity(a),
        Command::VmConfig(a) => vm_config(a),
        Command::Measure(a) => run_measure(a),
        Command::BuildGuest(a) => build_guest(a),
    }
}

fn main() {
    let args = Args::parse();

    stderrlog::new()
        .verbosity(usize::from(args.verbose) + 2)
        .init()
        .unwrap();

    if let Err(e) = run(&args) {
        log::error!("{e:#}");
        process::exit(1);
    }
}
