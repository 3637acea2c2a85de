//! Build helper for tcp-steer.
//!
//! Handles compiling the XDP eBPF program with the correct target and linker.
//!
//! Usage:
//!   cargo xtask build-ebpf-xdp [--release]     # Build XDP eBPF program
//!   cargo xtask build [--release]              # Build everything (eBPF + userspace)
//!   cargo xtask run [--release] -- <args>      # Build everything and run

use std::path::PathBuf;
use std::process::Command;

use anyhow::{bail, Context, Result};
use clap::Parser;

#[derive(Parser)]
enum Cli {
    /// Build the XDP eBPF program only.
    BuildEbpfXdp {
        /// Build in release mode.
        #[arg(long)]
        release: bool,
    },
    /// Build everything (XDP eBPF + userspace).
    Build {
        /// Build in release mode.
        #[arg(long)]
        release: bool,
    },
    /// Build everything and run the daemon.
    Run {
        /// Build in release mode.
        #[arg(long)]
        release: bool,
        /// Arguments to pass to tcp-steer.
        #[arg(last = true)]
        args: Vec<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli {
        Cli::BuildEbpfXdp { release } => {
            build_ebpf_xdp(release)?;
        }
        Cli::Build { release } => {
            build_ebpf_xdp(release)?;
            build_userspace(release)?;
        }
        Cli::Run { release, args } => {
            build_ebpf_xdp(release)?;
            build_userspace(release)?;
            run_daemon(release, &args)?;
        }
    }

    Ok(())
}

fn workspace_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .unwrap()
        .to_path_buf()
}

/// Build the XDP eBPF program.
///
/// This requires:
/// - `bpf-linker` installed: `cargo install bpf-linker`
/// - Nightly Rust for the BPF target: `rustup toolchain install nightly`
/// - BPF target: `rustup target add bpfel-unknown-none --toolchain nightly`
fn build_ebpf_xdp(release: bool) -> Result<()> {
    let root = workspace_root();
    let xdp_dir = root.join("tcp-steer-ebpf-xdp");

    println!("=> Building XDP eBPF program...");

    let mut cmd = Command::new("cargo");
    cmd.current_dir(&xdp_dir)
        .arg("+nightly")
        .arg("build")
        .arg("--target=bpfel-unknown-none")
        .arg("-Z")
        .arg("build-std=core");

    if release {
        cmd.arg("--release");
    }

    let status = cmd.status().context("running cargo build for XDP eBPF program")?;

    if !status.success() {
        bail!("XDP eBPF build failed");
    }

    // Copy the compiled eBPF binary to the workspace target dir for easy access
    let profile = if release { "release" } else { "debug" };
    let xdp_binary = xdp_dir
        .join("target")
        .join("bpfel-unknown-none")
        .join(profile)
        .join("tcp-steer-ebpf-xdp");

    let dest = root.join("target").join("tcp-steer-ebpf-xdp");
    std::fs::create_dir_all(dest.parent().unwrap())?;

    if xdp_binary.exists() {
        std::fs::copy(&xdp_binary, &dest).with_context(|| {
            format!(
                "copying XDP eBPF binary from {} to {}",
                xdp_binary.display(),
                dest.display()
            )
        })?;
        println!("   XDP eBPF program: {}", dest.display());
    }

    println!("=> XDP eBPF build complete");
    Ok(())
}

/// Build the userspace daemon.
fn build_userspace(release: bool) -> Result<()> {
    let root = workspace_root();

    println!("=> Building userspace daemon...");

    let mut cmd = Command::new("cargo");
    cmd.current_dir(&root).arg("build").arg("-p").arg("tcp-steer");

    if release {
        cmd.arg("--release");
    }

    let status = cmd.status().context("running cargo build for userspace")?;

    if !status.success() {
        bail!("userspace build failed");
    }

    println!("=> Userspace build complete");
    Ok(())
}

/// Run the daemon.
fn run_daemon(release: bool, extra_args: &[String]) -> Result<()> {
    let root = workspace_root();
    let profile = if release { "release" } else { "debug" };

    let binary = root.join("target").join(profile).join("tcp-steer");
    let xdp_program = root.join("target").join("tcp-steer-ebpf-xdp");

    println!("=> Running tcp-steer...");

    let mut cmd = Command::new(&binary);
    cmd.arg("--xdp-program").arg(&xdp_program);
    cmd.args(extra_args);

    let status = cmd.status().context("running tcp-steer")?;

    if !status.success() {
        bail!("tcp-steer exited with error");
    }

    Ok(())
}
