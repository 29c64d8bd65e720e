use std::path::PathBuf;
use std::process::Command;

use anyhow::{bail, Context, Result};
use clap::Parser;

#[derive(Parser)]
enum Cli {
    /// Build the eBPF programs
    BuildEbpf {
        /// Set the endianness of the BPF target
        #[clap(default_value = "bpfel-unknown-none", long)]
        target: String,
        /// Build in release mode
        #[clap(long)]
        release: bool,
    },
    /// Build eBPF programs and run the userspace agent
    Run {
        /// Build in release mode
        #[clap(long)]
        release: bool,
        /// Arguments to pass to the agent binary
        #[clap(last = true)]
        run_args: Vec<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli {
        Cli::BuildEbpf { target, release } => build_ebpf(&target, release),
        Cli::Run { release, run_args } => {
            build_ebpf("bpfel-unknown-none", release)?;
            run(release, &run_args)
        }
    }
}

fn build_ebpf(target: &str, _release: bool) -> Result<()> {
    let workspace_root = workspace_root();
    let ebpf_dir = workspace_root.join("crates/ceems-ebpf");

    // eBPF programs MUST be built in release mode: debug builds pull in
    // core::fmt paths that exceed BPF's function argument limit.
    let mut cmd = Command::new("cargo");
    cmd.current_dir(&ebpf_dir)
        .env_remove("RUSTUP_TOOLCHAIN")
        .args(["build", "--target", target, "-Z", "build-std=core", "--release"])
        .env("CARGO_ENCODED_RUSTFLAGS", ["-Cdebuginfo=2", "-Clink-arg=--btf"].join("\x1f"));

    let status = cmd.status().context("failed to build eBPF programs")?;
    if !status.success() {
        bail!("eBPF build failed with status: {}", status);
    }

    Ok(())
}

fn run(release: bool, run_args: &[String]) -> Result<()> {
    let workspace_root = workspace_root();

    let mut cmd = Command::new("cargo");
    cmd.current_dir(&workspace_root).args(["build", "--package", "ceems-exporter"]);

    if release {
        cmd.arg("--release");
    }

    let status = cmd.status().context("failed to build the exporter binary")?;
    if !status.success() {
        bail!("exporter build failed with status: {}", status);
    }

    let profile = if release { "release" } else { "debug" };
    let bin = workspace_root.join("target").join(profile).join("ceems-exporter");

    let mut cmd = Command::new("sudo");
    cmd.arg(bin);
    cmd.args(run_args);

    let status = cmd.status().context("failed to run ceems-exporter")?;
    if !status.success() {
        bail!("ceems-exporter exited with status: {}", status);
    }

    Ok(())
}

fn workspace_root() -> PathBuf {
    let output = Command::new("cargo")
        .args(["metadata", "--format-version=1", "--no-deps"])
        .output()
        .expect("failed to run cargo metadata");

    let metadata: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("failed to parse cargo metadata");

    PathBuf::from(metadata["workspace_root"].as_str().expect("workspace_root not found"))
}
