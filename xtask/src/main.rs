//! Developer tasks for dentrymon.
//!
//! `build` compiles the agent (the eBPF object is produced by the agent's
//! build script), `run` rebuilds and launches it under sudo since kprobe
//! attachment needs root, and `dist` assembles everything an operator
//! needs to install the agent on a node by hand.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Developer tasks for dentrymon")]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Compile the agent binary
    Build {
        /// Build in release mode
        #[arg(long)]
        release: bool,

        /// Target triple, e.g. aarch64-unknown-linux-gnu
        #[arg(long)]
        target: Option<String>,
    },

    /// Build, then run the agent under sudo
    Run {
        /// Build in release mode
        #[arg(long)]
        release: bool,

        /// Arguments forwarded to the agent, e.g. -- --trace-enabled
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Assemble an installable directory: binary, env example, systemd unit
    Dist {
        /// Target triple the binary was built for
        #[arg(long)]
        target: Option<String>,

        /// Where to place the assembled files
        #[arg(long, default_value = "dist")]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Cmd::Build { release, target } => {
            let binary = cargo_build(release, target.as_deref())?;
            println!("built {}", binary.display());
        }
        Cmd::Run { release, args } => run(release, &args)?,
        Cmd::Dist { target, output } => dist(target.as_deref(), &output)?,
    }
    Ok(())
}

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .expect("xtask lives one level below the workspace root")
        .to_path_buf()
}

/// Run `cargo build -p dentrymon` and return the path of the produced
/// binary. Cross builds only differ in the target directory layout.
fn cargo_build(release: bool, target: Option<&str>) -> Result<PathBuf> {
    let root = workspace_root();

    let mut cmd = Command::new("cargo");
    cmd.current_dir(&root).args(["build", "-p", "dentrymon"]);
    if release {
        cmd.arg("--release");
    }
    if let Some(triple) = target {
        cmd.args(["--target", triple]);
    }

    let status = cmd.status().context("failed to run cargo build")?;
    if !status.success() {
        bail!("cargo build failed");
    }

    let profile = if release { "release" } else { "debug" };
    let mut path = root.join("target");
    if let Some(triple) = target {
        path.push(triple);
    }
    path.push(profile);
    path.push("dentrymon");
    Ok(path)
}

/// Kprobe attachment and BPF map creation need root; keep the developer
/// loop short by wrapping the sudo invocation here. `-E` preserves
/// RUST_LOG and DENTRYMON_* variables across the privilege boundary.
fn run(release: bool, args: &[String]) -> Result<()> {
    let binary = cargo_build(release, None)?;

    let status = Command::new("sudo")
        .arg("-E")
        .arg(&binary)
        .args(args)
        .status()
        .context("failed to run the agent under sudo")?;
    if !status.success() {
        bail!("dentrymon exited with {status}");
    }
    Ok(())
}

/// Lay out an install directory. No packaging magic: the operator copies
/// three files onto the node and runs systemctl.
fn dist(target: Option<&str>, output: &Path) -> Result<()> {
    let root = workspace_root();
    let binary = cargo_build(true, target)?;

    fs::create_dir_all(output)
        .with_context(|| format!("create {}", output.display()))?;

    fs::copy(&binary, output.join("dentrymon")).context("copy agent binary")?;
    fs::copy(root.join("example.env"), output.join("dentrymon.env"))
        .context("copy example.env")?;
    fs::write(output.join("dentrymon.service"), SYSTEMD_UNIT)
        .context("write systemd unit")?;

    println!("assembled {}", output.display());
    println!();
    println!("install on a node with:");
    println!("  install -m 755 dentrymon /usr/local/bin/dentrymon");
    println!("  install -d /etc/dentrymon && install -m 644 dentrymon.env /etc/dentrymon/");
    println!("  install -m 644 dentrymon.service /etc/systemd/system/");
    println!("  systemctl daemon-reload && systemctl enable --now dentrymon");
    Ok(())
}

/// The agent needs the BPF capability set for kprobes and maps, a writable
/// trace directory, and the host proc/cgroup views it reads identity from.
const SYSTEMD_UNIT: &str = r#"[Unit]
Description=dentrymon dentry cache observability agent
Documentation=https://github.com/dentrymon/dentrymon
After=network.target

[Service]
Type=simple
ExecStart=/usr/local/bin/dentrymon
EnvironmentFile=-/etc/dentrymon/dentrymon.env
Restart=on-failure
RestartSec=5

NoNewPrivileges=no
CapabilityBoundingSet=CAP_SYS_ADMIN CAP_BPF CAP_PERFMON
AmbientCapabilities=CAP_SYS_ADMIN CAP_BPF CAP_PERFMON
StateDirectory=dentrymon
ReadWritePaths=/data/traces

[Install]
WantedBy=multi-user.target
"#;
