use std::process::Command;

use anyhow::Context as _;
use clap::{Args, Parser};

const EBPF_TARGET: &str = "bpfel-unknown-none";

#[derive(Parser)]
enum Cli {
    /// Compile the XDP program for bpfel-unknown-none.
    BuildEbpf(Profile),
    /// Compile the XDP program and the agent.
    Build(Profile),
    /// Build everything and start the agent under sudo on one interface.
    Run {
        #[command(flatten)]
        profile: Profile,
        /// Interface to attach the XDP program to.
        #[arg(long, default_value = "eth0")]
        ifname: String,
        /// Extra arguments passed to the agent.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

#[derive(Args, Clone, Copy)]
struct Profile {
    /// Build in release mode.
    #[arg(long)]
    release: bool,
}

impl Profile {
    fn name(self) -> &'static str {
        if self.release {
            "release"
        } else {
            "debug"
        }
    }
}

fn main() -> anyhow::Result<()> {
    match Cli::parse() {
        Cli::BuildEbpf(profile) => build_ebpf(profile),
        Cli::Build(profile) => build_all(profile),
        Cli::Run {
            profile,
            ifname,
            args,
        } => {
            build_all(profile)?;
            run(profile, &ifname, &args)
        }
    }
}

fn build_all(profile: Profile) -> anyhow::Result<()> {
    build_ebpf(profile)?;
    build_agent(profile)
}

fn build_ebpf(profile: Profile) -> anyhow::Result<()> {
    let mut cmd = Command::new("cargo");
    cmd.current_dir(concat!(env!("CARGO_MANIFEST_DIR"), "/../coldgate-ebpf"));
    cmd.args(["+nightly", "build", "--target", EBPF_TARGET, "-Z", "build-std=core"]);
    if profile.release {
        cmd.arg("--release");
    }
    let status = cmd
        .status()
        .context("failed to spawn cargo for the XDP program")?;
    anyhow::ensure!(
        status.success(),
        "XDP program build failed ({} profile)",
        profile.name()
    );
    Ok(())
}

fn build_agent(profile: Profile) -> anyhow::Result<()> {
    let mut cmd = Command::new("cargo");
    cmd.args(["build", "--package", "coldgate"]);
    if profile.release {
        cmd.arg("--release");
    }
    let status = cmd.status().context("failed to spawn cargo for the agent")?;
    anyhow::ensure!(status.success(), "agent build failed");
    Ok(())
}

fn run(profile: Profile, ifname: &str, extra_args: &[String]) -> anyhow::Result<()> {
    let bin = format!("target/{}/coldgate", profile.name());
    let object = format!("coldgate-ebpf/target/{EBPF_TARGET}/{}/coldgate", profile.name());

    let mut cmd = Command::new("sudo");
    cmd.arg(&bin)
        .args(["--ifname", ifname])
        .args(["--bpf-object", &object])
        .args(extra_args);
    let status = cmd
        .status()
        .with_context(|| format!("failed to start {bin}"))?;
    anyhow::ensure!(status.success(), "coldgate exited with {status}");
    Ok(())
}
