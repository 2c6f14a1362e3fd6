use anyhow::{Context, Result};
use clap::Parser;
use std::process::Command;

#[derive(Parser)]
struct Args {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Parser)]
enum Cmd {
    /// Format check, clippy and the test suite, as CI runs them
    Ci {
        /// Skip `cargo fmt --check`
        #[arg(long)]
        no_fmt: bool,
    },
    /// Run the agent's tests only
    Test {
        /// Extra arguments passed to the test binaries
        #[arg(last = true)]
        args: Vec<String>,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Cmd::Ci { no_fmt } => ci(no_fmt)?,
        Cmd::Test { args } => test(&args)?,
    }

    Ok(())
}

fn cargo(step: &str, args: &[&str]) -> Result<()> {
    println!("==> cargo {}", args.join(" "));
    let status = Command::new("cargo").args(args).status().with_context(|| format!("Failed to run {step}"))?;

    if !status.success() {
        anyhow::bail!("{step} failed");
    }
    Ok(())
}

fn ci(no_fmt: bool) -> Result<()> {
    if !no_fmt {
        cargo("rustfmt", &["fmt", "--all", "--", "--check"])?;
    }
    cargo("clippy", &["clippy", "--workspace", "--all-targets", "--", "-D", "warnings"])?;
    cargo("tests", &["test", "--workspace"])?;

    println!("✓ CI checks passed");
    Ok(())
}

fn test(extra: &[String]) -> Result<()> {
    let mut args = vec!["test", "--package", "apm-agent", "--"];
    args.extend(extra.iter().map(String::as_str));
    cargo("tests", &args)
}
