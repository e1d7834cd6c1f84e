use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod build;
mod doctor;
mod init;

#[derive(Parser, Debug)]
#[command(name = "bpfbuild")]
#[command(about = "Build verified eBPF ELF objects from compiled IR modules.", long_about = None)]
#[command(version)]
struct Cli {
    /// Debug-level logging on stderr.
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Link, optimize, and code-generate an eBPF object.
    Build(Box<build::BuildArgs>),
    /// Check toolchain availability and versions.
    Doctor(doctor::DoctorArgs),
    /// Create a new eBPF build project skeleton.
    Init(init::InitArgs),
}

fn main() -> ExitCode {
    match try_main() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::from(2)
        }
    }
}

fn try_main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    match cli.command {
        Command::Build(args) => build::cmd_build(*args),
        Command::Doctor(args) => doctor::cmd_doctor(args),
        Command::Init(args) => init::cmd_init(args),
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}
