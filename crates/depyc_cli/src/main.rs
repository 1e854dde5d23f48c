use std::path::Path;

use clap::{CommandFactory, Parser};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, TopLevel};

mod cli;

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn run(path: &Path, name: Option<String>, mode: depyc_lib::DecompileMode) {
    let display_name = name.or_else(|| {
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
    });
    debug!(path = %path.display(), ?mode, "processing");

    match std::fs::read(path) {
        Ok(bytes) => match depyc_lib::decompile_with_options(
            &bytes,
            depyc_lib::DecompileOptions { mode, display_name },
        ) {
            Ok(out) => {
                print!("{out}");
            }
            Err(e) => {
                eprintln!("error: {e}");
                std::process::exit(1);
            }
        },
        Err(e) => {
            eprintln!("error: failed to read {path:?}: {e}");
            std::process::exit(1);
        }
    }
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Some(TopLevel::Decompile { path, name }) => {
            run(&path, name, depyc_lib::DecompileMode::Source);
        }
        Some(TopLevel::Disasm { path, name }) => {
            run(&path, name, depyc_lib::DecompileMode::Disasm);
        }
        Some(TopLevel::Completion { shell }) => {
            let mut cmd = Cli::command();
            let bin_name = cmd.get_name().to_string();
            clap_complete::generate(shell, &mut cmd, bin_name, &mut std::io::stdout());
        }
        None => {
            let _ = Cli::command().print_help();
        }
    }
}
