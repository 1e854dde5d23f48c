use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand, builder::{Styles, styling::{AnsiColor, Effects}}, crate_description, crate_name, crate_version};
use clap_complete::Shell;

#[derive(Parser)]
#[command(name = crate_name!(),
    version = crate_version!(),
    about = crate_description!(),
    styles = Styles::styled()
        .header(AnsiColor::BrightGreen.on_default() | Effects::BOLD | Effects::UNDERLINE)
        .usage(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .literal(AnsiColor::BrightCyan.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Cyan.on_default()))]
pub struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Option<TopLevel>,
}

#[derive(Subcommand)]
pub enum TopLevel {
    /// Decompiles a .pyc file back to Python source
    Decompile {
        /// Path to the .pyc file
        path: PathBuf,

        /// Name shown in the output header (default: the file name)
        #[arg(long)]
        name: Option<String>,
    },
    /// Dumps the constant tree and bytecode listing of a .pyc file
    Disasm {
        /// Path to the .pyc file
        path: PathBuf,

        /// Name shown in the output header (default: the file name)
        #[arg(long)]
        name: Option<String>,
    },
    /// Generate shell completion
    Completion {
        #[arg(value_enum)]
        shell: Shell,
    },
}
