mod commands;
mod logger;

use std::process;

use anyhow::Result;
use clap::Parser;

use commands::Commands;

#[derive(Parser)]
#[command(name = "git-remoting", about = "Remote transfer tooling for git repositories")]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose protocol tracing on stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Suppress progress output
    #[arg(short, long, global = true)]
    quiet: bool,
}

fn main() {
    let cli = Cli::parse();
    logger::init(cli.verbose, cli.quiet);

    match run(cli) {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("fatal: {e}");
            process::exit(128);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    commands::run(cli)
}
