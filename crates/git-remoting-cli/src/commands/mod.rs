mod bundle_info;
mod ls_remote;

use anyhow::Result;
use clap::Subcommand;

use crate::Cli;

#[derive(Subcommand)]
pub enum Commands {
    /// List references advertised by a remote repository
    LsRemote(ls_remote::LsRemoteArgs),
    /// Show the header of a bundle file
    BundleInfo(bundle_info::BundleInfoArgs),
}

pub fn run(cli: Cli) -> Result<i32> {
    match &cli.command {
        Commands::LsRemote(args) => ls_remote::run(args, &cli),
        Commands::BundleInfo(args) => bundle_info::run(args, &cli),
    }
}
