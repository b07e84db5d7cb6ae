use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use git_protocol::bundle;

use crate::Cli;

#[derive(Args)]
pub struct BundleInfoArgs {
    /// Bundle file to inspect
    pub path: PathBuf,
}

pub fn run(args: &BundleInfoArgs, _cli: &Cli) -> Result<i32> {
    let bundle = bundle::read_bundle(&args.path)?;

    let stdout = io::stdout();
    let mut out = stdout.lock();

    writeln!(out, "version: {}", bundle.version)?;
    writeln!(out, "object-format: {}", bundle.object_format)?;
    for (id, comment) in &bundle.prerequisites {
        match comment {
            Some(c) => writeln!(out, "requires: {} {}", id, c)?,
            None => writeln!(out, "requires: {}", id)?,
        }
    }
    for (id, name) in &bundle.refs {
        writeln!(out, "{}\t{}", id, name)?;
    }
    writeln!(out, "pack: {} bytes", bundle.pack_data.len())?;
    Ok(0)
}
