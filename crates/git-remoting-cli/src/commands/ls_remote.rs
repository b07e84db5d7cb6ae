use std::io::{self, Write};

use anyhow::Result;
use bstr::{BString, ByteSlice};
use clap::Args;
use git_protocol::transport::{self, Transport as _, TransportOptions};
use git_protocol::v2::LsRefsOptions;
use git_transport::GitUrl;

use crate::Cli;

#[derive(Args)]
pub struct LsRemoteArgs {
    /// Limit to branches
    #[arg(long)]
    pub heads: bool,

    /// Limit to tags
    #[arg(long)]
    pub tags: bool,

    /// Ask for the refs a push would see
    #[arg(long)]
    pub for_push: bool,

    /// Show the target of symbolic refs
    #[arg(long)]
    pub symref: bool,

    /// Remote URL
    pub url: String,

    /// Only show refs under these prefixes
    pub patterns: Vec<String>,
}

pub fn run(args: &LsRemoteArgs, _cli: &Cli) -> Result<i32> {
    let url = GitUrl::parse(&args.url)?;
    let mut transport = transport::open(&url, &TransportOptions::default())?;

    let mut prefixes: Vec<BString> = args
        .patterns
        .iter()
        .map(|p| BString::from(p.as_str()))
        .collect();
    if args.heads {
        prefixes.push("refs/heads/".into());
    }
    if args.tags {
        prefixes.push("refs/tags/".into());
    }

    let refs = transport.get_refs(
        args.for_push,
        &LsRefsOptions {
            ref_prefixes: prefixes.clone(),
            symrefs: true,
            peel: true,
        },
    )?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut shown = 0usize;

    for (_, r) in refs.iter() {
        if !prefixes.is_empty()
            && !prefixes
                .iter()
                .any(|p| r.name.starts_with(p.as_bytes()) || &r.name == p)
        {
            continue;
        }
        if args.symref {
            if let Some(ref target) = r.symref_target {
                writeln!(out, "ref: {}\t{}", target, r.name)?;
            }
        }
        writeln!(out, "{}\t{}", r.old_id, r.name)?;
        if let Some(peeled) = r.peeled {
            writeln!(out, "{}\t{}^{{}}", peeled, r.name)?;
        }
        shown += 1;
    }

    transport.disconnect()?;
    // Like ls-remote with patterns: nothing matched is an error
    Ok(if !args.patterns.is_empty() && shown == 0 {
        2
    } else {
        0
    })
}
