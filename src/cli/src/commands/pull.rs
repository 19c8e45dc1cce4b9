//! `kit pull` command.

use std::sync::Arc;

use clap::Args;

use kitops_core::{ModelReference, Result};
use kitops_runtime::PullOptions;

#[derive(Args)]
pub struct PullArgs {
    /// ModelKit reference (e.g. "registry.example.com/org/model:1.0")
    pub modelkit: String,

    /// Maximum concurrent layer downloads
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Suppress the final summary line
    #[arg(short, long)]
    pub quiet: bool,

    #[command(flatten)]
    pub network: super::NetworkArgs,
}

pub async fn execute(args: PullArgs) -> Result<()> {
    let reference = ModelReference::parse(&args.modelkit)?;
    let repo = super::open_repo(&reference)?;
    let registry = Arc::new(super::open_registry(&reference, &args.network)?);

    let desc = repo
        .pull_model(
            registry,
            &reference,
            PullOptions {
                concurrency: args.concurrency,
                download: None,
            },
            super::progress(),
            super::cancel_on_ctrl_c(),
        )
        .await?;

    if args.quiet {
        println!("{}", desc.digest);
    } else {
        println!("Pulled {reference} ({})", desc.digest);
    }
    Ok(())
}
