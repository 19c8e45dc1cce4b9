//! `kit push` command.

use std::sync::Arc;

use clap::Args;

use kitops_core::{ModelReference, Result};
use kitops_runtime::PushOptions;

#[derive(Args)]
pub struct PushArgs {
    /// ModelKit reference (e.g. "registry.example.com/org/model:1.0")
    pub modelkit: String,

    /// Maximum concurrent blob uploads (overrides KITOPS_UPLOAD_CONCURRENCY)
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Suppress the final summary line
    #[arg(short, long)]
    pub quiet: bool,

    #[command(flatten)]
    pub network: super::NetworkArgs,
}

pub async fn execute(args: PushArgs) -> Result<()> {
    let reference = ModelReference::parse(&args.modelkit)?;
    let repo = super::open_repo(&reference)?;
    let registry = Arc::new(super::open_registry(&reference, &args.network)?);

    let desc = repo
        .push_model(
            registry,
            &reference,
            PushOptions {
                concurrency: args.concurrency,
            },
            super::progress(),
            super::cancel_on_ctrl_c(),
        )
        .await?;

    if args.quiet {
        println!("{}", desc.digest);
    } else {
        println!("Pushed {reference} ({})", desc.digest);
    }
    Ok(())
}
