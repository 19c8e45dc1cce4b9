//! `kit unpack` command.

use std::path::PathBuf;

use clap::Args;

use kitops_core::{ModelReference, Result};
use kitops_runtime::{parse_filter, unpack_modelkit, UnpackOptions};

#[derive(Args)]
pub struct UnpackArgs {
    /// ModelKit reference to unpack
    pub modelkit: String,

    /// Directory to unpack into (defaults to the current directory)
    #[arg(short, long)]
    pub dir: Option<PathBuf>,

    /// Limit unpacking to selected content, e.g. "model" or
    /// "datasets:train". May be repeated; empty means everything.
    #[arg(long = "filter")]
    pub filters: Vec<String>,

    /// Overwrite existing files
    #[arg(short, long)]
    pub overwrite: bool,

    /// Leave existing files in place instead of failing
    #[arg(long)]
    pub ignore_existing: bool,
}

pub async fn execute(args: UnpackArgs) -> Result<()> {
    let model_ref = ModelReference::parse(&args.modelkit)?;
    let unpack_dir = match args.dir {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };
    let filters = args
        .filters
        .iter()
        .map(|f| parse_filter(f))
        .collect::<Result<Vec<_>>>()?;

    let options = UnpackOptions {
        model_ref,
        unpack_dir: unpack_dir.clone(),
        filters,
        overwrite: args.overwrite,
        ignore_existing: args.ignore_existing,
    };
    unpack_modelkit(&super::storage_root(), &options, super::progress()).await?;

    println!("Unpacked {} to {}", args.modelkit, unpack_dir.display());
    Ok(())
}
