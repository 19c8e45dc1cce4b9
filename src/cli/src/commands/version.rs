//! `kit version` command.

use clap::Args;

use kitops_core::Result;

#[derive(Args)]
pub struct VersionArgs;

pub async fn execute(_args: VersionArgs) -> Result<()> {
    println!("kit version {}", kitops_core::VERSION);
    Ok(())
}
