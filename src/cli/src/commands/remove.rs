//! `kit remove` command — remove ModelKits from local storage.

use clap::Args;

use kitops_core::{ModelReference, Result};

#[derive(Args)]
pub struct RemoveArgs {
    /// ModelKit references to remove
    #[arg(required = true)]
    pub modelkits: Vec<String>,

    /// Ignore references that are not present
    #[arg(short, long)]
    pub force: bool,
}

pub async fn execute(args: RemoveArgs) -> Result<()> {
    for raw in &args.modelkits {
        let reference = ModelReference::parse(raw)?;
        let repo = super::open_repo(&reference)?;
        let result = async {
            let desc = repo.resolve(&reference.reference()).await?;
            repo.delete(&desc).await
        }
        .await;
        match result {
            Ok(()) => println!("Removed {raw}"),
            Err(e) if args.force => {
                tracing::debug!("skipping {raw}: {e}");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
