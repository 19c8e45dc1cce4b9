//! `kit tag` command — create a tag that refers to an existing ModelKit.

use clap::Args;

use kitops_core::{KitError, ModelReference, Result};

#[derive(Args)]
pub struct TagArgs {
    /// Source ModelKit reference
    pub source: String,

    /// Target reference (new tag)
    pub target: String,
}

pub async fn execute(args: TagArgs) -> Result<()> {
    let source = ModelReference::parse(&args.source)?;
    let target = ModelReference::parse(&args.target)?;
    let Some(target_tag) = target.tag.clone() else {
        return Err(KitError::InvalidReference(format!(
            "'{}': target must carry a tag",
            args.target
        )));
    };

    let source_repo = super::open_repo(&source)?;
    let desc = source_repo.resolve(&source.reference()).await?;

    // Tagging across repositories shares the manifest blob; only the
    // target's index changes.
    let target_repo = super::open_repo(&target)?;
    target_repo.register_manifest(&desc).await?;
    target_repo.tag(&desc, &target_tag).await?;

    println!("{target}");
    Ok(())
}
