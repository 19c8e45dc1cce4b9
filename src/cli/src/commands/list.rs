//! `kit list` command.

use clap::Args;

use kitops_core::{ModelReference, Result};
use kitops_runtime::remote::RemoteTarget as _;
use kitops_runtime::repo::all_repo_indexes;
use kitops_runtime::LocalRepo;

use crate::output;

#[derive(Args)]
pub struct ListArgs {
    /// Remote repository to list tags from instead of local storage
    pub remote: Option<String>,

    /// Only show references (one per line)
    #[arg(short, long)]
    pub quiet: bool,

    #[command(flatten)]
    pub network: super::NetworkArgs,
}

pub async fn execute(args: ListArgs) -> Result<()> {
    match &args.remote {
        Some(remote) => list_remote(remote, &args).await,
        None => list_local(&args).await,
    }
}

async fn list_remote(remote: &str, args: &ListArgs) -> Result<()> {
    let reference = ModelReference::parse(remote)?;
    let registry = super::open_registry(&reference, &args.network)?;

    let mut cursor = None;
    loop {
        let page = registry.tags_page(cursor).await?;
        for tag in &page.tags {
            if args.quiet {
                println!("{tag}");
            } else {
                println!("{}:{tag}", reference.repo_name());
            }
        }
        match page.next {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }
    Ok(())
}

async fn list_local(args: &ListArgs) -> Result<()> {
    let storage = super::storage_root();
    let indexes = all_repo_indexes(&storage).unwrap_or_default();

    if args.quiet {
        for index in &indexes {
            let Some(repo) = index.repository() else { continue };
            for manifest in index.manifests() {
                for tag in index.list_tags(manifest) {
                    println!("{repo}:{tag}");
                }
            }
        }
        return Ok(());
    }

    let mut table = output::new_table(&["REPOSITORY", "TAG", "DIGEST", "SIZE"]);
    for index in &indexes {
        let Some(repo_name) = index.repository() else { continue };
        let repo = LocalRepo::open(&storage, repo_name)?;
        for manifest_desc in index.manifests() {
            // Size is the sum of the kit's config and layer blobs
            let size = match repo.get_manifest(manifest_desc).await {
                Ok(manifest) => {
                    manifest.config.size
                        + manifest.layers.iter().map(|l| l.size).sum::<u64>()
                }
                Err(_) => 0,
            };
            let tags = index.list_tags(manifest_desc);
            let tags = if tags.is_empty() {
                vec!["<none>".to_string()]
            } else {
                tags
            };
            for tag in tags {
                table.add_row(&[
                    repo_name.to_string(),
                    tag,
                    output::short_digest(&manifest_desc.digest),
                    output::format_bytes(size),
                ]);
            }
        }
    }
    println!("{table}");
    Ok(())
}
