//! Local repository storage and transfer engines.

mod download;
mod index;
mod pull;
mod push;
mod store;

pub use download::DownloadConfig;
pub use index::{all_repo_indexes, ManifestIndex, TAGS_ANNOTATION};
pub use pull::PullOptions;
pub use push::{default_upload_concurrency, PushOptions};
pub use store::{all_repos_with_tags, blob_path, LocalRepo};
