//! CLI command definitions and dispatch.

mod list;
mod pull;
mod push;
mod remove;
mod tag;
mod unpack;
mod version;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use kitops_core::config::{config_home, storage_path};
use kitops_core::progress::LogProgress;
use kitops_core::{ModelReference, Progress, Result};
use kitops_runtime::{LocalRepo, Registry, RegistryAuth, TransportOptions};

/// kit — package, version, and ship ModelKits.
#[derive(Parser)]
#[command(name = "kit", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Pull a ModelKit from a registry
    Pull(pull::PullArgs),
    /// Push a ModelKit to a registry
    Push(push::PushArgs),
    /// Unpack a ModelKit's contents to a directory
    Unpack(unpack::UnpackArgs),
    /// List local ModelKits, or a remote repository's tags
    List(list::ListArgs),
    /// Create a tag that refers to an existing ModelKit
    Tag(tag::TagArgs),
    /// Remove ModelKits from local storage
    Remove(remove::RemoveArgs),
    /// Show version information
    Version(version::VersionArgs),
}

/// Registry connection flags shared by networked commands.
#[derive(Args)]
pub struct NetworkArgs {
    /// Use plain HTTP for the registry connection
    #[arg(long)]
    pub plain_http: bool,

    /// Skip TLS certificate verification
    #[arg(long)]
    pub insecure: bool,

    /// Proxy URL for registry connections
    #[arg(long)]
    pub proxy: Option<String>,
}

impl NetworkArgs {
    fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            tls_verify: !self.insecure,
            plain_http: self.plain_http,
            client_cert_pem: None,
            proxy: self.proxy.clone(),
        }
    }
}

/// Root of the local blob storage (~/.kitops/storage).
pub(crate) fn storage_root() -> PathBuf {
    storage_path(&config_home())
}

/// Open the local repository for a parsed reference.
pub(crate) fn open_repo(reference: &ModelReference) -> Result<LocalRepo> {
    LocalRepo::open(&storage_root(), &reference.repo_name())
}

/// Build a registry client for a parsed reference.
pub(crate) fn open_registry(
    reference: &ModelReference,
    network: &NetworkArgs,
) -> Result<Registry> {
    Registry::new(
        &reference.registry,
        &reference.repository,
        RegistryAuth::from_env(),
        &network.transport_options(),
    )
}

/// Progress sink used by the transfer commands.
pub(crate) fn progress() -> Arc<dyn Progress> {
    Arc::new(LogProgress)
}

/// Cancellation token wired to Ctrl-C.
pub(crate) fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let handle = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            handle.cancel();
        }
    });
    token
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Pull(args) => pull::execute(args).await,
        Command::Push(args) => push::execute(args).await,
        Command::Unpack(args) => unpack::execute(args).await,
        Command::List(args) => list::execute(args).await,
        Command::Tag(args) => tag::execute(args).await,
        Command::Remove(args) => remove::execute(args).await,
        Command::Version(args) => version::execute(args).await,
    }
}
