//! Kit Runtime - ModelKit Storage and Transfer
//!
//! This crate implements the storage and transfer subsystem behind the
//! kit CLI:
//!
//! - a local content-addressed blob store with per-repository indexes
//! - a remote registry target speaking OCI distribution v2
//! - the concurrent pull engine (chunked, resumable downloads)
//! - the push engine
//! - the typed layer unpacker with filters and parent-chain recursion

pub mod remote;
pub mod repo;
pub mod unpack;

pub use remote::{Registry, RegistryAuth, RemoteBlob, RemoteTarget, SeekableBlob, TransportOptions};
pub use repo::{DownloadConfig, LocalRepo, PullOptions, PushOptions};
pub use unpack::{parse_filter, unpack_modelkit, FilterConf, UnpackOptions};
