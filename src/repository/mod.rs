// src/repository/mod.rs

//! Debian repository access
//!
//! This module provides functionality for:
//! - Reading Release manifests and resolving by-hash locations
//! - Streaming Packages, Contents and Translation indices
//! - Fetching from HTTP mirrors or local trees through one [`Transport`] trait

mod client;
mod contents;
mod package;
mod release;
mod transport;

pub use client::{FetchedRelease, IndexStream, RELEASE_FILES, RepositoryClient};
pub use contents::{ContentsEntry, ContentsReader, read_translation_index};
pub use package::{PackageReader, PackageRecord};
pub use release::{
    FileEntry, FileList, ReleaseDescriptor, ReleaseIndex, compression_rank, merge_hash_line,
    parse_release_date,
};
pub use transport::{
    ByteStream, Fetched, HttpTransport, LocalTransport, Transport, transport_for,
};
