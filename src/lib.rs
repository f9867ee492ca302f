// src/lib.rs

//! Debian repository mirroring engine
//!
//! Mirrors one or more distributions of an APT repository into a local tree
//! that apt clients can use directly.
//!
//! # Architecture
//!
//! - Control files: one scanner for Release, Packages and i18n/Index documents
//! - Release-driven: every index is located and verified through the manifest
//! - by-hash aware: content-addressed index paths are preferred when published
//! - Bounded concurrency: one semaphore gates every transfer
//! - Crash-safe: files land via temp + rename, the manifest is committed last
//!
//! # Example
//!
//! ```no_run
//! use debmirror::{Mirror, MirrorConfig};
//!
//! # async fn run() -> debmirror::Result<()> {
//! let mut config = MirrorConfig::new("http://deb.debian.org/debian", "/srv/mirror/debian");
//! config.distributions = vec!["bookworm".to_string()];
//!
//! let summary = Mirror::new(config)?.run().await?;
//! println!("{} files fetched", summary.transfers.fetched);
//! # Ok(())
//! # }
//! ```

pub mod compression;
pub mod config;
pub mod control;
mod error;
pub mod filesystem;
pub mod hash;
pub mod mirror;
pub mod repository;

pub use config::{CheckMode, MirrorConfig};
pub use error::{Error, Result};
pub use hash::HashAlgorithm;
pub use mirror::{DistOutcome, Mirror, MirrorStats, RunSummary};
pub use repository::{
    HttpTransport, LocalTransport, PackageRecord, ReleaseDescriptor, ReleaseIndex,
    RepositoryClient, Transport,
};
