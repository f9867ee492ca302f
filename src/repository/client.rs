// src/repository/client.rs

//! Repository client for Debian metadata
//!
//! Fetches a distribution's manifest and the index files it lists, walking
//! compression variants best-first and resolving by-hash locations.

use super::release::{FileEntry, ReleaseDescriptor, ReleaseIndex};
use super::transport::{ByteStream, Fetched, Transport};
use crate::compression::{BoxedReader, CodecRegistry, extension};
use crate::error::{Error, Result};
use std::io;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio_util::io::SyncIoBridge;
use tracing::{debug, info, warn};

/// Manifest names tried in order under `dists/<dist>/`
pub const RELEASE_FILES: [&str; 2] = ["InRelease", "Release"];

/// A manifest together with the bytes it was parsed from
#[derive(Debug, Clone)]
pub struct FetchedRelease {
    pub index: ReleaseIndex,
    pub raw: Vec<u8>,
    /// `InRelease` or `Release`, whichever resolved
    pub file_name: &'static str,
}

impl FetchedRelease {
    /// Path of the manifest relative to the repository root
    pub fn relative_path(&self) -> String {
        format!("{}/{}", self.index.base(), self.file_name)
    }
}

/// An index file being fetched
pub struct IndexStream {
    /// FileList path the stream was selected for
    pub relative_path: String,
    /// Locator actually fetched (canonical or by-hash)
    pub locator: String,
    pub entry: FileEntry,
    hint: Option<String>,
    fetched: Fetched,
}

impl IndexStream {
    /// Override the codec hint used when the locator has no extension
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Codec identifier: locator extension, then hint, then content type
    pub fn codec_identifier(&self) -> Option<String> {
        extension(&self.locator)
            .map(str::to_string)
            .or_else(|| self.hint.clone())
            .or_else(|| self.fetched.content_type.clone())
    }

    pub fn content_length(&self) -> Option<u64> {
        self.fetched.content_length
    }

    /// Raw bytes as served
    pub fn into_raw(self) -> ByteStream {
        self.fetched.body
    }

    /// Blocking decompressed reader
    ///
    /// Must be called from a blocking context such as
    /// `tokio::task::spawn_blocking`; the bridge drives the async body from
    /// the calling thread.
    pub fn into_decoded(self, codecs: &CodecRegistry) -> io::Result<BoxedReader> {
        let identifier = self.codec_identifier();
        let bridge: BoxedReader = Box::new(SyncIoBridge::new(self.fetched.body));
        codecs.wrap(identifier.as_deref(), bridge)
    }
}

impl std::fmt::Debug for IndexStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexStream")
            .field("relative_path", &self.relative_path)
            .field("locator", &self.locator)
            .field("entry", &self.entry)
            .finish_non_exhaustive()
    }
}

/// Client for one upstream repository
#[derive(Clone)]
pub struct RepositoryClient {
    transport: Arc<dyn Transport>,
    codecs: CodecRegistry,
}

impl RepositoryClient {
    /// Create a client with the default codecs
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_codecs(transport, CodecRegistry::default())
    }

    pub fn with_codecs(transport: Arc<dyn Transport>, codecs: CodecRegistry) -> Self {
        Self { transport, codecs }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn codecs(&self) -> &CodecRegistry {
        &self.codecs
    }

    /// Fetch and parse `dists/<dist>/InRelease`, falling back to `Release`
    ///
    /// Returns `NotFoundError` when neither resolves to a parsable manifest.
    pub async fn fetch_release_descriptor(&self, distribution: &str) -> Result<FetchedRelease> {
        for file_name in RELEASE_FILES {
            let locator = format!("dists/{distribution}/{file_name}");

            let mut fetched = match self.transport.fetch(&locator).await {
                Ok(fetched) => fetched,
                Err(e) if e.is_not_found() => {
                    debug!("{} not available: {}", locator, e);
                    continue;
                }
                Err(e) => {
                    warn!("Failed to fetch {}: {}", locator, e);
                    continue;
                }
            };

            let mut raw = Vec::new();
            if let Err(e) = fetched.body.read_to_end(&mut raw).await {
                warn!("Failed to read {}: {}", locator, e);
                continue;
            }

            match ReleaseDescriptor::from_bytes(&raw) {
                Ok(descriptor) => {
                    info!(
                        "Loaded {} ({} files listed)",
                        locator,
                        descriptor.file_list.len()
                    );
                    return Ok(FetchedRelease {
                        index: ReleaseIndex::new(distribution, descriptor),
                        raw,
                        file_name,
                    });
                }
                Err(e) => warn!("Ignoring unusable {}: {}", locator, e),
            }
        }

        Err(Error::NotFoundError(format!(
            "No InRelease or Release for distribution {distribution}"
        )))
    }

    /// Packages index of a component/architecture
    pub async fn fetch_component_index(
        &self,
        release: &ReleaseIndex,
        component: &str,
        arch: &str,
    ) -> Result<IndexStream> {
        let descriptor = release.descriptor();
        if !descriptor.has_component(component) {
            return Err(Error::NotFoundError(format!(
                "Component {component} not in {}",
                release.distribution()
            )));
        }
        if !descriptor.has_architecture(arch) {
            return Err(Error::NotFoundError(format!(
                "Architecture {arch} not in {}",
                release.distribution()
            )));
        }

        self.fetch_from_file_list(release, &format!("{component}/binary-{arch}/Packages"))
            .await
    }

    /// Contents index of an architecture
    pub async fn fetch_contents_index(
        &self,
        release: &ReleaseIndex,
        arch: &str,
    ) -> Result<IndexStream> {
        if !release.descriptor().has_architecture(arch) {
            return Err(Error::NotFoundError(format!(
                "Architecture {arch} not in {}",
                release.distribution()
            )));
        }

        self.fetch_from_file_list(release, &format!("Contents-{arch}"))
            .await
    }

    /// `i18n/Index` of a component
    pub async fn fetch_translation_index(
        &self,
        release: &ReleaseIndex,
        component: &str,
    ) -> Result<IndexStream> {
        if !release.descriptor().has_component(component) {
            return Err(Error::NotFoundError(format!(
                "Component {component} not in {}",
                release.distribution()
            )));
        }

        self.fetch_from_file_list(release, &format!("{component}/i18n/Index"))
            .await
    }

    /// First candidate under `prefix` that fetches
    async fn fetch_from_file_list(
        &self,
        release: &ReleaseIndex,
        prefix: &str,
    ) -> Result<IndexStream> {
        let candidates = release.ordered_candidates(prefix);
        if candidates.is_empty() {
            return Err(Error::NotFoundError(format!(
                "{} lists no {}",
                release.distribution(),
                prefix
            )));
        }

        for (relative, entry) in candidates {
            match self.fetch_candidate(release, relative, entry).await {
                Ok(stream) => return Ok(stream),
                Err(e) => debug!("Candidate {} failed: {}", relative, e),
            }
        }

        Err(Error::NotFoundError(format!(
            "No variant of {}/{} could be fetched",
            release.base(),
            prefix
        )))
    }

    /// Fetch one FileList path, resolving by-hash when available
    pub async fn fetch_candidate(
        &self,
        release: &ReleaseIndex,
        relative: &str,
        entry: &FileEntry,
    ) -> Result<IndexStream> {
        let locator = release
            .resolve_location(self.transport.as_ref(), relative)
            .await;
        let fetched = self.transport.fetch(&locator).await?;
        debug!("Fetching {} from {}", relative, locator);

        Ok(IndexStream {
            relative_path: relative.to_string(),
            hint: extension(relative).map(str::to_string),
            locator,
            entry: entry.clone(),
            fetched,
        })
    }
}
