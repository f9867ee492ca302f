// src/compression/mod.rs
//! Index decompression
//!
//! Repository indices come as `.xz`, `.gz`, `.bz2`, `.lzma` or plain files.
//! The codec is picked from the file extension, or from a MIME type when the
//! locator has none (by-hash paths). [`CodecRegistry`] maps both kinds of
//! identifier to a decoder constructor so new codecs can be registered
//! without touching the callers.

use std::collections::HashMap;
use std::io::{self, Read};
use thiserror::Error;

/// Boxed blocking reader handed to decoders and returned by them
pub type BoxedReader = Box<dyn Read + Send>;

/// Constructor wrapping a raw reader in a decoding reader
pub type DecoderFactory = fn(BoxedReader) -> io::Result<BoxedReader>;

/// Compression-related errors
#[derive(Error, Debug)]
pub enum CompressionError {
    #[error("Failed to create {format} decoder: {source}")]
    DecoderCreation {
        format: &'static str,
        source: io::Error,
    },

    #[error("Unsupported compression format: {0}")]
    UnsupportedFormat(String),
}

/// Compression formats found in Debian repositories
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionFormat {
    /// No compression (raw data)
    None,
    /// Gzip compression (.gz)
    Gzip,
    /// XZ compression (.xz)
    Xz,
    /// Bzip2 compression (.bz2)
    Bzip2,
    /// Legacy LZMA-alone compression (.lzma)
    Lzma,
}

impl CompressionFormat {
    /// Detect compression format from the extension of a path
    ///
    /// # Examples
    /// ```
    /// use debmirror::compression::CompressionFormat;
    ///
    /// assert_eq!(CompressionFormat::from_extension("main/binary-amd64/Packages.xz"), CompressionFormat::Xz);
    /// assert_eq!(CompressionFormat::from_extension("Contents-amd64.gz"), CompressionFormat::Gzip);
    /// assert_eq!(CompressionFormat::from_extension("main/i18n/Index"), CompressionFormat::None);
    /// ```
    pub fn from_extension(path: &str) -> Self {
        match extension(path) {
            Some(".gz") => Self::Gzip,
            Some(".xz") => Self::Xz,
            Some(".bz2") => Self::Bzip2,
            Some(".lzma") => Self::Lzma,
            _ => Self::None,
        }
    }

    /// Detect compression format from a MIME type such as a Content-Type header
    pub fn from_mime(mime: &str) -> Self {
        // Content-Type may carry parameters: "application/gzip; charset=binary"
        let essence = mime.split(';').next().unwrap_or("").trim();
        match essence.to_ascii_lowercase().as_str() {
            "application/gzip" | "application/x-gzip" => Self::Gzip,
            "application/x-xz" => Self::Xz,
            "application/x-bzip2" => Self::Bzip2,
            "application/x-lzma" => Self::Lzma,
            _ => Self::None,
        }
    }

    /// Get the file extension for this format
    pub fn extension(&self) -> &'static str {
        match self {
            Self::None => "",
            Self::Gzip => ".gz",
            Self::Xz => ".xz",
            Self::Bzip2 => ".bz2",
            Self::Lzma => ".lzma",
        }
    }

    /// Get a human-readable name for this format
    pub fn name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Gzip => "gzip",
            Self::Xz => "xz",
            Self::Bzip2 => "bzip2",
            Self::Lzma => "lzma",
        }
    }
}

impl std::fmt::Display for CompressionFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Extension of the last path segment, including the dot
///
/// ```
/// use debmirror::compression::extension;
///
/// assert_eq!(extension("dists/focal/main/binary-amd64/Packages.gz"), Some(".gz"));
/// assert_eq!(extension("dists/focal.d/Release"), None);
/// ```
pub fn extension(path: &str) -> Option<&str> {
    let name = path.rsplit('/').next().unwrap_or(path);
    match name.rfind('.') {
        Some(0) | None => None,
        Some(idx) => Some(&name[idx..]),
    }
}

/// Create a decompressing reader for the given format
///
/// For `CompressionFormat::None` the reader is returned unchanged.
pub fn create_decoder(
    reader: BoxedReader,
    format: CompressionFormat,
) -> Result<BoxedReader, CompressionError> {
    match format {
        CompressionFormat::None => Ok(reader),
        CompressionFormat::Gzip => Ok(Box::new(flate2::read::MultiGzDecoder::new(reader))),
        CompressionFormat::Xz => Ok(Box::new(liblzma::read::XzDecoder::new(reader))),
        CompressionFormat::Bzip2 => Ok(Box::new(bzip2::read::BzDecoder::new(reader))),
        CompressionFormat::Lzma => {
            let stream = liblzma::stream::Stream::new_lzma_decoder(u64::MAX).map_err(|e| {
                CompressionError::DecoderCreation {
                    format: "lzma",
                    source: io::Error::other(e),
                }
            })?;
            Ok(Box::new(liblzma::read::XzDecoder::new_stream(reader, stream)))
        }
    }
}

/// Open mapping from codec identifier (extension or MIME type) to decoder
#[derive(Clone)]
pub struct CodecRegistry {
    decoders: HashMap<String, DecoderFactory>,
}

impl CodecRegistry {
    /// Registry without any codec; every lookup passes data through
    pub fn empty() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    /// Register (or replace) the decoder for an identifier
    pub fn register(&mut self, identifier: &str, factory: DecoderFactory) {
        self.decoders
            .insert(identifier.to_ascii_lowercase(), factory);
    }

    /// Whether an identifier maps to a decoder
    pub fn supports(&self, identifier: &str) -> bool {
        self.lookup(identifier).is_some()
    }

    fn lookup(&self, identifier: &str) -> Option<DecoderFactory> {
        let essence = identifier.split(';').next().unwrap_or("").trim();
        self.decoders.get(&essence.to_ascii_lowercase()).copied()
    }

    /// Wrap `reader` with the decoder registered for `identifier`
    ///
    /// Unknown identifiers pass the reader through untouched; a plain
    /// `text/plain` or `application/octet-stream` response is not an error.
    pub fn wrap(&self, identifier: Option<&str>, reader: BoxedReader) -> io::Result<BoxedReader> {
        match identifier.and_then(|id| self.lookup(id)) {
            Some(factory) => factory(reader),
            None => Ok(reader),
        }
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        fn gzip(r: BoxedReader) -> io::Result<BoxedReader> {
            create_decoder(r, CompressionFormat::Gzip).map_err(io::Error::other)
        }
        fn xz(r: BoxedReader) -> io::Result<BoxedReader> {
            create_decoder(r, CompressionFormat::Xz).map_err(io::Error::other)
        }
        fn bzip2(r: BoxedReader) -> io::Result<BoxedReader> {
            create_decoder(r, CompressionFormat::Bzip2).map_err(io::Error::other)
        }
        fn lzma(r: BoxedReader) -> io::Result<BoxedReader> {
            create_decoder(r, CompressionFormat::Lzma).map_err(io::Error::other)
        }

        let mut registry = Self::empty();
        for id in [".gz", "application/gzip", "application/x-gzip"] {
            registry.register(id, gzip);
        }
        for id in [".xz", "application/x-xz"] {
            registry.register(id, xz);
        }
        for id in [".bz2", "application/x-bzip2"] {
            registry.register(id, bzip2);
        }
        for id in [".lzma", "application/x-lzma"] {
            registry.register(id, lzma);
        }
        registry
    }
}
