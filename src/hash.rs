// src/hash.rs

//! Digest computation for repository integrity checks
//!
//! Debian repositories publish three digests per file:
//!
//! | Algorithm | Release section | by-hash directory |
//! |-----------|-----------------|-------------------|
//! | MD5       | `MD5Sum`        | `MD5Sum`          |
//! | SHA-1     | `SHA1`          | `SHA1`            |
//! | SHA-256   | `SHA256`        | `SHA256`          |
//!
//! Digests are compared as lowercase hex strings.

use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::str::FromStr;

/// Read buffer used when hashing files
const HASH_BUFFER_SIZE: usize = 16 * 1024;

/// Digest algorithm published in Debian metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashAlgorithm {
    Md5,
    Sha1,
    Sha256,
}

impl HashAlgorithm {
    /// Strongest first; the order used for by-hash probing and verification fallback
    pub const PREFERENCE: [HashAlgorithm; 3] = [Self::Sha256, Self::Sha1, Self::Md5];

    /// Directory name used under `by-hash/`
    #[inline]
    pub const fn by_hash_dir(&self) -> &'static str {
        match self {
            Self::Md5 => "MD5Sum",
            Self::Sha1 => "SHA1",
            Self::Sha256 => "SHA256",
        }
    }

    #[inline]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Md5 => "md5",
            Self::Sha1 => "sha1",
            Self::Sha256 => "sha256",
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for HashAlgorithm {
    type Err = String;

    /// Accepts both the algorithm names and the Release section headers
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "md5" | "md5sum" => Ok(Self::Md5),
            "sha1" | "sha-1" => Ok(Self::Sha1),
            "sha256" | "sha-256" => Ok(Self::Sha256),
            _ => Err(format!("unknown hash algorithm: {s}")),
        }
    }
}

/// Incremental hasher over any supported algorithm
pub struct Hasher {
    state: HasherState,
}

enum HasherState {
    Md5(Md5),
    Sha1(Sha1),
    Sha256(Sha256),
}

impl Hasher {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        let state = match algorithm {
            HashAlgorithm::Md5 => HasherState::Md5(Md5::new()),
            HashAlgorithm::Sha1 => HasherState::Sha1(Sha1::new()),
            HashAlgorithm::Sha256 => HasherState::Sha256(Sha256::new()),
        };
        Self { state }
    }

    pub fn update(&mut self, data: &[u8]) {
        match &mut self.state {
            HasherState::Md5(h) => h.update(data),
            HasherState::Sha1(h) => h.update(data),
            HasherState::Sha256(h) => h.update(data),
        }
    }

    /// Finalize into a lowercase hex digest
    pub fn finalize(self) -> String {
        match self.state {
            HasherState::Md5(h) => format!("{:x}", h.finalize()),
            HasherState::Sha1(h) => format!("{:x}", h.finalize()),
            HasherState::Sha256(h) => format!("{:x}", h.finalize()),
        }
    }
}

/// Compute the digest of a byte slice
pub fn hash_bytes(algorithm: HashAlgorithm, data: &[u8]) -> String {
    let mut hasher = Hasher::new(algorithm);
    hasher.update(data);
    hasher.finalize()
}

/// Compute the digest of everything a reader yields
pub fn hash_reader<R: Read>(algorithm: HashAlgorithm, reader: &mut R) -> io::Result<String> {
    let mut hasher = Hasher::new(algorithm);
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];

    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hasher.finalize())
}

/// Compute the digest of a file, streaming it from disk
pub fn hash_file(algorithm: HashAlgorithm, path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    hash_reader(algorithm, &mut file)
}

/// Compare a computed digest against a published one
#[inline]
pub fn digest_matches(actual: &str, expected: &str) -> bool {
    actual.eq_ignore_ascii_case(expected.trim())
}
