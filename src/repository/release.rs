// src/repository/release.rs

//! Release manifest model
//!
//! A distribution's `InRelease`/`Release` document describes the suite and
//! lists every index file under `dists/<dist>/` with its size and digests.
//! [`ReleaseDescriptor`] is the parsed document; [`ReleaseIndex`] pairs it
//! with the distribution base and knows how to locate index files, including
//! the content-addressed `by-hash/` variants.

use super::transport::Transport;
use crate::control::{ControlScanner, HashLine, Item};
use crate::error::{Error, Result};
use crate::hash::HashAlgorithm;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::BufRead;
use tracing::{debug, trace};

/// Size and digests of one file listed in a manifest
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md5: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha1: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

impl FileEntry {
    pub fn new(size: u64) -> Self {
        Self {
            size,
            ..Default::default()
        }
    }

    /// Digest published for `algorithm`, if any
    pub fn digest(&self, algorithm: HashAlgorithm) -> Option<&str> {
        match algorithm {
            HashAlgorithm::Md5 => self.md5.as_deref(),
            HashAlgorithm::Sha1 => self.sha1.as_deref(),
            HashAlgorithm::Sha256 => self.sha256.as_deref(),
        }
    }

    pub fn set_digest(&mut self, algorithm: HashAlgorithm, digest: String) {
        let slot = match algorithm {
            HashAlgorithm::Md5 => &mut self.md5,
            HashAlgorithm::Sha1 => &mut self.sha1,
            HashAlgorithm::Sha256 => &mut self.sha256,
        };
        *slot = Some(digest);
    }
}

/// Relative path -> entry, in lexical path order
pub type FileList = BTreeMap<String, FileEntry>;

/// Merge one hash-section line into a file list
///
/// The first sighting of a path creates its entry; later sections fill in
/// their digest on the same entry.
pub fn merge_hash_line(list: &mut FileList, algorithm: HashAlgorithm, line: HashLine) {
    let entry = list
        .entry(line.path)
        .or_insert_with(|| FileEntry::new(line.size));
    if entry.size != line.size {
        trace!(
            "Conflicting sizes for one path across hash sections: {} vs {}",
            entry.size, line.size
        );
    }
    entry.set_digest(algorithm, line.digest);
}

/// Parsed `InRelease`/`Release` document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseDescriptor {
    pub origin: Option<String>,
    pub label: Option<String>,
    pub suite: Option<String>,
    pub version: Option<String>,
    pub codename: Option<String>,
    /// Publication date; the Unix epoch when missing or unparsable
    pub date: DateTime<Utc>,
    pub architectures: Vec<String>,
    pub components: Vec<String>,
    pub description: Option<String>,
    pub acquire_by_hash: bool,
    pub file_list: FileList,
    /// Unrecognized fields keyed by lowercase name, newline-joined on repetition
    pub extra: BTreeMap<String, String>,
    /// Armored signature block of an `InRelease` document, verbatim
    pub signature: Option<String>,
}

impl Default for ReleaseDescriptor {
    fn default() -> Self {
        Self {
            origin: None,
            label: None,
            suite: None,
            version: None,
            codename: None,
            date: DateTime::UNIX_EPOCH,
            architectures: Vec::new(),
            components: Vec::new(),
            description: None,
            acquire_by_hash: false,
            file_list: FileList::new(),
            extra: BTreeMap::new(),
            signature: None,
        }
    }
}

impl ReleaseDescriptor {
    /// Parse a manifest from a reader
    pub fn parse<R: BufRead>(reader: R) -> Result<Self> {
        let mut release = Self::default();
        let mut scanner = ControlScanner::new(reader);

        while let Some(item) = scanner
            .next_item()
            .map_err(|e| Error::ParseError(format!("Failed to read Release: {e}")))?
        {
            match item {
                Item::Field(field) => release.apply_field(&field.name, field.value),
                Item::Hash { algorithm, line } => {
                    merge_hash_line(&mut release.file_list, algorithm, line)
                }
                Item::Signature(block) => release.signature = Some(block),
                Item::Blank => {}
            }
        }

        debug!(
            "Parsed Release: suite={:?} codename={:?} {} files",
            release.suite,
            release.codename,
            release.file_list.len()
        );
        Ok(release)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Self::parse(data)
    }

    fn apply_field(&mut self, name: &str, value: String) {
        let key = name.to_ascii_lowercase();
        match key.as_str() {
            "origin" => self.origin = Some(value),
            "label" => self.label = Some(value),
            "suite" => self.suite = Some(value),
            "version" => self.version = Some(value),
            "codename" => self.codename = Some(value),
            "date" => self.date = parse_release_date(&value).unwrap_or(DateTime::UNIX_EPOCH),
            "architectures" => self.architectures = split_list(&value),
            "components" => self.components = split_list(&value),
            "description" => self.description = Some(value),
            "acquire-by-hash" => self.acquire_by_hash = value.eq_ignore_ascii_case("yes"),
            _ => {
                self.extra
                    .entry(key)
                    .and_modify(|existing| {
                        existing.push('\n');
                        existing.push_str(&value);
                    })
                    .or_insert(value);
            }
        }
    }

    /// Whether the date field held a usable value
    pub fn date_known(&self) -> bool {
        self.date != DateTime::UNIX_EPOCH
    }

    pub fn has_architecture(&self, arch: &str) -> bool {
        self.architectures.iter().any(|a| a == arch)
    }

    pub fn has_component(&self, component: &str) -> bool {
        self.components.iter().any(|c| c == component)
    }
}

fn split_list(value: &str) -> Vec<String> {
    value.split_whitespace().map(str::to_string).collect()
}

/// Parse a manifest date such as `Thu, 23 Apr 2020 17:33:17 UTC`
///
/// Named UTC zones are normalized to `+0000` before RFC 2822 parsing;
/// returns `None` when the value cannot be understood.
pub fn parse_release_date(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    let normalized = ["UTC", "GMT", "Z"]
        .iter()
        .find_map(|zone| value.strip_suffix(zone))
        .map(|rest| format!("{} +0000", rest.trim_end()))
        .unwrap_or_else(|| value.to_string());

    if let Ok(date) = DateTime::parse_from_rfc2822(&normalized) {
        return Some(date.with_timezone(&Utc));
    }

    NaiveDateTime::parse_from_str(value, "%a, %d %b %Y %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Rank of a file for candidate ordering: `.xz`, `.gz`, `.bz2`, plain, others
pub fn compression_rank(path: &str) -> usize {
    match crate::compression::extension(path) {
        Some(".xz") => 0,
        Some(".gz") => 1,
        Some(".bz2") => 2,
        None => 3,
        Some(_) => 4,
    }
}

/// A distribution's manifest bound to its location in the repository
#[derive(Debug, Clone)]
pub struct ReleaseIndex {
    distribution: String,
    base: String,
    descriptor: ReleaseDescriptor,
}

impl ReleaseIndex {
    pub fn new(distribution: &str, descriptor: ReleaseDescriptor) -> Self {
        Self {
            distribution: distribution.to_string(),
            base: format!("dists/{distribution}"),
            descriptor,
        }
    }

    pub fn distribution(&self) -> &str {
        &self.distribution
    }

    /// `dists/<dist>`
    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn descriptor(&self) -> &ReleaseDescriptor {
        &self.descriptor
    }

    pub fn file_list(&self) -> &FileList {
        &self.descriptor.file_list
    }

    /// Repository locator of a FileList path
    pub fn locator(&self, relative: &str) -> String {
        format!("{}/{}", self.base, relative.trim_start_matches('/'))
    }

    /// Content-addressed sibling of `relative`, relative to the distribution
    ///
    /// `main/binary-amd64/Packages.xz` with SHA256 becomes
    /// `main/binary-amd64/by-hash/SHA256/<digest>`. Returns `None` when the
    /// FileList carries no such digest.
    pub fn by_hash_path(&self, relative: &str, algorithm: HashAlgorithm) -> Option<String> {
        let digest = self.descriptor.file_list.get(relative)?.digest(algorithm)?;
        let dir = match relative.rfind('/') {
            Some(idx) => &relative[..=idx],
            None => "",
        };
        Some(format!("{dir}by-hash/{}/{digest}", algorithm.by_hash_dir()))
    }

    /// Locator to fetch `relative` from
    ///
    /// With Acquire-By-Hash on a remote transport, the by-hash variants are
    /// checked strongest digest first; the first one that exists wins. Any
    /// other case, including failed lookups, yields the canonical locator.
    pub async fn resolve_location(&self, transport: &dyn Transport, relative: &str) -> String {
        if self.descriptor.acquire_by_hash
            && transport.is_remote()
            && self.descriptor.file_list.contains_key(relative)
        {
            for algorithm in HashAlgorithm::PREFERENCE {
                let Some(path) = self.by_hash_path(relative, algorithm) else {
                    continue;
                };
                let locator = self.locator(&path);
                if transport.exists(&locator).await {
                    trace!("Resolved {} to {}", relative, locator);
                    return locator;
                }
            }
            debug!("No by-hash variant of {} found, using canonical path", relative);
        }

        self.locator(relative)
    }

    /// FileList entries under `prefix`, best compression first
    ///
    /// Order is `.xz`, `.gz`, `.bz2`, uncompressed, then unknown extensions;
    /// ties keep lexical path order.
    pub fn ordered_candidates(&self, prefix: &str) -> Vec<(&str, &FileEntry)> {
        let mut candidates: Vec<(&str, &FileEntry)> = self
            .descriptor
            .file_list
            .range(prefix.to_string()..)
            .take_while(|(path, _)| path.starts_with(prefix))
            .map(|(path, entry)| (path.as_str(), entry))
            .collect();

        // Stable sort keeps the BTreeMap's lexical order among equal ranks
        candidates.sort_by_key(|(path, _)| compression_rank(path));
        candidates
    }
}
