// src/repository/package.rs

//! Binary package records from `Packages` indices

use super::release::FileEntry;
use crate::control::{ControlScanner, Stanza, Stanzas};
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::io::BufRead;

/// One stanza of a `Packages` index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageRecord {
    pub name: String,
    pub architecture: Option<String>,
    pub version: Option<String>,
    /// Path of the `.deb` relative to the repository root
    pub filename: String,
    pub size: u64,
    pub md5: Option<String>,
    pub sha1: Option<String>,
    pub sha256: Option<String>,
    /// Every other field, keyed by lowercase name, value verbatim
    pub extra: BTreeMap<String, String>,
}

impl PackageRecord {
    /// Build a record from a stanza
    ///
    /// Returns `Ok(None)` for a stanza without `Package`, which ends the
    /// index for record consumers. A stanza naming a package but lacking a
    /// usable `Filename` or `Size` is a `ParseError`.
    pub fn from_stanza(stanza: Stanza) -> Result<Option<Self>> {
        let Some(name) = stanza.get("package").map(str::to_string) else {
            return Ok(None);
        };

        let mut architecture = None;
        let mut version = None;
        let mut filename = None;
        let mut size = None;
        let mut md5 = None;
        let mut sha1 = None;
        let mut sha256 = None;
        let mut extra: BTreeMap<String, String> = BTreeMap::new();

        for field in stanza.into_fields() {
            let key = field.name.to_ascii_lowercase();
            let value = field.value;
            match key.as_str() {
                "package" => {}
                "architecture" => architecture = Some(value),
                "version" => version = Some(value),
                "filename" => filename = Some(value.trim().to_string()),
                "size" => size = Some(value),
                "md5sum" => md5 = Some(value.to_ascii_lowercase()),
                "sha1" => sha1 = Some(value.to_ascii_lowercase()),
                "sha256" => sha256 = Some(value.to_ascii_lowercase()),
                _ => {
                    extra
                        .entry(key)
                        .and_modify(|existing| {
                            existing.push('\n');
                            existing.push_str(&value);
                        })
                        .or_insert(value);
                }
            }
        }

        let filename = filename
            .filter(|f| !f.is_empty())
            .ok_or_else(|| Error::ParseError(format!("Package {name} has no Filename")))?;
        let size = size
            .as_deref()
            .map(str::trim)
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(|| Error::ParseError(format!("Package {name} has no valid Size")))?;

        Ok(Some(Self {
            name,
            architecture,
            version,
            filename,
            size,
            md5,
            sha1,
            sha256,
            extra,
        }))
    }

    /// Expected size and digests of the package file
    pub fn file_entry(&self) -> FileEntry {
        FileEntry {
            size: self.size,
            md5: self.md5.clone(),
            sha1: self.sha1.clone(),
            sha256: self.sha256.clone(),
        }
    }
}

/// Lazy iterator over the records of a `Packages` index
///
/// Yields `Err(ParseError)` for an individual malformed stanza and keeps
/// going; an I/O error (including a failing decompressor) ends iteration.
pub struct PackageReader<R> {
    stanzas: Stanzas<R>,
    done: bool,
}

impl<R: BufRead> PackageReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            stanzas: ControlScanner::new(reader).stanzas(),
            done: false,
        }
    }
}

impl<R: BufRead> Iterator for PackageReader<R> {
    type Item = Result<PackageRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        match self.stanzas.next()? {
            Ok(stanza) => match PackageRecord::from_stanza(stanza) {
                Ok(Some(record)) => Some(Ok(record)),
                Ok(None) => {
                    self.done = true;
                    None
                }
                Err(e) => Some(Err(e)),
            },
            Err(e) => {
                self.done = true;
                Some(Err(Error::IoError(format!("Failed to read package index: {e}"))))
            }
        }
    }
}
