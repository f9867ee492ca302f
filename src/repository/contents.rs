// src/repository/contents.rs

//! Readers for `Contents-<arch>` and `i18n/Index` documents

use super::release::{FileList, merge_hash_line};
use crate::control::{ControlScanner, Item};
use crate::error::{Error, Result};
use std::io::{self, BufRead};

/// One line of a Contents index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentsEntry {
    /// Installed file path, without leading slash
    pub file: String,
    /// Comma-separated `section/package` list
    pub location: String,
}

/// Iterator over `(file, location)` pairs of a Contents index
///
/// The last whitespace-separated token of a line is the location; the text
/// before it is the file path, which may itself contain spaces. Lines
/// without both parts are skipped.
pub struct ContentsReader<R> {
    reader: R,
    line: Vec<u8>,
}

impl<R: BufRead> ContentsReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: Vec::new(),
        }
    }
}

impl<R: BufRead> Iterator for ContentsReader<R> {
    type Item = io::Result<ContentsEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.line.clear();
            match self.reader.read_until(b'\n', &mut self.line) {
                Ok(0) => return None,
                Ok(_) => {}
                Err(e) => return Some(Err(e)),
            }

            let line = String::from_utf8_lossy(&self.line);
            let line = line.trim();
            let Some(split) = line.rfind(char::is_whitespace) else {
                continue;
            };

            let file = line[..split].trim_end();
            let location = line[split..].trim_start();
            if file.is_empty() || location.is_empty() {
                continue;
            }

            return Some(Ok(ContentsEntry {
                file: file.to_string(),
                location: location.to_string(),
            }));
        }
    }
}

/// Parse a `<component>/i18n/Index` document
///
/// Keys are relative to the `i18n/` directory (`Translation-en.bz2`).
pub fn read_translation_index<R: BufRead>(reader: R) -> Result<FileList> {
    let mut files = FileList::new();

    for item in ControlScanner::new(reader) {
        let item =
            item.map_err(|e| Error::ParseError(format!("Failed to read translation index: {e}")))?;
        if let Item::Hash { algorithm, line } = item {
            merge_hash_line(&mut files, algorithm, line);
        }
    }

    Ok(files)
}
