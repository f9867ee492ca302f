// src/control/mod.rs

//! Scanner for Debian control-file documents
//!
//! Release manifests, Packages indices and `i18n/Index` files share one
//! RFC822-like syntax:
//!
//! ```text
//! Origin: Ubuntu
//! Description: first line
//!  continuation line
//! SHA256:
//!  3b0c...e1f2  1234 main/binary-amd64/Packages.xz
//! ```
//!
//! [`ControlScanner`] turns a byte stream into [`Item`]s. Hash-list sections
//! (`MD5Sum:`, `SHA1:`, `SHA256:` with an empty value) switch the scanner
//! into a section state where indented `<digest> <size> <path>` lines are
//! emitted as [`HashLine`]s; the first non-indented line is pushed back and
//! re-read as a regular field.
//!
//! Parsing is total: lines that fit no rule are skipped, never fatal.

use crate::hash::HashAlgorithm;
use std::io::{self, BufRead};
use tracing::trace;

/// Marker opening a detached PGP signature in an `InRelease` document
const SIGNATURE_MARKER: &str = "-----BEGIN PGP SIGNATURE";

/// One `Key: Value` field with its continuation lines
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    /// Key as written in the document
    pub name: String,
    /// First-line value, then one line per continuation, joined with `\n`
    pub value: String,
}

impl Field {
    /// Case-insensitive key comparison
    pub fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }

    /// Continuation lines in document order, verbatim
    pub fn continuation_lines(&self) -> impl Iterator<Item = &str> {
        self.value.split('\n').skip(1)
    }
}

/// `<hex-digest> <decimal-size> <relative-path>` entry of a hash section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashLine {
    pub digest: String,
    pub size: u64,
    pub path: String,
}

impl HashLine {
    /// Parse one indented hash-section line
    ///
    /// Returns `None` unless the line holds exactly three tokens with a
    /// decimal size.
    pub fn parse(line: &str) -> Option<Self> {
        let mut tokens = line.split_whitespace();
        let digest = tokens.next()?;
        let size = tokens.next()?.parse().ok()?;
        let path = tokens.next()?;
        if tokens.next().is_some() {
            return None;
        }

        Some(Self {
            digest: digest.to_ascii_lowercase(),
            size,
            path: path.to_string(),
        })
    }
}

/// Unit produced by the scanner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Item {
    Field(Field),
    Hash {
        algorithm: HashAlgorithm,
        line: HashLine,
    },
    /// Armored signature block, verbatim to end of stream
    Signature(String),
    /// Blank line; ends a stanza
    Blank,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    ScanningFields,
    ScanningHashSection(HashAlgorithm),
    Done,
}

/// Line-oriented scanner with one line of pushback
pub struct ControlScanner<R> {
    reader: R,
    pushback: Option<String>,
    state: ScanState,
    seen_content: bool,
}

impl<R: BufRead> ControlScanner<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            pushback: None,
            state: ScanState::ScanningFields,
            seen_content: false,
        }
    }

    /// Next physical line without its terminator; pushback first
    fn next_line(&mut self) -> io::Result<Option<String>> {
        if let Some(line) = self.pushback.take() {
            return Ok(Some(line));
        }

        let mut buf = Vec::new();
        if self.reader.read_until(b'\n', &mut buf)? == 0 {
            return Ok(None);
        }
        while matches!(buf.last(), Some(b'\n' | b'\r')) {
            buf.pop();
        }
        Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
    }

    /// Re-present `line` to the next read
    fn push_back(&mut self, line: String) {
        debug_assert!(self.pushback.is_none(), "only one line of pushback");
        self.pushback = Some(line);
    }

    fn read_to_end(&mut self, mut text: String) -> io::Result<String> {
        while let Some(line) = self.next_line()? {
            text.push('\n');
            text.push_str(&line);
        }
        Ok(text)
    }

    /// Produce the next item, or `None` at end of stream
    pub fn next_item(&mut self) -> io::Result<Option<Item>> {
        loop {
            match self.state {
                ScanState::Done => return Ok(None),
                ScanState::ScanningHashSection(algorithm) => {
                    let Some(line) = self.next_line()? else {
                        self.state = ScanState::Done;
                        return Ok(None);
                    };

                    if line.trim().is_empty() {
                        self.state = ScanState::ScanningFields;
                        return Ok(Some(Item::Blank));
                    }

                    if !starts_with_whitespace(&line) {
                        self.push_back(line);
                        self.state = ScanState::ScanningFields;
                        continue;
                    }

                    match HashLine::parse(&line) {
                        Some(line) => return Ok(Some(Item::Hash { algorithm, line })),
                        None => trace!("Skipping malformed {} line: {:?}", algorithm, line),
                    }
                }
                ScanState::ScanningFields => {
                    let Some(line) = self.next_line()? else {
                        self.state = ScanState::Done;
                        return Ok(None);
                    };

                    if line.trim().is_empty() {
                        return Ok(Some(Item::Blank));
                    }

                    if !self.seen_content && line.trim_start().starts_with('<') {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "document is markup, not a control file",
                        ));
                    }
                    self.seen_content = true;

                    if line.starts_with("-----") {
                        if line.starts_with(SIGNATURE_MARKER) {
                            let signature = self.read_to_end(line)?;
                            self.state = ScanState::Done;
                            return Ok(Some(Item::Signature(signature)));
                        }
                        continue;
                    }

                    if starts_with_whitespace(&line) {
                        trace!("Skipping continuation without a field: {:?}", line);
                        continue;
                    }

                    let Some((key, value)) = line.split_once(':') else {
                        trace!("Skipping line without a key: {:?}", line);
                        continue;
                    };
                    let name = key.trim();
                    if name.is_empty() {
                        continue;
                    }
                    let value = value.trim();

                    if value.is_empty()
                        && let Some(algorithm) = hash_section(name)
                    {
                        self.state = ScanState::ScanningHashSection(algorithm);
                        continue;
                    }

                    let mut value = value.to_string();
                    while let Some(next) = self.next_line()? {
                        if starts_with_whitespace(&next) && !next.trim().is_empty() {
                            value.push('\n');
                            value.push_str(&next);
                        } else {
                            self.push_back(next);
                            break;
                        }
                    }

                    return Ok(Some(Item::Field(Field {
                        name: name.to_string(),
                        value,
                    })));
                }
            }
        }
    }

    /// Collect fields up to the next blank line
    ///
    /// Leading blank lines are skipped; returns `None` once the stream holds
    /// no further fields.
    pub fn next_stanza(&mut self) -> io::Result<Option<Stanza>> {
        let mut fields = Vec::new();

        while let Some(item) = self.next_item()? {
            match item {
                Item::Field(field) => fields.push(field),
                Item::Blank if fields.is_empty() => {}
                Item::Blank => break,
                Item::Signature(_) => break,
                Item::Hash { .. } => {}
            }
        }

        if fields.is_empty() {
            Ok(None)
        } else {
            Ok(Some(Stanza { fields }))
        }
    }

    /// Iterate over blank-line separated stanzas
    pub fn stanzas(self) -> Stanzas<R> {
        Stanzas {
            scanner: self,
            failed: false,
        }
    }
}

impl<R: BufRead> Iterator for ControlScanner<R> {
    type Item = io::Result<Item>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_item() {
            Ok(item) => item.map(Ok),
            Err(e) => {
                self.state = ScanState::Done;
                Some(Err(e))
            }
        }
    }
}

/// One paragraph of fields
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stanza {
    fields: Vec<Field>,
}

impl Stanza {
    /// Value of the first field named `name` (case-insensitive)
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|f| f.is(name))
            .map(|f| f.value.as_str())
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn into_fields(self) -> Vec<Field> {
        self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Iterator over stanzas; stops after the first I/O error
pub struct Stanzas<R> {
    scanner: ControlScanner<R>,
    failed: bool,
}

impl<R: BufRead> Iterator for Stanzas<R> {
    type Item = io::Result<Stanza>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.scanner.next_stanza() {
            Ok(stanza) => stanza.map(Ok),
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

fn starts_with_whitespace(line: &str) -> bool {
    line.starts_with([' ', '\t'])
}

/// Hash-list section introduced by a field name, if any
fn hash_section(name: &str) -> Option<HashAlgorithm> {
    match name.to_ascii_lowercase().as_str() {
        "md5sum" => Some(HashAlgorithm::Md5),
        "sha1" => Some(HashAlgorithm::Sha1),
        "sha256" => Some(HashAlgorithm::Sha256),
        _ => None,
    }
}
