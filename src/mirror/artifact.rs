// src/mirror/artifact.rs
//! Per-artifact transfer state machine
//!
//! ```text
//! PENDING -> CHECK_LOCAL -> UP_TO_DATE
//!                        -> NEEDS_FETCH -> FETCHING -> VERIFYING -> VERIFIED
//!                                                 |             -> CORRUPT
//!                                                 -> FAILED
//! ```
//!
//! Downloads stream into `<dest>.partial` and are renamed onto the
//! destination, so an interrupted transfer never leaves a truncated file
//! under the final name. Corrupt files are reported and kept.

use super::pacing::{Pacer, copy_paced};
use crate::config::CheckMode;
use crate::error::{Error, Result};
use crate::filesystem::{ensure_parent, path::partial_path};
use crate::hash::{HashAlgorithm, digest_matches, hash_file};
use crate::repository::{FileEntry, Transport};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::AsyncRead;
use tracing::{debug, error, trace, warn};

/// Lifecycle of one artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactState {
    Pending,
    CheckLocal,
    UpToDate,
    NeedsFetch,
    Fetching,
    Verifying,
    Verified,
    Corrupt,
    Failed,
}

impl ArtifactState {
    /// Whether the local file now matches its metadata
    pub fn is_current(&self) -> bool {
        matches!(self, Self::UpToDate | Self::Verified)
    }
}

/// One file to bring into the mirror
#[derive(Debug, Clone)]
pub struct MirrorJob {
    /// Transport locator (canonical or by-hash)
    pub locator: String,
    pub dest: PathBuf,
    pub expected: FileEntry,
}

/// Comparison applied to a local file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Check {
    Size(u64),
    Digest {
        algorithm: HashAlgorithm,
        expected: String,
        size: u64,
    },
}

/// Pick the comparison for an entry under a mode
///
/// Digest modes use the requested digest, falling back SHA256, SHA1, MD5
/// and finally size when the entry lacks it.
pub fn select_check(entry: &FileEntry, mode: CheckMode) -> Check {
    let Some(requested) = mode.algorithm() else {
        return Check::Size(entry.size);
    };

    std::iter::once(requested)
        .chain(HashAlgorithm::PREFERENCE)
        .find_map(|algorithm| {
            entry.digest(algorithm).map(|digest| Check::Digest {
                algorithm,
                expected: digest.to_string(),
                size: entry.size,
            })
        })
        .unwrap_or(Check::Size(entry.size))
}

/// Blocking comparison of a local file; a missing file does not match
pub fn file_matches(path: &Path, check: &Check) -> io::Result<bool> {
    let metadata = match std::fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    if !metadata.is_file() {
        return Ok(false);
    }

    match check {
        Check::Size(size) => Ok(metadata.len() == *size),
        Check::Digest {
            algorithm,
            expected,
            size,
        } => {
            // A length mismatch settles it without reading the file
            if metadata.len() != *size {
                return Ok(false);
            }
            let actual = hash_file(*algorithm, path)?;
            trace!("{} {} of {}", algorithm, actual, path.display());
            Ok(digest_matches(&actual, expected))
        }
    }
}

/// Blocking verification of a downloaded file
///
/// Unlike [`file_matches`], a mismatch is an error carrying what was
/// expected and what was found.
pub fn verify_file(path: &Path, check: &Check) -> Result<()> {
    let io_error = |e: io::Error| Error::IoError(format!("Failed to check {}: {e}", path.display()));
    let len = std::fs::metadata(path).map_err(io_error)?.len();

    let (algorithm, expected, size) = match check {
        Check::Size(size) => (None, None, *size),
        Check::Digest {
            algorithm,
            expected,
            size,
        } => (Some(*algorithm), Some(expected), *size),
    };

    if len != size {
        return Err(Error::ChecksumMismatch {
            expected: format!("{size} bytes"),
            actual: format!("{len} bytes"),
        });
    }

    if let (Some(algorithm), Some(expected)) = (algorithm, expected) {
        let actual = hash_file(algorithm, path).map_err(io_error)?;
        if !digest_matches(&actual, expected) {
            return Err(Error::ChecksumMismatch {
                expected: format!("{algorithm} {expected}"),
                actual: format!("{algorithm} {actual}"),
            });
        }
    }
    Ok(())
}

/// Compare a local file against its metadata off the async runtime
pub async fn check_local(path: &Path, entry: &FileEntry, mode: CheckMode) -> Result<bool> {
    let check = select_check(entry, mode);
    let path = path.to_path_buf();

    tokio::task::spawn_blocking(move || {
        file_matches(&path, &check)
            .map_err(|e| Error::IoError(format!("Failed to check {}: {e}", path.display())))
    })
    .await
    .map_err(|e| Error::IoError(format!("Check task failed: {e}")))?
}

/// Verify a freshly stored file off the async runtime
pub async fn verify_local(path: &Path, entry: &FileEntry, mode: CheckMode) -> Result<()> {
    let check = select_check(entry, mode);
    let path = path.to_path_buf();

    tokio::task::spawn_blocking(move || verify_file(&path, &check))
        .await
        .map_err(|e| Error::IoError(format!("Verify task failed: {e}")))?
}

/// Fetch `locator` and store it at `dest`
///
/// Returns the number of bytes written.
pub async fn download(
    transport: &dyn Transport,
    locator: &str,
    dest: &Path,
    pacer: Option<&Pacer>,
) -> Result<u64> {
    let mut fetched = transport.fetch(locator).await?;
    store_stream(&mut fetched.body, dest, pacer)
        .await
        .map_err(|e| match e {
            Error::DownloadError(msg) => Error::DownloadError(format!("{locator}: {msg}")),
            other => other,
        })
}

/// Stream `body` into `dest` via a `.partial` sibling
///
/// The destination only ever holds a complete transfer; a failed copy
/// removes the partial file.
pub async fn store_stream<R>(body: &mut R, dest: &Path, pacer: Option<&Pacer>) -> Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
{
    ensure_parent(dest).await?;

    let temp_path = partial_path(dest);
    let mut file = tokio::fs::File::create(&temp_path).await.map_err(|e| {
        Error::IoError(format!("Failed to create {}: {e}", temp_path.display()))
    })?;

    let copied = match copy_paced(body, &mut file, pacer).await {
        Ok(copied) => copied,
        Err(e) => {
            drop(file);
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(Error::DownloadError(format!("transfer failed: {e}")));
        }
    };
    drop(file);

    tokio::fs::rename(&temp_path, dest).await.map_err(|e| {
        Error::IoError(format!(
            "Failed to move {} to {}: {e}",
            temp_path.display(),
            dest.display()
        ))
    })?;

    Ok(copied)
}

/// Copy a verified file to its content-addressed location
///
/// An existing copy of the same length is left alone.
pub async fn publish_copy(src: &Path, dest: &Path) -> Result<()> {
    if let (Ok(source), Ok(existing)) =
        (tokio::fs::metadata(src).await, tokio::fs::metadata(dest).await)
        && source.len() == existing.len()
    {
        return Ok(());
    }

    ensure_parent(dest).await?;
    let temp_path = partial_path(dest);
    tokio::fs::copy(src, &temp_path).await.map_err(|e| {
        Error::IoError(format!("Failed to copy {}: {e}", src.display()))
    })?;
    tokio::fs::rename(&temp_path, dest).await.map_err(|e| {
        Error::IoError(format!("Failed to publish {}: {e}", dest.display()))
    })?;

    trace!("Published {}", dest.display());
    Ok(())
}

/// Outcome counters across all artifacts of a run
#[derive(Debug, Default)]
pub struct TransferCounters {
    up_to_date: AtomicU64,
    fetched: AtomicU64,
    corrupt: AtomicU64,
    failed: AtomicU64,
    bytes: AtomicU64,
}

/// Copy of [`TransferCounters`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferSummary {
    pub up_to_date: u64,
    /// Downloaded and verified
    pub fetched: u64,
    pub corrupt: u64,
    pub failed: u64,
    /// Bytes downloaded, corrupt files included
    pub bytes: u64,
}

impl TransferCounters {
    pub fn record(&self, state: ArtifactState) {
        let counter = match state {
            ArtifactState::UpToDate => &self.up_to_date,
            ArtifactState::Verified => &self.fetched,
            ArtifactState::Corrupt => &self.corrupt,
            ArtifactState::Failed => &self.failed,
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bytes(&self, bytes: u64) {
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn summary(&self) -> TransferSummary {
        TransferSummary {
            up_to_date: self.up_to_date.load(Ordering::Relaxed),
            fetched: self.fetched.load(Ordering::Relaxed),
            corrupt: self.corrupt.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
        }
    }
}

/// What every artifact worker needs
pub struct TransferContext {
    pub transport: Arc<dyn Transport>,
    pub mode: CheckMode,
    pub pacer: Option<Arc<Pacer>>,
    pub counters: TransferCounters,
}

impl TransferContext {
    pub fn new(transport: Arc<dyn Transport>, mode: CheckMode, pacer: Option<Pacer>) -> Self {
        Self {
            transport,
            mode,
            pacer: pacer.map(Arc::new),
            counters: TransferCounters::default(),
        }
    }

    /// Drive one artifact to a terminal state and count it
    pub async fn process(&self, job: &MirrorJob) -> ArtifactState {
        let state = self.run(job).await;
        self.counters.record(state);
        state
    }

    async fn run(&self, job: &MirrorJob) -> ArtifactState {
        let mut state = ArtifactState::Pending;
        loop {
            trace!("{} {:?}", job.locator, state);
            state = match state {
                ArtifactState::Pending => ArtifactState::CheckLocal,
                ArtifactState::CheckLocal => {
                    match check_local(&job.dest, &job.expected, self.mode).await {
                        Ok(true) => ArtifactState::UpToDate,
                        Ok(false) => ArtifactState::NeedsFetch,
                        Err(e) => {
                            warn!("{}", e);
                            ArtifactState::NeedsFetch
                        }
                    }
                }
                ArtifactState::NeedsFetch => ArtifactState::Fetching,
                ArtifactState::Fetching => {
                    match download(
                        self.transport.as_ref(),
                        &job.locator,
                        &job.dest,
                        self.pacer.as_deref(),
                    )
                    .await
                    {
                        Ok(bytes) => {
                            debug!("Fetched {} ({} bytes)", job.locator, bytes);
                            self.counters.record_bytes(bytes);
                            ArtifactState::Verifying
                        }
                        Err(e) if e.is_not_found() => {
                            warn!("Missing upstream: {}", e);
                            ArtifactState::Failed
                        }
                        Err(e) => {
                            error!("Failed to fetch {}: {}", job.locator, e);
                            ArtifactState::Failed
                        }
                    }
                }
                ArtifactState::Verifying => {
                    match verify_local(&job.dest, &job.expected, self.mode).await {
                        Ok(()) => ArtifactState::Verified,
                        Err(e) => {
                            error!("[Corrupt] {}: {}", job.dest.display(), e);
                            ArtifactState::Corrupt
                        }
                    }
                }
                terminal => return terminal,
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash_bytes;
    use crate::repository::LocalTransport;

    fn entry_for(data: &[u8]) -> FileEntry {
        FileEntry {
            size: data.len() as u64,
            md5: Some(hash_bytes(HashAlgorithm::Md5, data)),
            sha1: None,
            sha256: Some(hash_bytes(HashAlgorithm::Sha256, data)),
        }
    }

    #[test]
    fn test_select_check_cascade() {
        let entry = entry_for(b"abc");

        assert_eq!(select_check(&entry, CheckMode::Size), Check::Size(3));
        assert_eq!(select_check(&entry, CheckMode::ReleaseDate), Check::Size(3));
        assert!(matches!(
            select_check(&entry, CheckMode::Md5),
            Check::Digest { algorithm: HashAlgorithm::Md5, .. }
        ));
        // SHA1 absent: strongest available wins
        assert!(matches!(
            select_check(&entry, CheckMode::Sha1),
            Check::Digest { algorithm: HashAlgorithm::Sha256, .. }
        ));
        assert_eq!(select_check(&FileEntry::new(9), CheckMode::Sha256), Check::Size(9));
    }

    #[test]
    fn test_verify_file_reports_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"abc").unwrap();

        verify_file(&path, &select_check(&entry_for(b"abc"), CheckMode::Sha256)).unwrap();

        match verify_file(&path, &Check::Size(5)) {
            Err(Error::ChecksumMismatch { expected, actual }) => {
                assert_eq!(expected, "5 bytes");
                assert_eq!(actual, "3 bytes");
            }
            other => panic!("expected size mismatch, got {other:?}"),
        }
        let err = verify_file(&path, &select_check(&entry_for(b"abd"), CheckMode::Md5)).unwrap_err();
        assert!(matches!(err, Error::ChecksumMismatch { .. }));
        assert!(matches!(
            verify_file(&dir.path().join("missing"), &Check::Size(0)),
            Err(Error::IoError(_))
        ));
    }

    #[test]
    fn test_file_matches() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"abc").unwrap();
        let entry = entry_for(b"abc");

        assert!(file_matches(&path, &select_check(&entry, CheckMode::Sha256)).unwrap());
        assert!(file_matches(&path, &Check::Size(3)).unwrap());
        assert!(!file_matches(&path, &Check::Size(4)).unwrap());
        assert!(!file_matches(&dir.path().join("missing"), &Check::Size(0)).unwrap());

        // Same length, different content
        let other = entry_for(b"abd");
        assert!(!file_matches(&path, &select_check(&other, CheckMode::Md5)).unwrap());
        assert!(file_matches(&path, &select_check(&other, CheckMode::Size)).unwrap());
    }

    fn context(upstream: &Path, mode: CheckMode) -> TransferContext {
        TransferContext::new(Arc::new(LocalTransport::new(upstream)), mode, None)
    }

    #[tokio::test]
    async fn test_process_fetches_then_up_to_date() {
        let upstream = tempfile::tempdir().unwrap();
        let mirror = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(upstream.path().join("pool")).unwrap();
        std::fs::write(upstream.path().join("pool/a.deb"), b"payload").unwrap();

        let ctx = context(upstream.path(), CheckMode::Sha256);
        let job = MirrorJob {
            locator: "pool/a.deb".to_string(),
            dest: mirror.path().join("pool/a.deb"),
            expected: entry_for(b"payload"),
        };

        assert_eq!(ctx.process(&job).await, ArtifactState::Verified);
        assert_eq!(std::fs::read(&job.dest).unwrap(), b"payload");
        assert!(!partial_path(&job.dest).exists());

        assert_eq!(ctx.process(&job).await, ArtifactState::UpToDate);
        let summary = ctx.counters.summary();
        assert_eq!(summary.fetched, 1);
        assert_eq!(summary.up_to_date, 1);
        assert_eq!(summary.bytes, 7);
    }

    #[tokio::test]
    async fn test_size_mismatch_is_corrupt_and_kept() {
        let upstream = tempfile::tempdir().unwrap();
        let mirror = tempfile::tempdir().unwrap();
        std::fs::write(upstream.path().join("b.deb"), b"twelve bytes").unwrap();

        let ctx = context(upstream.path(), CheckMode::Size);
        let job = MirrorJob {
            locator: "b.deb".to_string(),
            dest: mirror.path().join("b.deb"),
            expected: FileEntry::new(10),
        };

        assert_eq!(ctx.process(&job).await, ArtifactState::Corrupt);
        assert_eq!(std::fs::read(&job.dest).unwrap(), b"twelve bytes");
        assert_eq!(ctx.counters.summary().corrupt, 1);
    }

    #[tokio::test]
    async fn test_publish_copy() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("Packages.xz");
        let dest = dir.path().join("by-hash/SHA256/abc");
        std::fs::write(&src, b"index").unwrap();

        publish_copy(&src, &dest).await.unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"index");
        // Second publication is a no-op
        publish_copy(&src, &dest).await.unwrap();
        assert!(!partial_path(&dest).exists());
    }

    #[tokio::test]
    async fn test_missing_upstream_fails() {
        let upstream = tempfile::tempdir().unwrap();
        let mirror = tempfile::tempdir().unwrap();

        let ctx = context(upstream.path(), CheckMode::Size);
        let job = MirrorJob {
            locator: "gone.deb".to_string(),
            dest: mirror.path().join("gone.deb"),
            expected: FileEntry::new(1),
        };

        assert_eq!(ctx.process(&job).await, ArtifactState::Failed);
        assert!(!job.dest.exists());
        assert_eq!(ctx.counters.summary().failed, 1);
    }
}
