// src/mirror/mod.rs

//! Mirroring engine
//!
//! Distributions are processed one after another. For each one:
//!
//! 1. Fetch `InRelease`/`Release`; a missing manifest skips the distribution
//! 2. In `release-date` mode, skip when the cached manifest has the same date
//! 3. Mirror Contents indices
//! 4. Mirror Translation files, then those listed only in the mirrored
//!    `i18n/Index`
//! 5. Per (architecture, component): obtain the Packages index, parse it on
//!    a blocking worker and dispatch one transfer per pool file; a file
//!    listed by several architectures is transferred once
//! 6. Commit the manifest into the cache
//!
//! Each stage is joined before the next starts, and the manifest is only
//! committed once everything it describes is in place, so a crash or a
//! cancellation means the next run re-checks the whole distribution.
//!
//! Transfers run as tokio tasks bounded by one semaphore; the dispatcher
//! takes a permit before spawning, which is what throttles parsing.

mod artifact;
mod pacing;
mod stats;

pub use artifact::{
    ArtifactState, Check, MirrorJob, TransferContext, TransferCounters, TransferSummary,
    check_local, download, file_matches, publish_copy, select_check, store_stream, verify_file,
    verify_local,
};
pub use pacing::{Pacer, copy_paced};
pub use stats::{
    ComponentSnapshot, ComponentStats, DistSnapshot, FLUSH_INTERVAL, MirrorStats, RepoSnapshot,
    STATE_FILE_NAME, StatsWriter, format_bytes, format_runtime,
};

use crate::compression::{CodecRegistry, extension};
use crate::config::{CheckMode, MirrorConfig};
use crate::error::{Error, Result};
use crate::filesystem::{ensure_parent, path::safe_join, write_atomic};
use crate::hash::HashAlgorithm;
use crate::repository::{
    FileEntry, FileList, PackageReader, PackageRecord, ReleaseDescriptor, ReleaseIndex,
    RepositoryClient, Transport, read_translation_index, transport_for,
};
use std::collections::HashSet;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, info, info_span, warn};

/// Parsed records buffered between the parser and the dispatcher
const PARSE_QUEUE_DEPTH: usize = 256;

/// How a distribution run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DistOutcome {
    /// Every stage ran and the manifest was committed
    Mirrored,
    /// Cached manifest has the same date (`release-date` mode)
    UpToDate,
    /// No manifest upstream
    NotFound,
    /// Stopped by cancellation; manifest not committed
    Cancelled,
    /// Local I/O failure
    Aborted(String),
}

/// Result of [`Mirror::run`]
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub distributions: Vec<(String, DistOutcome)>,
    pub transfers: TransferSummary,
    pub runtime: Duration,
}

impl RunSummary {
    pub fn outcome(&self, dist: &str) -> Option<&DistOutcome> {
        self.distributions
            .iter()
            .find(|(name, _)| name == dist)
            .map(|(_, outcome)| outcome)
    }

    /// Whether any distribution was abandoned on a local failure
    pub fn has_aborted(&self) -> bool {
        self.distributions
            .iter()
            .any(|(_, outcome)| matches!(outcome, DistOutcome::Aborted(_)))
    }
}

/// What happens once a transfer task reaches a terminal state
enum Completion {
    Index { by_hash: Option<PathBuf> },
    Package(Arc<ComponentStats>),
}

/// State shared with transfer tasks
struct Shared {
    transfer: TransferContext,
    stats: Arc<MirrorStats>,
    writer: StatsWriter,
    gate: Arc<Semaphore>,
}

impl Shared {
    async fn complete(&self, job: MirrorJob, completion: Completion) {
        let state = self.transfer.process(&job).await;

        match completion {
            Completion::Index { by_hash: Some(by_hash) } if state.is_current() => {
                if let Err(e) = publish_copy(&job.dest, &by_hash).await {
                    warn!("{}", e);
                }
            }
            Completion::Index { .. } => {}
            Completion::Package(component) => {
                component.record(job.expected.size);
                self.writer.maybe_flush(&self.stats).await;
            }
        }
    }
}

/// Mirrors the configured distributions of one upstream repository
pub struct Mirror {
    config: MirrorConfig,
    client: RepositoryClient,
    shared: Arc<Shared>,
    cancel: CancellationToken,
}

impl Mirror {
    /// Create a mirror for `config.source`
    pub fn new(config: MirrorConfig) -> Result<Self> {
        config.validate()?;
        let transport = transport_for(&config.source)?;
        Self::with_transport(config, transport)
    }

    /// Create a mirror over an explicit transport
    pub fn with_transport(config: MirrorConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        Self::with_parts(config, transport, CodecRegistry::default())
    }

    pub fn with_parts(
        config: MirrorConfig,
        transport: Arc<dyn Transport>,
        codecs: CodecRegistry,
    ) -> Result<Self> {
        config.validate()?;

        let pacer = Pacer::from_mbits(config.bandwidth_limit);
        let shared = Shared {
            transfer: TransferContext::new(Arc::clone(&transport), config.check_mode, pacer),
            stats: Arc::new(MirrorStats::new()),
            writer: StatsWriter::new(&config.cache_path),
            gate: Arc::new(Semaphore::new(config.concurrency_width())),
        };

        Ok(Self {
            client: RepositoryClient::with_codecs(transport, codecs),
            config,
            shared: Arc::new(shared),
            cancel: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &MirrorConfig {
        &self.config
    }

    /// Token that stops dispatching new transfers when cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn stats(&self) -> Arc<MirrorStats> {
        Arc::clone(&self.shared.stats)
    }

    fn cache_root(&self) -> &Path {
        &self.config.cache_path
    }

    /// Mirror every configured distribution
    ///
    /// Per-artifact failures are counted, not returned. Errors are reserved
    /// for an unusable cache root and a failed final state-file write.
    pub async fn run(&self) -> Result<RunSummary> {
        tokio::fs::create_dir_all(self.cache_root())
            .await
            .map_err(|e| {
                Error::IoError(format!(
                    "Failed to create cache root {}: {e}",
                    self.cache_root().display()
                ))
            })?;

        info!(
            "Mirroring {} into {} (check mode {}, {} transfers)",
            self.client.transport().name(),
            self.cache_root().display(),
            self.config.check_mode,
            self.config.concurrency_width()
        );

        let previous = self.shared.writer.load_previous();
        let mut summary = RunSummary::default();

        for dist in &self.config.distributions {
            if self.cancel.is_cancelled() {
                summary
                    .distributions
                    .push((dist.clone(), DistOutcome::Cancelled));
                continue;
            }

            let span = info_span!("dist", name = %dist);
            let outcome = match self
                .mirror_distribution(dist, previous.as_ref())
                .instrument(span)
                .await
            {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("Aborting {}: {}", dist, e);
                    DistOutcome::Aborted(e.to_string())
                }
            };
            summary.distributions.push((dist.clone(), outcome));
        }

        self.shared.writer.flush(&self.shared.stats, false).await?;

        summary.transfers = self.shared.transfer.counters.summary();
        summary.runtime = self.shared.stats.elapsed();
        info!(
            "Done in {}: {} fetched ({}), {} up to date, {} corrupt, {} failed",
            format_runtime(summary.runtime),
            summary.transfers.fetched,
            format_bytes(summary.transfers.bytes),
            summary.transfers.up_to_date,
            summary.transfers.corrupt,
            summary.transfers.failed
        );

        Ok(summary)
    }

    async fn mirror_distribution(
        &self,
        dist: &str,
        previous: Option<&RepoSnapshot>,
    ) -> Result<DistOutcome> {
        let fetched = match self.client.fetch_release_descriptor(dist).await {
            Ok(fetched) => fetched,
            Err(e) if e.is_not_found() => {
                error!("Distribution not found: {}", e);
                return Ok(DistOutcome::NotFound);
            }
            Err(e) => return Err(e),
        };

        let release = &fetched.index;
        let descriptor = release.descriptor();
        let release_path = safe_join(self.cache_root(), fetched.relative_path())?;
        ensure_parent(&release_path).await?;
        self.shared.stats.set_release_date(dist, descriptor.date);

        if self.config.check_mode == CheckMode::ReleaseDate
            && cached_release_matches(&release_path, descriptor).await
        {
            info!("{} unchanged since {}, skipping", dist, descriptor.date);
            if let Some(previous) = previous.and_then(|p| p.dists.get(dist)) {
                self.shared.stats.restore(dist, previous);
            }
            return Ok(DistOutcome::UpToDate);
        }

        info!("Updating {} (Release dated {})", dist, descriptor.date);
        let architectures = self.architectures(descriptor);
        let components = descriptor.components.clone();
        let mut tasks = JoinSet::new();

        // Contents
        let mut prefixes: Vec<String> = architectures
            .iter()
            .map(|arch| format!("Contents-{arch}"))
            .collect();
        for component in &components {
            prefixes.extend(
                architectures
                    .iter()
                    .map(|arch| format!("{component}/Contents-{arch}")),
            );
        }
        for prefix in &prefixes {
            for (relative, entry) in release.ordered_candidates(prefix) {
                self.dispatch_index(&mut tasks, release, relative, entry.clone())
                    .await;
            }
        }
        drain(&mut tasks).instrument(info_span!("contents")).await;

        // Translations
        for component in &components {
            for (relative, entry) in release.ordered_candidates(&format!("{component}/i18n/")) {
                self.dispatch_index(&mut tasks, release, relative, entry.clone())
                    .await;
            }
        }
        drain(&mut tasks).instrument(info_span!("translations")).await;
        for component in &components {
            self.dispatch_unlisted_translations(&mut tasks, release, component)
                .await;
        }
        drain(&mut tasks).instrument(info_span!("translations")).await;

        // Packages; `all` packages share one pool file across architectures
        let mut queued = HashSet::new();
        for arch in &architectures {
            for component in &components {
                if self.cancel.is_cancelled() {
                    break;
                }

                let counters = self.shared.stats.component(dist, component);
                let span = info_span!("packages", %component, %arch);
                match self
                    .mirror_packages(&mut tasks, &mut queued, release, component, arch, counters)
                    .instrument(span)
                    .await
                {
                    Ok(dispatched) => {
                        info!("{}/{}: {} packages queued", component, arch, dispatched)
                    }
                    Err(e @ Error::IoError(_)) => {
                        drain(&mut tasks).await;
                        return Err(e);
                    }
                    Err(e) => error!("Can't open package index {}/{}: {}", component, arch, e),
                }
            }
        }
        drain(&mut tasks).await;

        if self.cancel.is_cancelled() {
            warn!("Cancelled; {} not committed", release_path.display());
            return Ok(DistOutcome::Cancelled);
        }

        write_atomic(&release_path, &fetched.raw).await?;
        info!("Committed {}", fetched.relative_path());
        Ok(DistOutcome::Mirrored)
    }

    /// Requested architectures the manifest actually carries
    fn architectures(&self, descriptor: &ReleaseDescriptor) -> Vec<String> {
        match &self.config.architectures {
            None => descriptor.architectures.clone(),
            Some(requested) => requested
                .iter()
                .filter(|arch| {
                    let listed = descriptor.has_architecture(arch);
                    if !listed {
                        warn!("Architecture {} not in Release, skipping", arch);
                    }
                    listed
                })
                .cloned()
                .collect(),
        }
    }

    /// Take a transfer slot and spawn the job; `false` once cancelled
    async fn spawn(
        &self,
        tasks: &mut JoinSet<()>,
        job: MirrorJob,
        completion: Completion,
    ) -> bool {
        let permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return false,
            permit = Arc::clone(&self.shared.gate).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return false,
            },
        };

        let shared = Arc::clone(&self.shared);
        tasks.spawn(
            async move {
                let _permit = permit;
                shared.complete(job, completion).await;
            }
            .instrument(Span::current()),
        );
        true
    }

    /// Queue one FileList path of the distribution
    async fn dispatch_index(
        &self,
        tasks: &mut JoinSet<()>,
        release: &ReleaseIndex,
        relative: &str,
        entry: FileEntry,
    ) -> bool {
        let dest = match safe_join(self.cache_root(), release.locator(relative)) {
            Ok(dest) => dest,
            Err(e) => {
                warn!("Skipping {}: {}", relative, e);
                return true;
            }
        };

        let locator = release
            .resolve_location(self.client.transport().as_ref(), relative)
            .await;
        let job = MirrorJob {
            locator,
            dest,
            expected: entry,
        };
        let by_hash = self.by_hash_dest(release, relative);
        self.spawn(tasks, job, Completion::Index { by_hash }).await
    }

    /// Local by-hash copy location, when the distribution publishes by-hash
    fn by_hash_dest(&self, release: &ReleaseIndex, relative: &str) -> Option<PathBuf> {
        if !release.descriptor().acquire_by_hash {
            return None;
        }
        let path = release.by_hash_path(relative, HashAlgorithm::Sha256)?;
        safe_join(self.cache_root(), release.locator(&path)).ok()
    }

    /// Translation files listed only in the component's mirrored `i18n/Index`
    async fn dispatch_unlisted_translations(
        &self,
        tasks: &mut JoinSet<()>,
        release: &ReleaseIndex,
        component: &str,
    ) {
        let extras = match self.translation_index(release, component).await {
            Ok(extras) => extras,
            Err(e) if e.is_not_found() => {
                debug!("No translation index for {}: {}", component, e);
                return;
            }
            Err(e) => {
                warn!("Unreadable translation index for {}: {}", component, e);
                return;
            }
        };

        for (name, entry) in extras {
            let relative = format!("{component}/i18n/{name}");
            if release.file_list().contains_key(&relative) {
                continue;
            }
            self.dispatch_index(tasks, release, &relative, entry).await;
        }
    }

    /// Read the translation index from the mirror tree
    ///
    /// Only a copy that is current under the check mode is used.
    async fn translation_index(
        &self,
        release: &ReleaseIndex,
        component: &str,
    ) -> Result<FileList> {
        let prefix = format!("{component}/i18n/Index");
        for (relative, entry) in release.ordered_candidates(&prefix) {
            let Ok(path) = safe_join(self.cache_root(), release.locator(relative)) else {
                continue;
            };
            if !check_local(&path, entry, self.config.check_mode)
                .await
                .unwrap_or(false)
            {
                continue;
            }

            let codecs = self.client.codecs().clone();
            let identifier = extension(relative).map(str::to_string);
            return tokio::task::spawn_blocking(move || {
                let file = std::fs::File::open(&path).map_err(|e| {
                    Error::IoError(format!("Failed to open {}: {e}", path.display()))
                })?;
                let reader = codecs
                    .wrap(identifier.as_deref(), Box::new(file))
                    .map_err(|e| {
                        Error::ParseError(format!("Cannot decode translation index: {e}"))
                    })?;
                read_translation_index(BufReader::new(reader))
            })
            .await
            .map_err(|e| Error::ParseError(format!("Translation index task failed: {e}")))?;
        }

        Err(Error::NotFoundError(format!(
            "No current {prefix} in {}",
            release.distribution()
        )))
    }

    /// Mirror one Packages index and queue its packages
    ///
    /// Returns how many package transfers were dispatched. Destinations
    /// already in `queued` are counted but not transferred again.
    async fn mirror_packages(
        &self,
        tasks: &mut JoinSet<()>,
        queued: &mut HashSet<PathBuf>,
        release: &ReleaseIndex,
        component: &str,
        arch: &str,
        counters: Arc<ComponentStats>,
    ) -> Result<usize> {
        let descriptor = release.descriptor();
        if !descriptor.has_component(component) || !descriptor.has_architecture(arch) {
            return Err(Error::NotFoundError(format!(
                "{component}/binary-{arch} not in {}",
                release.distribution()
            )));
        }

        let prefix = format!("{component}/binary-{arch}/Packages");
        let (relative, index_path) = match self.local_package_index(release, &prefix).await {
            Some(found) => found,
            None => self.fetch_package_index(release, component, arch).await?,
        };

        let (tx, mut rx) = mpsc::channel(PARSE_QUEUE_DEPTH);
        let codecs = self.client.codecs().clone();
        let identifier = extension(&relative).map(str::to_string);
        let parser = tokio::task::spawn_blocking(move || {
            parse_packages(&index_path, identifier.as_deref(), &codecs, &tx)
        });

        let mut dispatched = 0;
        while let Some(record) = rx.recv().await {
            let dest = match safe_join(self.cache_root(), &record.filename) {
                Ok(dest) => dest,
                Err(e) => {
                    warn!("Skipping package {}: {}", record.name, e);
                    continue;
                }
            };
            if !queued.insert(dest.clone()) {
                debug!("{} already queued", record.filename);
                counters.record(record.size);
                continue;
            }

            let job = MirrorJob {
                expected: record.file_entry(),
                locator: record.filename,
                dest,
            };
            if !self
                .spawn(tasks, job, Completion::Package(Arc::clone(&counters)))
                .await
            {
                break;
            }
            dispatched += 1;
        }
        drop(rx);

        match parser.await {
            Ok(Ok(parsed)) => debug!("Parsed {} records from {}", parsed, relative),
            Ok(Err(e)) => warn!("Package index {} ended early: {}", relative, e),
            Err(e) => warn!("Parser for {} failed: {}", relative, e),
        }

        Ok(dispatched)
    }

    /// Current local copy of a Packages index, if one matches the manifest
    async fn local_package_index(
        &self,
        release: &ReleaseIndex,
        prefix: &str,
    ) -> Option<(String, PathBuf)> {
        for (relative, entry) in release.ordered_candidates(prefix) {
            let Ok(path) = safe_join(self.cache_root(), release.locator(relative)) else {
                continue;
            };
            if check_local(&path, entry, self.config.check_mode)
                .await
                .unwrap_or(false)
            {
                debug!("Reusing {}", path.display());
                self.shared.transfer.counters.record(ArtifactState::UpToDate);
                self.publish_by_hash(release, relative, &path).await;
                return Some((relative.to_string(), path));
            }
        }
        None
    }

    /// Fetch the best Packages variant into the mirror tree and verify it
    async fn fetch_package_index(
        &self,
        release: &ReleaseIndex,
        component: &str,
        arch: &str,
    ) -> Result<(String, PathBuf)> {
        let stream = self
            .client
            .fetch_component_index(release, component, arch)
            .await?;
        let relative = stream.relative_path.clone();
        let expected = stream.entry.clone();
        let dest = safe_join(self.cache_root(), release.locator(&relative))?;

        let mut body = stream.into_raw();
        let bytes = store_stream(&mut body, &dest, self.shared.transfer.pacer.as_deref()).await?;
        let counters = &self.shared.transfer.counters;
        counters.record_bytes(bytes);

        match verify_local(&dest, &expected, self.config.check_mode).await {
            Ok(()) => {
                counters.record(ArtifactState::Verified);
                self.publish_by_hash(release, &relative, &dest).await;
            }
            Err(e @ Error::IoError(_)) => return Err(e),
            Err(e) => {
                error!("[Corrupt] {}: {}", dest.display(), e);
                counters.record(ArtifactState::Corrupt);
            }
        }

        Ok((relative, dest))
    }

    async fn publish_by_hash(&self, release: &ReleaseIndex, relative: &str, path: &Path) {
        if let Some(by_hash) = self.by_hash_dest(release, relative)
            && let Err(e) = publish_copy(path, &by_hash).await
        {
            warn!("{}", e);
        }
    }
}

/// Whether the cached manifest carries the same known date
async fn cached_release_matches(path: &Path, current: &ReleaseDescriptor) -> bool {
    if !current.date_known() {
        return false;
    }

    let Ok(bytes) = tokio::fs::read(path).await else {
        return false;
    };
    match ReleaseDescriptor::from_bytes(&bytes) {
        Ok(cached) => cached.date_known() && cached.date == current.date,
        Err(e) => {
            debug!("Cached {} unreadable: {}", path.display(), e);
            false
        }
    }
}

/// Join every task of a stage
async fn drain(tasks: &mut JoinSet<()>) {
    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            error!("Transfer task failed: {}", e);
        }
    }
}

/// Blocking parse of a local Packages index, feeding the dispatcher
///
/// Returns the number of records sent. Stops early when the receiver is
/// gone (cancellation).
fn parse_packages(
    path: &Path,
    identifier: Option<&str>,
    codecs: &CodecRegistry,
    tx: &mpsc::Sender<PackageRecord>,
) -> Result<usize> {
    let file = std::fs::File::open(path)
        .map_err(|e| Error::IoError(format!("Failed to open {}: {e}", path.display())))?;
    let reader = codecs
        .wrap(identifier, Box::new(file))
        .map_err(|e| Error::ParseError(format!("Cannot decode {}: {e}", path.display())))?;

    let mut sent = 0;
    for record in PackageReader::new(BufReader::new(reader)) {
        match record {
            Ok(record) => {
                if tx.blocking_send(record).is_err() {
                    break;
                }
                sent += 1;
            }
            Err(e) if e.is_malformed() => warn!("Skipping stanza in {}: {}", path.display(), e),
            Err(e) => return Err(e),
        }
    }
    Ok(sent)
}
