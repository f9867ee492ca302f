// src/mirror/stats.rs
//! Run statistics and the `repo.json` state file
//!
//! Package workers bump atomic counters keyed distribution -> component.
//! [`StatsWriter`] snapshots them to `<cache>/repo.json` at most every few
//! seconds while the run is going, and once more at the end with
//! `running: false`.

use crate::error::{Error, Result};
use crate::filesystem::write_atomic;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Name of the state file under the cache root
pub const STATE_FILE_NAME: &str = "repo.json";

/// Minimum spacing between periodic flushes
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// Counters of one component
#[derive(Debug, Default)]
pub struct ComponentStats {
    packages: AtomicU64,
    size: AtomicU64,
}

impl ComponentStats {
    /// Count one processed package of `size` bytes
    pub fn record(&self, size: u64) {
        self.packages.fetch_add(1, Ordering::Relaxed);
        self.size.fetch_add(size, Ordering::Relaxed);
    }

    pub fn packages(&self) -> u64 {
        self.packages.load(Ordering::Relaxed)
    }

    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Relaxed)
    }

    fn snapshot(&self) -> ComponentSnapshot {
        let size = self.size();
        ComponentSnapshot {
            packages: self.packages(),
            size,
            human_size: format_bytes(size),
        }
    }
}

#[derive(Debug)]
struct DistStats {
    release_date: RwLock<DateTime<Utc>>,
    components: RwLock<BTreeMap<String, Arc<ComponentStats>>>,
}

impl Default for DistStats {
    fn default() -> Self {
        Self {
            release_date: RwLock::new(DateTime::UNIX_EPOCH),
            components: RwLock::new(BTreeMap::new()),
        }
    }
}

/// Run-scoped statistics shared by all workers
#[derive(Debug)]
pub struct MirrorStats {
    last_start: DateTime<Utc>,
    started: Instant,
    dists: RwLock<BTreeMap<String, Arc<DistStats>>>,
}

impl Default for MirrorStats {
    fn default() -> Self {
        Self::new()
    }
}

impl MirrorStats {
    pub fn new() -> Self {
        Self {
            last_start: Utc::now(),
            started: Instant::now(),
            dists: RwLock::new(BTreeMap::new()),
        }
    }

    fn dist(&self, dist: &str) -> Arc<DistStats> {
        if let Some(stats) = self.dists.read().get(dist) {
            return Arc::clone(stats);
        }
        Arc::clone(self.dists.write().entry(dist.to_string()).or_default())
    }

    pub fn set_release_date(&self, dist: &str, date: DateTime<Utc>) {
        *self.dist(dist).release_date.write() = date;
    }

    /// Counters of a component, created on first use
    pub fn component(&self, dist: &str, component: &str) -> Arc<ComponentStats> {
        let dist = self.dist(dist);
        if let Some(stats) = dist.components.read().get(component) {
            return Arc::clone(stats);
        }
        Arc::clone(
            dist.components
                .write()
                .entry(component.to_string())
                .or_default(),
        )
    }

    /// Seed a distribution's counters from a previous run's snapshot
    pub fn restore(&self, dist: &str, previous: &DistSnapshot) {
        self.set_release_date(dist, previous.release_date);
        for (name, snapshot) in &previous.components {
            let stats = self.component(dist, name);
            stats.packages.store(snapshot.packages, Ordering::Relaxed);
            stats.size.store(snapshot.size, Ordering::Relaxed);
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Point-in-time copy suitable for serialization
    pub fn snapshot(&self, running: bool) -> RepoSnapshot {
        let dists = self
            .dists
            .read()
            .iter()
            .map(|(name, dist)| {
                let components = dist
                    .components
                    .read()
                    .iter()
                    .map(|(name, stats)| (name.clone(), stats.snapshot()))
                    .collect();
                let snapshot = DistSnapshot {
                    release_date: *dist.release_date.read(),
                    components,
                };
                (name.clone(), snapshot)
            })
            .collect();

        RepoSnapshot {
            last_start: self.last_start,
            running,
            runtime: format_runtime(self.elapsed()),
            dists,
        }
    }
}

/// Serialized form of `repo.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoSnapshot {
    pub last_start: DateTime<Utc>,
    pub running: bool,
    pub runtime: String,
    #[serde(default)]
    pub dists: BTreeMap<String, DistSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistSnapshot {
    pub release_date: DateTime<Utc>,
    #[serde(default)]
    pub components: BTreeMap<String, ComponentSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentSnapshot {
    pub packages: u64,
    pub size: u64,
    pub human_size: String,
}

/// Writes snapshots to the state file
#[derive(Debug)]
pub struct StatsWriter {
    path: PathBuf,
    interval: Duration,
    last_flush: Mutex<Instant>,
    /// Serializes writers; they share one temp file
    write_lock: tokio::sync::Mutex<()>,
}

impl StatsWriter {
    pub fn new(cache_root: &Path) -> Self {
        Self::with_interval(cache_root, FLUSH_INTERVAL)
    }

    pub fn with_interval(cache_root: &Path, interval: Duration) -> Self {
        Self {
            path: cache_root.join(STATE_FILE_NAME),
            interval,
            last_flush: Mutex::new(Instant::now()),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Previous run's snapshot, if one is readable
    pub fn load_previous(&self) -> Option<RepoSnapshot> {
        let text = std::fs::read_to_string(&self.path).ok()?;
        match serde_json::from_str(&text) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!("Ignoring unreadable {}: {}", self.path.display(), e);
                None
            }
        }
    }

    /// Flush if the interval has passed and no other flush is in progress
    ///
    /// Failures are logged; a periodic snapshot is best effort.
    pub async fn maybe_flush(&self, stats: &MirrorStats) {
        {
            let mut last = self.last_flush.lock();
            if last.elapsed() < self.interval {
                return;
            }
            *last = Instant::now();
        }

        let Ok(_guard) = self.write_lock.try_lock() else {
            return;
        };
        if let Err(e) = self.write(&stats.snapshot(true)).await {
            warn!("Periodic stats write failed: {}", e);
        }
    }

    /// Unconditional write, used for the final snapshot
    pub async fn flush(&self, stats: &MirrorStats, running: bool) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        *self.last_flush.lock() = Instant::now();
        self.write(&stats.snapshot(running)).await
    }

    async fn write(&self, snapshot: &RepoSnapshot) -> Result<()> {
        let json = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| Error::IoError(format!("Failed to serialize stats: {e}")))?;
        write_atomic(&self.path, &json).await?;
        debug!("Wrote {}", self.path.display());
        Ok(())
    }
}

const KIB: f64 = 1024.0;

/// Binary-prefix size with two decimals and thousands separators
///
/// `1536` becomes `1.50 KiB`; values under 1 KiB stay in bytes.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["KiB", "MiB", "GiB", "TiB", "PiB"];

    let value = bytes as f64;
    let mut unit = "B";
    let mut scaled = value;
    for (power, name) in UNITS.iter().enumerate() {
        let divisor = KIB.powi(power as i32 + 1);
        if value >= divisor {
            unit = name;
            scaled = value / divisor;
        }
    }

    format!("{} {unit}", group_thousands(&format!("{scaled:.2}")))
}

/// Insert `,` separators into the integer part of a formatted number
fn group_thousands(number: &str) -> String {
    let (integer, fraction) = number.split_once('.').unwrap_or((number, ""));

    let mut grouped = String::with_capacity(integer.len() + integer.len() / 3);
    for (i, digit) in integer.chars().enumerate() {
        if i > 0 && (integer.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(digit);
    }

    if fraction.is_empty() {
        grouped
    } else {
        format!("{grouped}.{fraction}")
    }
}

/// Elapsed time as `hh:mm:ss`, prefixed with `d.` past one day
pub fn format_runtime(elapsed: Duration) -> String {
    let total = elapsed.as_secs();
    let days = total / 86_400;
    let hours = (total % 86_400) / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;

    if days > 0 {
        format!("{days}.{hours:02}:{minutes:02}:{seconds:02}")
    } else {
        format!("{hours:02}:{minutes:02}:{seconds:02}")
    }
}
