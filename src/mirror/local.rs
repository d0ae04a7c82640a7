// =============================================================================
// Local Mirror — snapshot file + per-asset history rings on disk
// =============================================================================
//
// Layout under `data_dir`:
//
//   live_snapshot.json        { "updated_at": .., "candles": { asset: candle } }
//   recent/<asset>.json       [ candle, ... ]   oldest first, capped
//
// Every file is written to a `.json.tmp` sibling and renamed into place, so
// a concurrent reader sees either the previous or the next complete file.
// =============================================================================

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::types::{is_valid_symbol, Candle};

const SNAPSHOT_FILE: &str = "live_snapshot.json";
const RECENT_DIR: &str = "recent";

#[derive(Debug, Default, Serialize, Deserialize)]
struct SnapshotFile {
    updated_at: i64,
    candles: BTreeMap<String, Candle>,
}

/// What one flush wrote.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct FlushReport {
    pub snapshot_assets: usize,
    pub history_files: usize,
    pub history_failures: usize,
}

pub struct LocalMirror {
    dir: PathBuf,
    history_max: usize,
    /// Contents of the snapshot file as last written or loaded.
    persisted: RwLock<BTreeMap<String, Candle>>,
    history: RwLock<HashMap<String, VecDeque<Candle>>>,
    /// Serialises writers so two flushes never share a tmp file.
    write_lock: Mutex<()>,
}

impl LocalMirror {
    /// Open (creating if needed) the mirror directory and load whatever a
    /// previous run left behind.
    pub fn open(dir: impl Into<PathBuf>, history_max: usize) -> Result<Self> {
        let dir = dir.into();
        let recent = dir.join(RECENT_DIR);
        std::fs::create_dir_all(&recent)
            .with_context(|| format!("failed to create mirror dir {}", recent.display()))?;

        let mirror = Self {
            dir,
            history_max: history_max.max(1),
            persisted: RwLock::new(BTreeMap::new()),
            history: RwLock::new(HashMap::new()),
            write_lock: Mutex::new(()),
        };
        mirror.load_snapshot();
        mirror.load_history(&recent);
        info!(
            dir = %mirror.dir.display(),
            cached = mirror.persisted.read().len(),
            history_assets = mirror.history.read().len(),
            "local mirror opened"
        );
        Ok(mirror)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.dir.join(SNAPSHOT_FILE)
    }

    fn recent_path(&self, asset: &str) -> PathBuf {
        self.dir.join(RECENT_DIR).join(format!("{asset}.json"))
    }

    fn load_snapshot(&self) {
        let path = self.snapshot_path();
        match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<SnapshotFile>(&bytes) {
                Ok(file) => *self.persisted.write() = file.candles,
                Err(e) => warn!(path = %path.display(), error = %e, "ignoring unreadable snapshot file"),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "failed to read snapshot file"),
        }
    }

    fn load_history(&self, recent: &Path) {
        let entries = match std::fs::read_dir(recent) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %recent.display(), error = %e, "failed to list history dir");
                return;
            }
        };

        let mut history = self.history.write();
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(asset) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_suffix(".json"))
                .filter(|a| is_valid_symbol(a))
            else {
                continue;
            };
            let candles = std::fs::read(&path)
                .map_err(anyhow::Error::from)
                .and_then(|b| serde_json::from_slice::<Vec<Candle>>(&b).map_err(Into::into));
            match candles {
                Ok(mut candles) => {
                    candles.sort_by_key(|c| c.time);
                    let skip = candles.len().saturating_sub(self.history_max);
                    history.insert(asset.to_string(), candles.into_iter().skip(skip).collect());
                }
                Err(e) => warn!(path = %path.display(), error = %e, "ignoring unreadable history file"),
            }
        }
    }

    // -------------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------------

    /// Persist the live candles. Assets missing from `live` keep their last
    /// persisted candle, so a restart does not wipe the cache before every
    /// asset has ticked again.
    pub fn flush(&self, live: &[(String, Candle)], now: i64) -> Result<FlushReport> {
        let _writer = self.write_lock.lock();

        // Only published to `persisted` once the file holds it.
        let mut file = SnapshotFile {
            updated_at: now,
            candles: self.persisted.read().clone(),
        };
        for (asset, candle) in live {
            match file.candles.get(asset) {
                Some(prev) if prev.time > candle.time => {}
                _ => {
                    file.candles.insert(asset.clone(), *candle);
                }
            }
        }
        let snapshot_assets = file.candles.len();
        write_json_atomic(&self.snapshot_path(), &file)?;
        *self.persisted.write() = file.candles;

        let dirty: Vec<(String, Vec<Candle>)> = {
            let mut history = self.history.write();
            live.iter()
                .filter(|(asset, _)| is_valid_symbol(asset))
                .filter_map(|(asset, candle)| {
                    let ring = history.entry(asset.clone()).or_default();
                    push_ring(ring, *candle, self.history_max)
                        .then(|| (asset.clone(), ring.iter().copied().collect()))
                })
                .collect()
        };

        let mut report = FlushReport {
            snapshot_assets,
            ..FlushReport::default()
        };
        for (asset, candles) in &dirty {
            match write_json_atomic(&self.recent_path(asset), candles) {
                Ok(()) => report.history_files += 1,
                Err(e) => {
                    report.history_failures += 1;
                    warn!(asset = %asset, error = %e, "history write failed");
                }
            }
        }
        debug!(
            assets = report.snapshot_assets,
            history = report.history_files,
            "mirror flushed"
        );
        Ok(report)
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// Last candle persisted for `asset`: the snapshot file first, then the
    /// tail of its history ring.
    pub async fn last_known(&self, asset: &str) -> Option<Candle> {
        let path = self.snapshot_path();
        match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<SnapshotFile>(&bytes) {
                Ok(file) => {
                    if let Some(candle) = file.candles.get(asset) {
                        return Some(*candle);
                    }
                }
                Err(e) => warn!(path = %path.display(), error = %e, "snapshot file unreadable"),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "snapshot file read failed"),
        }
        self.history.read().get(asset).and_then(|r| r.back().copied())
    }

    /// History ring for `asset`, oldest first.
    pub fn history(&self, asset: &str) -> Vec<Candle> {
        self.history
            .read()
            .get(asset)
            .map(|r| r.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn all_history(&self) -> Vec<(String, Vec<Candle>)> {
        self.history
            .read()
            .iter()
            .map(|(asset, ring)| (asset.clone(), ring.iter().copied().collect()))
            .collect()
    }

    pub fn is_cached(&self, asset: &str) -> bool {
        self.persisted.read().contains_key(asset)
            || self.history.read().get(asset).map(|r| !r.is_empty()).unwrap_or(false)
    }

    /// Every asset with anything on disk, sorted.
    pub fn cached_assets(&self) -> Vec<String> {
        let mut assets: Vec<String> = self.persisted.read().keys().cloned().collect();
        assets.extend(
            self.history
                .read()
                .iter()
                .filter(|(_, r)| !r.is_empty())
                .map(|(a, _)| a.clone()),
        );
        assets.sort();
        assets.dedup();
        assets
    }
}

impl std::fmt::Debug for LocalMirror {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalMirror")
            .field("dir", &self.dir)
            .field("history_max", &self.history_max)
            .finish()
    }
}

/// Fold `candle` into a time-ordered ring: same bucket replaces, newer bucket
/// appends (trimming the oldest), older bucket is ignored. Returns whether
/// the ring changed.
pub fn push_ring(ring: &mut VecDeque<Candle>, candle: Candle, max: usize) -> bool {
    match ring.back().map(|c| c.time) {
        Some(time) if time == candle.time => {
            if ring.back() == Some(&candle) {
                return false;
            }
            if let Some(last) = ring.back_mut() {
                *last = candle;
            }
        }
        Some(time) if time > candle.time => return false,
        _ => {
            ring.push_back(candle);
            while ring.len() > max {
                ring.pop_front();
            }
        }
    }
    true
}

/// Serialise `value` to `path` via a temporary sibling and a rename.
fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_vec(value).context("failed to serialise mirror file")?;
    let tmp_path = path.with_extension("json.tmp");

    std::fs::write(&tmp_path, &content)
        .with_context(|| format!("failed to write tmp file {}", tmp_path.display()))?;
    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("failed to rename tmp file to {}", path.display()))?;
    Ok(())
}
