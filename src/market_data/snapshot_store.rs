use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::market_data::candle_folder::{fold, FoldOutcome};
use crate::types::{Candle, Tick};

// ---------------------------------------------------------------------------
// SnapshotStore -- asset → live candle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct Entry {
    candle: Candle,
    /// Store-wide sequence number of the last write to this entry.
    seq: u64,
}

/// Thread-safe mapping of asset symbol to its single live candle.
///
/// Writes are last-writer-wins per asset. Every write stamps the entry with
/// a store-wide sequence number so readers (the broadcast relay) can ask for
/// "what changed since I last looked" without holding the lock between
/// polls. Candles are `Copy`, so readers always get a whole value.
#[derive(Debug, Default)]
pub struct SnapshotStore {
    entries: RwLock<HashMap<String, Entry>>,
    seq: AtomicU64,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The single write path. `update` sees the current candle under the
    /// write lock; a returned candle replaces it and takes the next sequence.
    fn write_slot<F>(&self, asset: &str, update: F)
    where
        F: FnOnce(Option<&Candle>) -> Option<Candle>,
    {
        let mut map = self.entries.write();
        if let Some(candle) = update(map.get(asset).map(|e| &e.candle)) {
            let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
            map.insert(asset.to_string(), Entry { candle, seq });
        }
    }

    /// Insert or replace the live candle for `asset`.
    #[cfg(test)]
    pub fn upsert(&self, asset: &str, candle: Candle) {
        self.write_slot(asset, |_| Some(candle));
    }

    pub fn get(&self, asset: &str) -> Option<Candle> {
        self.entries.read().get(asset).map(|e| e.candle)
    }

    /// Point-in-time copy of every entry. Writes that land after the copy is
    /// taken are not visible to the returned iterator.
    pub fn all(&self) -> impl Iterator<Item = (String, Candle)> {
        let copy: Vec<(String, Candle)> = self
            .entries
            .read()
            .iter()
            .map(|(k, e)| (k.clone(), e.candle))
            .collect();
        copy.into_iter()
    }

    /// Fold a tick into the asset's slot. Read-fold-write happens under one
    /// write lock so concurrent ticks for the same asset serialize.
    pub fn apply_tick(&self, tick: &Tick, interval: i64) -> FoldOutcome {
        let mut outcome = FoldOutcome::Stale;
        self.write_slot(&tick.asset, |current| {
            outcome = fold(current, tick, interval);
            outcome.candle()
        });
        outcome
    }

    /// Entries written after `since`, plus the sequence to pass next time.
    pub fn changed_since(&self, since: u64) -> (Vec<(String, Candle)>, u64) {
        let map = self.entries.read();
        let current = self.seq.load(Ordering::SeqCst);
        let changed = map
            .iter()
            .filter(|(_, e)| e.seq > since)
            .map(|(k, e)| (k.clone(), e.candle))
            .collect();
        (changed, current)
    }

    pub fn current_seq(&self) -> u64 {
        self.seq.load(Ordering::SeqCst)
    }

    pub fn contains(&self, asset: &str) -> bool {
        self.entries.read().contains_key(asset)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn get_after_upsert_returns_value() {
        let store = SnapshotStore::new();
        let c = Candle::opened_at(60, 1.5);
        store.upsert("EURUSD_otc", c);
        assert_eq!(store.get("EURUSD_otc"), Some(c));
        assert_eq!(store.get("eurusd_otc"), None);
    }

    #[test]
    fn crossing_bucket_leaves_exactly_one_candle() {
        let store = SnapshotStore::new();
        store.apply_tick(&Tick::new("A", 10.0, 119), 60);
        store.apply_tick(&Tick::new("A", 11.0, 120), 60);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("A"), Some(Candle::opened_at(120, 11.0)));
    }

    #[test]
    fn stale_tick_does_not_mutate() {
        let store = SnapshotStore::new();
        store.apply_tick(&Tick::new("A", 11.0, 120), 60);
        let seq = store.current_seq();
        let outcome = store.apply_tick(&Tick::new("A", 50.0, 61), 60);
        assert_eq!(outcome, FoldOutcome::Stale);
        assert_eq!(store.get("A"), Some(Candle::opened_at(120, 11.0)));
        assert_eq!(store.current_seq(), seq);
    }

    #[test]
    fn changed_since_reports_only_new_writes() {
        let store = SnapshotStore::new();
        store.apply_tick(&Tick::new("A", 1.0, 0), 60);
        store.apply_tick(&Tick::new("B", 2.0, 0), 60);
        let (all, seq) = store.changed_since(0);
        assert_eq!(all.len(), 2);

        store.apply_tick(&Tick::new("B", 2.5, 1), 60);
        let (changed, next) = store.changed_since(seq);
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].0, "B");
        assert_eq!(changed[0].1.close, 2.5);
        assert!(next > seq);

        let (none, _) = store.changed_since(next);
        assert!(none.is_empty());
    }

    #[test]
    fn upsert_and_fold_share_one_sequence() {
        let store = SnapshotStore::new();
        store.upsert("A", Candle::opened_at(60, 1.0));
        assert_eq!(store.current_seq(), 1);
        store.apply_tick(&Tick::new("A", 2.0, 61), 60);
        assert_eq!(store.current_seq(), 2);
        assert_eq!(store.get("A").map(|c| (c.open, c.close)), Some((1.0, 2.0)));

        let (changed, _) = store.changed_since(1);
        assert_eq!(changed.len(), 1);
    }

    #[test]
    fn all_is_point_in_time() {
        let store = SnapshotStore::new();
        store.upsert("A", Candle::opened_at(0, 1.0));
        let iter = store.all();
        store.upsert("B", Candle::opened_at(0, 2.0));
        assert_eq!(iter.count(), 1);
        assert_eq!(store.all().count(), 2);
    }

    #[test]
    fn concurrent_writers_never_tear_candles() {
        let store = Arc::new(SnapshotStore::new());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for i in 0..500 {
                        let asset = format!("ASSET{}", i % 8);
                        let price = (t * 1000 + i) as f64;
                        store.apply_tick(&Tick::new(asset, price, 600), 60);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        for (_, c) in store.all() {
            assert!(c.low <= c.open && c.low <= c.close);
            assert!(c.high >= c.open && c.high >= c.close);
        }
        assert_eq!(store.len(), 8);
    }
}
