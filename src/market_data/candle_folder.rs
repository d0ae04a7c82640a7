//! Tick → candle folding.
//!
//! Pure functions with no I/O: the Snapshot Store calls [`fold`] under its
//! write lock so a candle is never observed half-updated.

use crate::types::{Candle, Tick};

/// Result of folding one tick into an asset's live slot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FoldOutcome {
    /// Same bucket: close moved, extremes widened if needed.
    Updated(Candle),
    /// First tick of a new bucket. `closed` is the candle that was discarded
    /// from the mutable slot, if any.
    Opened {
        candle: Candle,
        closed: Option<Candle>,
    },
    /// Tick belongs to a bucket older than the live one; dropped.
    Stale,
}

impl FoldOutcome {
    /// The candle that now occupies the live slot, if the tick was applied.
    pub fn candle(&self) -> Option<Candle> {
        match self {
            Self::Updated(c) => Some(*c),
            Self::Opened { candle, .. } => Some(*candle),
            Self::Stale => None,
        }
    }
}

/// Start of the bucket containing `timestamp`. Floors towards negative
/// infinity so pre-epoch timestamps still align.
pub fn bucket_start(timestamp: i64, interval: i64) -> i64 {
    timestamp.div_euclid(interval) * interval
}

/// Fold `tick` into the asset's current live candle.
pub fn fold(current: Option<&Candle>, tick: &Tick, interval: i64) -> FoldOutcome {
    let bucket = bucket_start(tick.timestamp, interval);

    match current {
        Some(live) if bucket < live.time => FoldOutcome::Stale,
        Some(live) if bucket == live.time => {
            let mut next = *live;
            next.close = tick.price;
            if tick.price > next.high {
                next.high = tick.price;
            }
            if tick.price < next.low {
                next.low = tick.price;
            }
            FoldOutcome::Updated(next)
        }
        previous => FoldOutcome::Opened {
            candle: Candle::opened_at(bucket, tick.price),
            closed: previous.copied(),
        },
    }
}
