use std::collections::HashMap;

use tracing::{debug, warn};

use crate::market_data::{Candle, SubscriptionKey};

// ---------------------------------------------------------------------------
// HistoryStore -- ordered candle sequence per (symbol, interval)
// ---------------------------------------------------------------------------

/// What a merge did to the stored sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Same `time` as the last candle: the still-open bar was updated in place.
    Replaced,
    Appended,
    /// Older than the last stored candle; History was left untouched.
    Stale,
}

/// Candle sequences keyed by subscription.  Within a key, `time` is
/// non-decreasing and never repeats.
///
/// The store is owned by the data coordinator, which serialises every
/// mutation; readers receive cloned snapshots, never references.
#[derive(Debug, Default)]
pub struct HistoryStore {
    series: HashMap<SubscriptionKey, Vec<Candle>>,
    /// Optional cap on candles kept per key (oldest dropped first).
    max_candles: Option<usize>,
}

impl HistoryStore {
    pub fn new(max_candles: Option<usize>) -> Self {
        Self {
            series: HashMap::new(),
            max_candles: max_candles.filter(|&n| n > 0),
        }
    }

    /// Overwrite the History for `key` with a freshly fetched batch.
    pub fn replace(&mut self, key: &SubscriptionKey, mut candles: Vec<Candle>) {
        self.trim(&mut candles);
        debug!(key = %key, count = candles.len(), "history replaced");
        self.series.insert(key.clone(), candles);
    }

    /// Apply the merge rule: equal `time` replaces the last entry, newer
    /// `time` appends, older `time` is rejected.
    pub fn merge(&mut self, key: &SubscriptionKey, candle: Candle) -> MergeOutcome {
        let max = self.max_candles;
        let ring = self.series.entry(key.clone()).or_default();

        let outcome = match ring.last().map(|c| c.time) {
            Some(last_time) if last_time == candle.time => {
                if let Some(slot) = ring.last_mut() {
                    *slot = candle;
                }
                MergeOutcome::Replaced
            }
            Some(last_time) if candle.time < last_time => {
                warn!(
                    key = %key,
                    tick_time = candle.time,
                    last_time,
                    "dropping out-of-order tick"
                );
                MergeOutcome::Stale
            }
            _ => {
                ring.push(candle);
                MergeOutcome::Appended
            }
        };

        if outcome == MergeOutcome::Appended {
            if let Some(max) = max {
                if ring.len() > max {
                    let excess = ring.len() - max;
                    ring.drain(..excess);
                }
            }
        }

        outcome
    }

    /// Read-only view of the History for `key` (empty when unknown).
    pub fn get(&self, key: &SubscriptionKey) -> &[Candle] {
        self.series.get(key).map_or(&[], Vec::as_slice)
    }

    /// Cloned copy of the History for `key` (empty when unknown).
    pub fn snapshot(&self, key: &SubscriptionKey) -> Vec<Candle> {
        self.series.get(key).cloned().unwrap_or_default()
    }

    /// Discard the History for `key`.
    pub fn remove(&mut self, key: &SubscriptionKey) -> Option<Vec<Candle>> {
        self.series.remove(key)
    }

    fn trim(&self, candles: &mut Vec<Candle>) {
        if let Some(max) = self.max_candles {
            if candles.len() > max {
                let excess = candles.len() - max;
                candles.drain(..excess);
            }
        }
    }
}
