use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

fn default_closed() -> bool {
    true
}

/// A single OHLCV bar.  `time` is the bar's open time in UNIX seconds.
///
/// `closed` mirrors the exchange's "bar finalized" flag.  Historical rows do
/// not carry it and are implicitly closed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    #[serde(default = "default_closed")]
    pub closed: bool,
}

impl Candle {
    pub fn new(time: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self {
            time,
            open,
            high,
            low,
            close,
            volume,
            closed: true,
        }
    }

    #[cfg(test)]
    pub fn with_closed(mut self, closed: bool) -> Self {
        self.closed = closed;
        self
    }

    /// `close >= open`.
    pub fn is_up(&self) -> bool {
        self.close >= self.open
    }
}

/// Identity under which listeners, connections and History are multiplexed.
///
/// The symbol is upper-cased; the interval keeps the exchange literal as-is
/// because `1m` (minute) and `1M` (month) are different intervals.
#[derive(Debug, Clone, Hash, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionKey {
    pub symbol: String,
    pub interval: String,
}

impl SubscriptionKey {
    pub fn new(symbol: impl AsRef<str>, interval: impl AsRef<str>) -> Self {
        Self {
            symbol: symbol.as_ref().trim().to_uppercase(),
            interval: interval.as_ref().trim().to_string(),
        }
    }

    /// Exchange stream name, e.g. `btcusdt@kline_1m`.
    pub fn stream_name(&self) -> String {
        format!("{}@kline_{}", self.symbol.to_lowercase(), self.interval)
    }
}

impl std::fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.symbol, self.interval)
    }
}
