// =============================================================================
// Technical Indicators Module
// =============================================================================
//
// Each indicator is split in two halves:
//   - pure `calculate_*` functions over a candle / close slice, with no side
//     effects, so the numerics can be tested in isolation;
//   - an `Indicator` implementation that owns its output series on a chart
//     surface and republishes them whenever the coordinator hands it a new
//     History snapshot.
//
// Indicators never keep candle data of their own: every output is a function
// of the snapshot passed to `update`.

pub mod ema;
pub mod macd;
pub mod ribbon;
pub mod rsi;
pub mod volume;

use std::sync::Arc;

use crate::chart::ChartSurface;
use crate::market_data::Candle;

pub use ema::{EmaConfig, EmaIndicator};
pub use macd::{MacdConfig, MacdIndicator};
pub use ribbon::RibbonIndicator;
pub use rsi::{RsiConfig, RsiIndicator};
pub use volume::{VolumeConfig, VolumeIndicator};

/// Lifecycle contract shared by every indicator.
pub trait Indicator: Send {
    /// Unique per chart; attaching a second indicator with the same name
    /// replaces the first.
    fn name(&self) -> String;

    /// Allocate output series / panes on `surface`.  A second call is a no-op.
    fn render(&mut self, surface: Arc<dyn ChartSurface>);

    /// Full recompute over `history`, republishing every output series.
    fn update(&mut self, history: &[Candle]);

    /// Whether the coordinator should feed this indicator every tick through
    /// `update_last`, not only closed bars through `update`.  True only for
    /// pass-through formatters whose cost does not depend on history length.
    fn follows_open_bar(&self) -> bool {
        false
    }

    /// Incremental path for a single merged candle.
    fn update_last(&mut self, _candle: &Candle, history: &[Candle]) {
        self.update(history);
    }

    /// Release everything `render` allocated.  Safe to call repeatedly.
    fn destroy(&mut self);

    fn is_rendered(&self) -> bool;
}

pub(crate) fn closes(history: &[Candle]) -> Vec<f64> {
    history.iter().map(|c| c.close).collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use crate::market_data::Candle;

    /// One-minute candles with the given closes, open == previous close.
    pub(crate) fn candles_from_closes(closes: &[f64]) -> Vec<Candle> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| {
                let open = if i == 0 { c } else { closes[i - 1] };
                Candle::new(i as i64 * 60, open, c.max(open), c.min(open), c, 10.0 + i as f64)
            })
            .collect()
    }
}
