// =============================================================================
// Multi-EMA Trend Ribbon (GMMA style)
// =============================================================================
//
// 23 first-close-seeded EMAs drawn on the main pane:
//   fast     3, 6, ..., 21      (7 lines)
//   slow     24, 27, ..., 66    (15 lines)
//   baseline 200
//
// Trend per group: shortest-period latest value vs longest-period latest
// value.  Above => bullish tint, below => bearish tint, equal => neutral.
// Opacity climbs with the index inside a group; the baseline is always white.
// =============================================================================

use std::sync::Arc;

use serde::Serialize;

use crate::chart::{ChartSurface, SeriesId, SeriesOptions, SeriesPoint};
use crate::indicators::ema::ema_from_first_close;
use crate::indicators::{closes, Indicator};
use crate::market_data::Candle;

pub const FAST_COUNT: usize = 7;
pub const SLOW_COUNT: usize = 15;
pub const BASELINE_PERIOD: usize = 200;
const BASELINE_COLOR: &str = "#ffffff";

/// All ribbon periods in series order.
pub fn ribbon_periods() -> Vec<usize> {
    let fast = (1..=FAST_COUNT).map(|i| i * 3);
    let slow = (0..SLOW_COUNT).map(|i| 24 + i * 3);
    fast.chain(slow).chain(std::iter::once(BASELINE_PERIOD)).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Bullish,
    Bearish,
    Neutral,
}

/// Compare the first (shortest) and last (longest) latest values of a group.
pub fn classify(latest: &[f64]) -> Trend {
    match (latest.first(), latest.last()) {
        (Some(short), Some(long)) if short > long => Trend::Bullish,
        (Some(short), Some(long)) if short < long => Trend::Bearish,
        _ => Trend::Neutral,
    }
}

/// One EMA series per ribbon period.  Empty on empty input.
pub fn calculate_ribbon(closes: &[f64]) -> Vec<Vec<f64>> {
    if closes.is_empty() {
        return Vec::new();
    }
    ribbon_periods()
        .into_iter()
        .map(|p| ema_from_first_close(closes, p))
        .collect()
}

fn fast_color(trend: Trend, idx: usize) -> String {
    let rgb = match trend {
        Trend::Bullish => "0,255,255",
        Trend::Bearish => "255,165,0",
        Trend::Neutral => "128,128,128",
    };
    format!("rgba({rgb},{:.2})", 0.4 + 0.1 * idx as f64)
}

fn slow_color(trend: Trend, rel_idx: usize) -> String {
    let rgb = match trend {
        Trend::Bullish => "50,205,50",
        Trend::Bearish => "255,0,0",
        Trend::Neutral => "128,128,128",
    };
    format!("rgba({rgb},{:.2})", 0.3 + 0.03 * rel_idx as f64)
}

/// Colour of series `idx` given both group trends.
pub fn series_color(idx: usize, fast: Trend, slow: Trend) -> String {
    if idx < FAST_COUNT {
        fast_color(fast, idx)
    } else if idx < FAST_COUNT + SLOW_COUNT {
        slow_color(slow, idx - FAST_COUNT)
    } else {
        BASELINE_COLOR.to_string()
    }
}

fn line_width(idx: usize) -> u8 {
    if idx == FAST_COUNT - 1 || idx == FAST_COUNT + SLOW_COUNT - 1 || idx == FAST_COUNT + SLOW_COUNT
    {
        2
    } else {
        1
    }
}

pub struct RibbonIndicator {
    surface: Option<Arc<dyn ChartSurface>>,
    series: Vec<SeriesId>,
    trends: Option<(Trend, Trend)>,
}

impl RibbonIndicator {
    pub fn new() -> Self {
        Self {
            surface: None,
            series: Vec::new(),
            trends: None,
        }
    }

    /// `(fast, slow)` trend from the last update.
    #[cfg(test)]
    pub fn trends(&self) -> Option<(Trend, Trend)> {
        self.trends
    }
}

impl Default for RibbonIndicator {
    fn default() -> Self {
        Self::new()
    }
}

impl Indicator for RibbonIndicator {
    fn name(&self) -> String {
        "ribbon".to_string()
    }

    fn render(&mut self, surface: Arc<dyn ChartSurface>) {
        if !self.series.is_empty() {
            return;
        }
        self.series = ribbon_periods()
            .into_iter()
            .enumerate()
            .map(|(idx, p)| {
                surface.add_series(SeriesOptions::line(format!("EMA {p}"), None, line_width(idx)))
            })
            .collect();
        self.surface = Some(surface);
    }

    fn update(&mut self, history: &[Candle]) {
        let Some(surface) = &self.surface else {
            return;
        };
        let results = calculate_ribbon(&closes(history));
        if results.is_empty() {
            // Nothing to draw; clear the lines but keep their colours.
            for id in &self.series {
                surface.set_series_data(*id, Vec::new());
            }
            self.trends = None;
            return;
        }

        let latest: Vec<f64> = results
            .iter()
            .map(|s| s.last().copied().unwrap_or(0.0))
            .collect();
        let fast = classify(&latest[..FAST_COUNT]);
        let slow = classify(&latest[FAST_COUNT..FAST_COUNT + SLOW_COUNT]);
        let recolor = self.trends != Some((fast, slow));
        self.trends = Some((fast, slow));

        for (idx, (values, id)) in results.into_iter().zip(&self.series).enumerate() {
            let points = values
                .into_iter()
                .zip(history)
                .map(|(v, c)| SeriesPoint::new(c.time, Some(v)))
                .collect();
            surface.set_series_data(*id, points);
            if recolor {
                surface.set_series_color(*id, &series_color(idx, fast, slow));
            }
        }
    }

    fn destroy(&mut self) {
        if let Some(surface) = self.surface.take() {
            for id in self.series.drain(..) {
                surface.remove_series(id);
            }
        }
        self.series.clear();
        self.trends = None;
    }

    fn is_rendered(&self) -> bool {
        !self.series.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chart::MemorySurface;
    use crate::indicators::tests::candles_from_closes;

    #[test]
    fn twenty_three_periods_in_groups() {
        let periods = ribbon_periods();
        assert_eq!(periods.len(), 23);
        assert_eq!(&periods[..7], &[3, 6, 9, 12, 15, 18, 21]);
        assert_eq!(periods[7], 24);
        assert_eq!(periods[21], 66);
        assert_eq!(periods[22], 200);
    }

    #[test]
    fn no_period_gate_and_first_close_seed() {
        let ribbon = calculate_ribbon(&[10.0, 11.0, 12.0]);
        assert_eq!(ribbon.len(), 23);
        assert!(ribbon.iter().all(|s| s.len() == 3 && s[0] == 10.0));
        assert!(calculate_ribbon(&[]).is_empty());
    }

    #[test]
    fn classification() {
        assert_eq!(classify(&[3.0, 2.0, 1.0]), Trend::Bullish);
        assert_eq!(classify(&[1.0, 2.0, 3.0]), Trend::Bearish);
        assert_eq!(classify(&[2.0, 5.0, 2.0]), Trend::Neutral);
    }

    #[test]
    fn colours_and_opacity_gradient() {
        assert_eq!(series_color(0, Trend::Bullish, Trend::Bearish), "rgba(0,255,255,0.40)");
        assert_eq!(series_color(6, Trend::Bearish, Trend::Bearish), "rgba(255,165,0,1.00)");
        assert_eq!(series_color(7, Trend::Bullish, Trend::Bullish), "rgba(50,205,50,0.30)");
        assert_eq!(series_color(21, Trend::Neutral, Trend::Bearish), "rgba(255,0,0,0.72)");
        assert_eq!(series_color(22, Trend::Bearish, Trend::Bearish), "#ffffff");
    }

    #[test]
    fn rising_market_paints_bullish() {
        let surface = Arc::new(MemorySurface::new());
        let mut ribbon = RibbonIndicator::new();
        ribbon.render(surface.clone());
        ribbon.render(surface.clone());
        assert_eq!(surface.series_count(), 23);

        let closes: Vec<f64> = (0..100).map(|x| 100.0 + x as f64).collect();
        ribbon.update(&candles_from_closes(&closes));
        assert_eq!(ribbon.trends(), Some((Trend::Bullish, Trend::Bullish)));

        let snap = surface.snapshot();
        assert_eq!(snap.series[0].options.color.as_deref(), Some("rgba(0,255,255,0.40)"));
        assert_eq!(snap.series[22].options.color.as_deref(), Some("#ffffff"));
        assert_eq!(snap.series[22].options.line_width, 2);
        assert_eq!(snap.series[0].points.len(), 100);

        ribbon.destroy();
        ribbon.destroy();
        assert_eq!(surface.series_count(), 0);
    }

    #[test]
    fn empty_history_does_not_recolour() {
        let surface = Arc::new(MemorySurface::new());
        let mut ribbon = RibbonIndicator::new();
        ribbon.render(surface.clone());
        ribbon.update(&[]);
        assert!(ribbon.trends().is_none());
        assert!(surface.snapshot().series[0].options.color.is_none());
    }

    #[test]
    fn emptied_history_clears_every_line() {
        let surface = Arc::new(MemorySurface::new());
        let mut ribbon = RibbonIndicator::new();
        ribbon.render(surface.clone());
        ribbon.update(&candles_from_closes(&[10.0, 11.0, 12.0]));
        assert!(ribbon.trends().is_some());

        ribbon.update(&[]);
        assert!(ribbon.trends().is_none());
        let snap = surface.snapshot();
        assert_eq!(snap.series.len(), 23);
        assert!(snap.series.iter().all(|s| s.points.is_empty()));
    }
}
