// =============================================================================
// Moving Average Convergence Divergence (MACD)
// =============================================================================
//
//   fast   = sma_seeded_ema(closes, fast_period)
//   slow   = sma_seeded_ema(closes, slow_period)
//   macd   = fast - slow                       (gap where either is a gap)
//   signal = sma_seeded_ema(compact(macd), signal_period), re-expanded onto
//            the macd positions in order
//   hist   = macd - signal                     (gap where either is a gap)
//
// The helper here is seeded with the simple average of the first `period`
// values and leaves the first `period - 1` positions empty.  This differs
// from the first-close seed of `ema.rs`.
// =============================================================================

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::chart::{ChartSurface, SeriesId, SeriesOptions, SeriesPoint, TimeScaleSync};
use crate::indicators::{closes, Indicator};
use crate::market_data::Candle;

const PANE_NAME: &str = "macd";
const PANE_HEIGHT: u32 = 120;
const MACD_COLOR: &str = "#2196f3";
const SIGNAL_COLOR: &str = "#ff9800";
const HIST_UP_COLOR: &str = "rgba(76,175,80,0.6)";
const HIST_DOWN_COLOR: &str = "rgba(244,67,54,0.6)";

/// SMA-seeded EMA.  Same length as `values`; all `None` when `period == 0`
/// or `values.len() < period`.
pub fn sma_seeded_ema(values: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; values.len()];
    if period == 0 || values.len() < period {
        return out;
    }

    let k = 2.0 / (period as f64 + 1.0);
    let mut prev = values[..period].iter().sum::<f64>() / period as f64;
    out[period - 1] = Some(prev);
    for (i, &v) in values.iter().enumerate().skip(period) {
        prev = v * k + prev * (1.0 - k);
        out[i] = Some(prev);
    }
    out
}

#[derive(Debug, Clone, PartialEq)]
pub struct MacdOutput {
    pub macd: Vec<Option<f64>>,
    pub signal: Vec<Option<f64>>,
    pub histogram: Vec<Option<f64>>,
}

pub fn calculate_macd(
    closes: &[f64],
    fast_period: usize,
    slow_period: usize,
    signal_period: usize,
) -> MacdOutput {
    let fast = sma_seeded_ema(closes, fast_period);
    let slow = sma_seeded_ema(closes, slow_period);

    let macd: Vec<Option<f64>> = fast
        .iter()
        .zip(&slow)
        .map(|(f, s)| match (f, s) {
            (Some(f), Some(s)) => Some(f - s),
            _ => None,
        })
        .collect();

    let compact: Vec<f64> = macd.iter().flatten().copied().collect();
    let mut compact_signal = sma_seeded_ema(&compact, signal_period).into_iter();
    let signal: Vec<Option<f64>> = macd
        .iter()
        .map(|m| match m {
            Some(_) => compact_signal.next().flatten(),
            None => None,
        })
        .collect();

    let histogram = macd
        .iter()
        .zip(&signal)
        .map(|(m, s)| match (m, s) {
            (Some(m), Some(s)) => Some(m - s),
            _ => None,
        })
        .collect();

    MacdOutput {
        macd,
        signal,
        histogram,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MacdConfig {
    #[serde(default = "default_fast")]
    pub fast_period: usize,
    #[serde(default = "default_slow")]
    pub slow_period: usize,
    #[serde(default = "default_signal")]
    pub signal_period: usize,
}

fn default_fast() -> usize {
    12
}
fn default_slow() -> usize {
    26
}
fn default_signal() -> usize {
    9
}

impl Default for MacdConfig {
    fn default() -> Self {
        Self {
            fast_period: default_fast(),
            slow_period: default_slow(),
            signal_period: default_signal(),
        }
    }
}

struct MacdPane {
    host: Arc<dyn ChartSurface>,
    pane: Arc<dyn ChartSurface>,
    macd: SeriesId,
    signal: SeriesId,
    histogram: SeriesId,
    _sync: TimeScaleSync,
}

pub struct MacdIndicator {
    config: MacdConfig,
    pane: Option<MacdPane>,
}

impl MacdIndicator {
    pub fn new(config: MacdConfig) -> Self {
        Self { config, pane: None }
    }
}

impl Indicator for MacdIndicator {
    fn name(&self) -> String {
        PANE_NAME.to_string()
    }

    fn render(&mut self, surface: Arc<dyn ChartSurface>) {
        if self.pane.is_some() {
            return;
        }
        let pane = surface.create_pane(PANE_NAME, PANE_HEIGHT);
        let macd = pane.add_series(SeriesOptions::line("MACD", Some(MACD_COLOR), 1));
        let signal = pane.add_series(SeriesOptions::line("Signal", Some(SIGNAL_COLOR), 1));
        let histogram = pane.add_series(SeriesOptions::histogram("Histogram", Some("#888")));
        let sync = TimeScaleSync::link(surface.time_scale(), pane.time_scale());
        self.pane = Some(MacdPane {
            host: surface,
            pane,
            macd,
            signal,
            histogram,
            _sync: sync,
        });
    }

    fn update(&mut self, history: &[Candle]) {
        let Some(p) = &self.pane else {
            return;
        };
        let out = calculate_macd(
            &closes(history),
            self.config.fast_period,
            self.config.slow_period,
            self.config.signal_period,
        );

        let line = |values: &[Option<f64>]| -> Vec<SeriesPoint> {
            history
                .iter()
                .zip(values)
                .map(|(c, v)| SeriesPoint::new(c.time, *v))
                .collect()
        };
        p.pane.set_series_data(p.macd, line(&out.macd));
        p.pane.set_series_data(p.signal, line(&out.signal));

        let bars = history
            .iter()
            .zip(&out.histogram)
            .map(|(c, h)| {
                let value = h.unwrap_or(0.0);
                let color = if value >= 0.0 { HIST_UP_COLOR } else { HIST_DOWN_COLOR };
                SeriesPoint::colored(c.time, Some(value), color)
            })
            .collect();
        p.pane.set_series_data(p.histogram, bars);
    }

    fn destroy(&mut self) {
        if let Some(p) = self.pane.take() {
            p.host.remove_pane(PANE_NAME);
        }
    }

    fn is_rendered(&self) -> bool {
        self.pane.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chart::MemorySurface;
    use crate::indicators::tests::candles_from_closes;

    fn wave(n: usize) -> Vec<f64> {
        (0..n)
            .map(|i| 100.0 + (i as f64 * 0.3).sin() * 5.0 + i as f64 * 0.1)
            .collect()
    }

    #[test]
    fn helper_seeds_with_sma() {
        let out = sma_seeded_ema(&[1.0, 2.0, 3.0, 4.0], 3);
        assert_eq!(out[0], None);
        assert_eq!(out[1], None);
        assert_eq!(out[2], Some(2.0));
        assert_eq!(out[3], Some(4.0 * 0.5 + 2.0 * 0.5));
    }

    #[test]
    fn helper_degenerate_periods_are_all_gaps() {
        assert!(sma_seeded_ema(&[1.0, 2.0], 0).iter().all(Option::is_none));
        assert!(sma_seeded_ema(&[1.0, 2.0], 5).iter().all(Option::is_none));
        assert!(sma_seeded_ema(&[], 3).is_empty());
    }

    #[test]
    fn macd_line_starts_at_slow_period() {
        let out = calculate_macd(&wave(60), 12, 26, 9);
        assert_eq!(out.macd.len(), 60);
        assert!(out.macd[..25].iter().all(Option::is_none));
        assert!(out.macd[25..].iter().all(Option::is_some));
        // signal needs 9 macd values: first at 25 + 8
        assert!(out.signal[..33].iter().all(Option::is_none));
        assert!(out.signal[33].is_some());
    }

    #[test]
    fn histogram_identity_holds_exactly() {
        let out = calculate_macd(&wave(120), 12, 26, 9);
        let mut checked = 0;
        for i in 0..120 {
            if let (Some(m), Some(s)) = (out.macd[i], out.signal[i]) {
                assert_eq!(out.histogram[i], Some(m - s));
                checked += 1;
            } else {
                assert_eq!(out.histogram[i], None);
            }
        }
        assert_eq!(checked, 120 - 33);
    }

    #[test]
    fn signal_is_reexpanded_in_order() {
        let closes = wave(50);
        let out = calculate_macd(&closes, 3, 5, 2);
        let compact: Vec<f64> = out.macd.iter().flatten().copied().collect();
        let expected = sma_seeded_ema(&compact, 2);
        let got: Vec<Option<f64>> = out
            .macd
            .iter()
            .zip(&out.signal)
            .filter(|(m, _)| m.is_some())
            .map(|(_, s)| *s)
            .collect();
        assert_eq!(got, expected);
    }

    #[test]
    fn indicator_shows_gaps_as_zero_bars() {
        let surface = Arc::new(MemorySurface::new());
        let mut macd = MacdIndicator::new(MacdConfig::default());
        macd.render(surface.clone());
        macd.render(surface.clone());
        macd.update(&candles_from_closes(&wave(40)));

        let pane = surface.pane("macd").unwrap();
        let snap = pane.snapshot();
        assert_eq!(snap.series.len(), 3);
        let bars = &snap.series[2].points;
        assert_eq!(bars.len(), 40);
        assert_eq!(bars[0].value, Some(0.0));
        assert_eq!(bars[0].color.as_deref(), Some(HIST_UP_COLOR));
        assert_eq!(snap.series[0].points[0].value, None);

        macd.destroy();
        macd.destroy();
        assert!(surface.pane("macd").is_none());
    }
}
