// =============================================================================
// Exponential Moving Average (EMA)
// =============================================================================
//
// Formula:
//   k     = 2 / (period + 1)
//   EMA_0 = close_0
//   EMA_t = close_t * k + EMA_{t-1} * (1 - k)
//
// Seeded with the first close, not an SMA, and run across the whole history.
// `period` only gates a minimum length: fewer than `period` closes yields an
// empty series.  Output length equals input length otherwise.
//
// MACD uses a different, SMA-seeded helper (see `macd.rs`).  The two seeding
// rules are kept apart on purpose.
// =============================================================================

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::chart::{ChartSurface, SeriesId, SeriesOptions, SeriesPoint};
use crate::indicators::{closes, Indicator};
use crate::market_data::Candle;

/// First-close-seeded EMA with no length gate.  Empty on empty input or
/// `period == 0`.
pub fn ema_from_first_close(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.is_empty() {
        return Vec::new();
    }
    let k = 2.0 / (period as f64 + 1.0);

    let mut result = Vec::with_capacity(closes.len());
    let mut prev = closes[0];
    result.push(prev);
    for &close in &closes[1..] {
        prev = close * k + prev * (1.0 - k);
        result.push(prev);
    }
    result
}

/// EMA over `closes`; empty when `closes.len() < period` or `period == 0`.
pub fn calculate_ema(closes: &[f64], period: usize) -> Vec<f64> {
    if closes.len() < period {
        return Vec::new();
    }
    ema_from_first_close(closes, period)
}

/// EMA aligned onto candle times.
pub fn ema_points(history: &[Candle], period: usize) -> Vec<SeriesPoint> {
    calculate_ema(&closes(history), period)
        .into_iter()
        .zip(history)
        .map(|(value, c)| SeriesPoint::new(c.time, Some(value)))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmaConfig {
    pub period: usize,
    #[serde(default = "default_color")]
    pub color: String,
}

fn default_color() -> String {
    "orange".to_string()
}

impl EmaConfig {
    pub fn new(period: usize, color: impl Into<String>) -> Self {
        Self {
            period,
            color: color.into(),
        }
    }
}

/// One EMA line on the main pane.
pub struct EmaIndicator {
    config: EmaConfig,
    surface: Option<Arc<dyn ChartSurface>>,
    series: Option<SeriesId>,
}

impl EmaIndicator {
    pub fn new(config: EmaConfig) -> Self {
        Self {
            config,
            surface: None,
            series: None,
        }
    }

    #[cfg(test)]
    pub fn series_id(&self) -> Option<SeriesId> {
        self.series
    }
}

impl Indicator for EmaIndicator {
    fn name(&self) -> String {
        format!("ema-{}", self.config.period)
    }

    fn render(&mut self, surface: Arc<dyn ChartSurface>) {
        if self.series.is_some() {
            return;
        }
        let title = format!("EMA ({})", self.config.period);
        let id = surface.add_series(SeriesOptions::line(title, Some(&self.config.color), 2));
        self.series = Some(id);
        self.surface = Some(surface);
    }

    fn update(&mut self, history: &[Candle]) {
        let (Some(surface), Some(id)) = (&self.surface, self.series) else {
            return;
        };
        // Too short a history publishes an empty series.
        surface.set_series_data(id, ema_points(history, self.config.period));
    }

    fn update_last(&mut self, _candle: &Candle, history: &[Candle]) {
        let (Some(surface), Some(id)) = (&self.surface, self.series) else {
            return;
        };
        if history.len() < self.config.period {
            return;
        }
        if let Some(last) = ema_points(history, self.config.period).pop() {
            if let Err(e) = surface.update_series(id, last) {
                warn!(indicator = %self.name(), error = %e, "EMA point rejected");
            }
        }
    }

    fn destroy(&mut self) {
        if let (Some(surface), Some(id)) = (self.surface.take(), self.series.take()) {
            surface.remove_series(id);
        }
    }

    fn is_rendered(&self) -> bool {
        self.series.is_some()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::chart::MemorySurface;
    use crate::indicators::tests::candles_from_closes;

    // ---- calculate_ema ---------------------------------------------------

    #[test]
    fn ema_empty_input() {
        assert!(calculate_ema(&[], 5).is_empty());
    }

    #[test]
    fn ema_period_zero() {
        assert!(calculate_ema(&[1.0, 2.0, 3.0], 0).is_empty());
    }

    #[test]
    fn ema_insufficient_data() {
        assert!(calculate_ema(&[1.0, 2.0], 5).is_empty());
    }

    #[test]
    fn ema_period_equals_length() {
        let ema = calculate_ema(&[2.0, 4.0, 6.0], 3);
        assert_eq!(ema.len(), 3);
        assert_eq!(ema[0], 2.0);
    }

    #[test]
    fn ema_twenty_closes_period_fourteen() {
        let closes: Vec<f64> = (100..120).map(|x| x as f64).collect();
        let ema = calculate_ema(&closes, 14);
        assert_eq!(ema.len(), 20);
        assert_eq!(ema[0], 100.0);

        let k = 2.0 / 15.0;
        let mut expected = closes[0];
        for &c in &closes[1..] {
            expected = c * k + expected * (1.0 - k);
        }
        assert!((ema[19] - expected).abs() < 1e-9, "got {}, expected {expected}", ema[19]);
    }

    #[test]
    fn first_close_helper_has_no_gate() {
        let ema = ema_from_first_close(&[5.0, 7.0], 200);
        assert_eq!(ema.len(), 2);
        assert_eq!(ema[0], 5.0);
        assert!(ema[1] > 5.0 && ema[1] < 7.0);
    }

    // ---- EmaIndicator ----------------------------------------------------

    #[test]
    fn indicator_publishes_full_series_and_last_point() {
        let surface = Arc::new(MemorySurface::new());
        let mut ema = EmaIndicator::new(EmaConfig::new(3, "#ff9800"));
        ema.render(surface.clone());
        ema.render(surface.clone());
        assert_eq!(surface.series_count(), 1);

        let mut history = candles_from_closes(&[1.0, 2.0, 3.0, 4.0]);
        ema.update(&history);
        let id = ema.series_id().unwrap();
        assert_eq!(surface.points(id).unwrap().len(), 4);

        history.push(Candle::new(240, 4.0, 6.0, 4.0, 6.0, 1.0));
        ema.update_last(&history[4], &history);
        let points = surface.points(id).unwrap();
        assert_eq!(points.len(), 5);
        let full = calculate_ema(&closes(&history), 3);
        assert_eq!(points[4].value, Some(full[4]));
    }

    #[test]
    fn short_history_publishes_nothing() {
        let surface = Arc::new(MemorySurface::new());
        let mut ema = EmaIndicator::new(EmaConfig::new(50, "orange"));
        ema.render(surface.clone());
        ema.update(&candles_from_closes(&[1.0, 2.0]));
        assert!(surface.points(ema.series_id().unwrap()).unwrap().is_empty());
    }

    #[test]
    fn shrinking_history_clears_previous_points() {
        let surface = Arc::new(MemorySurface::new());
        let mut ema = EmaIndicator::new(EmaConfig::new(3, "orange"));
        ema.render(surface.clone());
        let id = ema.series_id().unwrap();

        ema.update(&candles_from_closes(&[1.0, 2.0, 3.0, 4.0]));
        assert_eq!(surface.points(id).unwrap().len(), 4);
        ema.update(&candles_from_closes(&[1.0, 2.0]));
        assert!(surface.points(id).unwrap().is_empty());
        ema.update(&[]);
        assert!(surface.points(id).unwrap().is_empty());
    }

    #[test]
    fn destroy_is_idempotent() {
        let surface = Arc::new(MemorySurface::new());
        let mut ema = EmaIndicator::new(EmaConfig::new(9, "orange"));
        ema.render(surface.clone());
        ema.destroy();
        ema.destroy();
        assert!(!ema.is_rendered());
        assert_eq!(surface.series_count(), 0);
        assert_eq!(ema.name(), "ema-9");
    }
}
