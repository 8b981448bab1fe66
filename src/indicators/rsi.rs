// =============================================================================
// Relative Strength Index (RSI) — Wilder's Smoothing
// =============================================================================
//
// Step 1 — The first `period` outputs are gaps (not enough transitions yet).
// Step 2 — Seed average gain / average loss with the plain mean of the first
//          `period` up-moves / down-moves.
// Step 3 — Apply Wilder's smoothing for every later transition:
//            avg_gain = (prev_avg_gain * (period - 1) + current_gain) / period
//            avg_loss = (prev_avg_loss * (period - 1) + current_loss) / period
// Step 4 — RS  = avg_gain / avg_loss
//          RSI = 100 - 100 / (1 + RS),  or exactly 100 when avg_loss == 0.
//
// A flat market (no moves at all) therefore reads 100, not 50.
// Rendered in its own pane with overbought (70) / oversold (30) lines.
// =============================================================================

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::chart::{ChartSurface, PriceLine, SeriesId, SeriesOptions, SeriesPoint, TimeScaleSync};
use crate::indicators::{closes, Indicator};
use crate::market_data::Candle;

pub const OVERBOUGHT: f64 = 70.0;
pub const OVERSOLD: f64 = 30.0;
const PANE_NAME: &str = "rsi";

/// Full RSI series aligned with `closes`.
///
/// # Edge cases
/// - `period == 0` => empty vec
/// - `closes.len() <= period` => empty vec
/// - Output length equals `closes.len()`; indices `0..period` are `None`.
pub fn calculate_rsi(closes: &[f64], period: usize) -> Vec<Option<f64>> {
    if period == 0 || closes.len() <= period {
        return Vec::new();
    }

    let mut out: Vec<Option<f64>> = vec![None; period];
    out.reserve(closes.len() - period);

    // --- Seed ----------------------------------------------------------------
    let (gain, loss) = closes[..=period]
        .windows(2)
        .map(|w| w[1] - w[0])
        .fold((0.0_f64, 0.0_f64), |(g, l), d| {
            if d > 0.0 {
                (g + d, l)
            } else {
                (g, l + d.abs())
            }
        });

    let p = period as f64;
    let mut avg_gain = gain / p;
    let mut avg_loss = loss / p;
    out.push(Some(rsi_from_averages(avg_gain, avg_loss)));

    // --- Wilder smoothing ----------------------------------------------------
    for w in closes[period..].windows(2) {
        let change = w[1] - w[0];
        let current_gain = if change > 0.0 { change } else { 0.0 };
        let current_loss = if change < 0.0 { -change } else { 0.0 };
        avg_gain = (avg_gain * (p - 1.0) + current_gain) / p;
        avg_loss = (avg_loss * (p - 1.0) + current_loss) / p;
        out.push(Some(rsi_from_averages(avg_gain, avg_loss)));
    }

    out
}

fn rsi_from_averages(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        return 100.0;
    }
    let rs = avg_gain / avg_loss;
    100.0 - 100.0 / (1.0 + rs)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RsiConfig {
    #[serde(default = "default_period")]
    pub period: usize,
    #[serde(default = "default_color")]
    pub color: String,
    #[serde(default = "default_height")]
    pub height: u32,
}

fn default_period() -> usize {
    14
}
fn default_color() -> String {
    "#B0BEC5".to_string()
}
fn default_height() -> u32 {
    120
}

impl Default for RsiConfig {
    fn default() -> Self {
        Self {
            period: default_period(),
            color: default_color(),
            height: default_height(),
        }
    }
}

struct RsiPane {
    host: Arc<dyn ChartSurface>,
    series: SeriesId,
    pane: Arc<dyn ChartSurface>,
    _sync: TimeScaleSync,
}

pub struct RsiIndicator {
    config: RsiConfig,
    pane: Option<RsiPane>,
}

impl RsiIndicator {
    pub fn new(config: RsiConfig) -> Self {
        Self {
            config,
            pane: None,
        }
    }
}

impl Indicator for RsiIndicator {
    fn name(&self) -> String {
        PANE_NAME.to_string()
    }

    fn render(&mut self, surface: Arc<dyn ChartSurface>) {
        if self.pane.is_some() {
            return;
        }
        let pane = surface.create_pane(PANE_NAME, self.config.height);
        let series = pane.add_series(SeriesOptions::line(
            format!("RSI ({})", self.config.period),
            Some(&self.config.color),
            2,
        ));
        pane.add_price_line(
            series,
            PriceLine {
                price: OVERBOUGHT,
                color: "red".to_string(),
            },
        );
        pane.add_price_line(
            series,
            PriceLine {
                price: OVERSOLD,
                color: "green".to_string(),
            },
        );
        let sync = TimeScaleSync::link(surface.time_scale(), pane.time_scale());
        self.pane = Some(RsiPane {
            host: surface,
            series,
            pane,
            _sync: sync,
        });
    }

    fn update(&mut self, history: &[Candle]) {
        let Some(rsi) = &self.pane else {
            return;
        };
        let points = calculate_rsi(&closes(history), self.config.period)
            .into_iter()
            .zip(history)
            .map(|(value, c)| SeriesPoint::new(c.time, value))
            .collect();
        rsi.pane.set_series_data(rsi.series, points);
    }

    fn destroy(&mut self) {
        if let Some(rsi) = self.pane.take() {
            rsi.host.remove_pane(PANE_NAME);
        }
    }

    fn is_rendered(&self) -> bool {
        self.pane.is_some()
    }
}
