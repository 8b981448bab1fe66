// =============================================================================
// Chart Contracts — what the rendering layer provides to the core
// =============================================================================
//
// The core never draws.  It talks to three contracts:
//
//   RenderSink    — candle destination of one chart (`set_data`, `update`,
//                   `handle_data_update`).
//   ChartSurface  — where indicators allocate their own output series and
//                   sub-panes.
//   TimeScale     — a pane's horizontal axis; used to keep sub-panes
//                   pan-synchronised with the main pane.
//
// `memory` provides in-process implementations that the HTTP surface reads
// snapshots from.
// =============================================================================

pub mod memory;
pub mod sync;
pub mod view;

use std::sync::Arc;

use serde::Serialize;

use crate::error::FeedError;
use crate::market_data::Candle;

pub use memory::{MemorySurface, SurfaceSnapshot};
pub use sync::TimeScaleSync;
pub use view::{ChartSnapshot, ChartView};

pub type SeriesId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SeriesKind {
    Line,
    Histogram,
}

#[derive(Debug, Clone, Serialize)]
pub struct SeriesOptions {
    pub title: String,
    pub kind: SeriesKind,
    pub color: Option<String>,
    pub line_width: u8,
}

impl SeriesOptions {
    pub fn line(title: impl Into<String>, color: Option<&str>, line_width: u8) -> Self {
        Self {
            title: title.into(),
            kind: SeriesKind::Line,
            color: color.map(str::to_string),
            line_width,
        }
    }

    pub fn histogram(title: impl Into<String>, color: Option<&str>) -> Self {
        Self {
            title: title.into(),
            kind: SeriesKind::Histogram,
            color: color.map(str::to_string),
            line_width: 1,
        }
    }
}

/// One point of an indicator output series.  `value == None` is a gap
/// (insufficient data), not zero.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesPoint {
    pub time: i64,
    pub value: Option<f64>,
    pub color: Option<String>,
}

impl SeriesPoint {
    pub fn new(time: i64, value: Option<f64>) -> Self {
        Self {
            time,
            value,
            color: None,
        }
    }

    pub fn colored(time: i64, value: Option<f64>, color: impl Into<String>) -> Self {
        Self {
            time,
            value,
            color: Some(color.into()),
        }
    }
}

/// Horizontal price marker drawn across a series (e.g. RSI 70 / 30).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceLine {
    pub price: f64,
    pub color: String,
}

/// Visible window of a time scale in logical (bar index) units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LogicalRange {
    pub from: f64,
    pub to: f64,
}

/// Candle destination of one chart.
pub trait RenderSink: Send + Sync {
    /// Bulk replace.
    fn set_data(&self, candles: &[Candle]);

    /// Single incremental point.  Rejects a point older than the last one
    /// given to this sink.
    fn update(&self, candle: &Candle) -> Result<(), FeedError>;

    /// Merged-output notification from the coordinator.
    fn handle_data_update(&self, candle: &Candle);

    /// Drop the oldest candles so that at most `count` remain.  Called when
    /// the History retention cap trims on append.
    fn retain_last(&self, count: usize);
}

pub type RangeHandler = Arc<dyn Fn(LogicalRange) + Send + Sync>;

pub trait TimeScale: Send + Sync {
    fn visible_range(&self) -> Option<LogicalRange>;
    fn set_visible_range(&self, range: LogicalRange);
    fn subscribe_range_change(&self, handler: RangeHandler) -> u64;
    fn unsubscribe_range_change(&self, id: u64);
}

pub trait ChartSurface: Send + Sync {
    fn add_series(&self, options: SeriesOptions) -> SeriesId;
    fn remove_series(&self, id: SeriesId) -> bool;
    fn set_series_data(&self, id: SeriesId, points: Vec<SeriesPoint>);
    /// Append or replace the last point; older points are rejected.
    fn update_series(&self, id: SeriesId, point: SeriesPoint) -> Result<(), FeedError>;
    fn set_series_color(&self, id: SeriesId, color: &str);
    fn add_price_line(&self, id: SeriesId, line: PriceLine);
    fn time_scale(&self) -> Arc<dyn TimeScale>;
    /// Create (or return the existing) sub-pane called `name`.
    fn create_pane(&self, name: &str, height: u32) -> Arc<dyn ChartSurface>;
    fn remove_pane(&self, name: &str) -> bool;
}
