// =============================================================================
// ChartView — the main candle pane of one running feed
// =============================================================================
//
// Holds the rendered candle series, the last traded close and its direction,
// and the surface indicators draw on.  Every accepted update is also
// published on a broadcast channel for the WebSocket push.
// =============================================================================

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::chart::{MemorySurface, RenderSink, SurfaceSnapshot};
use crate::error::FeedError;
use crate::market_data::Candle;

const UPDATE_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PriceDirection {
    Up,
    Down,
    Flat,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChartSnapshot {
    pub candles: Vec<Candle>,
    pub last_close: Option<f64>,
    pub direction: PriceDirection,
    pub last_update: Option<DateTime<Utc>>,
    pub surface: SurfaceSnapshot,
}

struct ViewState {
    candles: Vec<Candle>,
    last_close: Option<f64>,
    direction: PriceDirection,
    last_update: Option<DateTime<Utc>>,
}

/// Not bound to a key: the same view is reused when its feed switches
/// interval.
pub struct ChartView {
    surface: Arc<MemorySurface>,
    state: RwLock<ViewState>,
    updates: broadcast::Sender<Candle>,
}

impl ChartView {
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            surface: Arc::new(MemorySurface::new()),
            state: RwLock::new(ViewState {
                candles: Vec::new(),
                last_close: None,
                direction: PriceDirection::Flat,
                last_update: None,
            }),
            updates,
        }
    }

    /// Surface indicators attach their series and panes to.
    pub fn surface(&self) -> &Arc<MemorySurface> {
        &self.surface
    }

    pub fn subscribe_updates(&self) -> broadcast::Receiver<Candle> {
        self.updates.subscribe()
    }

    #[cfg(test)]
    pub fn candles(&self) -> Vec<Candle> {
        self.state.read().candles.clone()
    }

    pub fn last_close(&self) -> Option<f64> {
        self.state.read().last_close
    }

    #[cfg(test)]
    pub fn direction(&self) -> PriceDirection {
        self.state.read().direction
    }

    pub fn snapshot(&self) -> ChartSnapshot {
        let state = self.state.read();
        ChartSnapshot {
            candles: state.candles.clone(),
            last_close: state.last_close,
            direction: state.direction,
            last_update: state.last_update,
            surface: self.surface.snapshot(),
        }
    }
}

impl Default for ChartView {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderSink for ChartView {
    fn set_data(&self, candles: &[Candle]) {
        let mut state = self.state.write();
        state.candles = candles.to_vec();
        state.last_close = candles.last().map(|c| c.close);
        state.direction = PriceDirection::Flat;
        state.last_update = Some(Utc::now());
        debug!(count = candles.len(), "chart data replaced");
    }

    fn update(&self, candle: &Candle) -> Result<(), FeedError> {
        let mut state = self.state.write();
        match state.candles.last().map(|c| c.time) {
            Some(last) if candle.time < last => {
                return Err(FeedError::Sink(format!(
                    "candle time {} older than last {last}",
                    candle.time
                )));
            }
            Some(last) if candle.time == last => {
                if let Some(slot) = state.candles.last_mut() {
                    *slot = *candle;
                }
            }
            _ => state.candles.push(*candle),
        }
        Ok(())
    }

    fn handle_data_update(&self, candle: &Candle) {
        if let Err(e) = self.update(candle) {
            warn!(error = %e, "chart update rejected");
            return;
        }

        {
            let mut state = self.state.write();
            state.direction = match state.last_close {
                Some(prev) if candle.close > prev => PriceDirection::Up,
                Some(prev) if candle.close < prev => PriceDirection::Down,
                _ => PriceDirection::Flat,
            };
            state.last_close = Some(candle.close);
            state.last_update = Some(Utc::now());
        }

        // No WebSocket clients is the common case.
        let _ = self.updates.send(*candle);
    }

    fn retain_last(&self, count: usize) {
        let mut state = self.state.write();
        if state.candles.len() > count {
            let excess = state.candles.len() - count;
            state.candles.drain(..excess);
        }
    }
}
