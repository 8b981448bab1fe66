// =============================================================================
// Volume Histogram
// =============================================================================
//
// Pass-through formatter: one bar per candle, value = volume, coloured by the
// candle's own direction.  Drawn in its own pane.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::chart::{ChartSurface, SeriesId, SeriesOptions, SeriesPoint};
use crate::indicators::Indicator;
use crate::market_data::Candle;

pub const UP_COLOR: &str = "#26a69a";
pub const DOWN_COLOR: &str = "#ef5350";
const PANE_NAME: &str = "volume";

pub fn volume_bar(candle: &Candle) -> SeriesPoint {
    let color = if candle.is_up() { UP_COLOR } else { DOWN_COLOR };
    SeriesPoint::colored(candle.time, Some(candle.volume), color)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeConfig {
    #[serde(default = "default_height")]
    pub height: u32,
}

fn default_height() -> u32 {
    120
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            height: default_height(),
        }
    }
}

pub struct VolumeIndicator {
    config: VolumeConfig,
    host: Option<Arc<dyn ChartSurface>>,
    pane: Option<(Arc<dyn ChartSurface>, SeriesId)>,
}

impl VolumeIndicator {
    pub fn new(config: VolumeConfig) -> Self {
        Self {
            config,
            host: None,
            pane: None,
        }
    }
}

impl Indicator for VolumeIndicator {
    fn name(&self) -> String {
        PANE_NAME.to_string()
    }

    fn render(&mut self, surface: Arc<dyn ChartSurface>) {
        if self.pane.is_some() {
            return;
        }
        let pane = surface.create_pane(PANE_NAME, self.config.height);
        let id = pane.add_series(SeriesOptions::histogram("Volume", None));
        self.pane = Some((pane, id));
        self.host = Some(surface);
    }

    fn update(&mut self, history: &[Candle]) {
        let Some((pane, id)) = &self.pane else {
            return;
        };
        pane.set_series_data(*id, history.iter().map(volume_bar).collect());
    }

    fn follows_open_bar(&self) -> bool {
        true
    }

    fn update_last(&mut self, candle: &Candle, _history: &[Candle]) {
        let Some((pane, id)) = &self.pane else {
            return;
        };
        if let Err(e) = pane.update_series(*id, volume_bar(candle)) {
            warn!(error = %e, "volume bar rejected");
        }
    }

    fn destroy(&mut self) {
        self.pane = None;
        if let Some(host) = self.host.take() {
            host.remove_pane(PANE_NAME);
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

    #[test]
    fn bars_follow_candle_direction() {
        let up = Candle::new(0, 1.0, 2.0, 1.0, 2.0, 7.5);
        let flat = Candle::new(60, 2.0, 2.0, 2.0, 2.0, 1.0);
        let down = Candle::new(120, 2.0, 2.0, 1.0, 1.0, 3.0);
        assert_eq!(volume_bar(&up), SeriesPoint::colored(0, Some(7.5), UP_COLOR));
        assert_eq!(volume_bar(&flat).color.as_deref(), Some(UP_COLOR));
        assert_eq!(volume_bar(&down).color.as_deref(), Some(DOWN_COLOR));
    }

    #[test]
    fn update_last_pushes_single_bar() {
        let surface = Arc::new(MemorySurface::new());
        let mut volume = VolumeIndicator::new(VolumeConfig::default());
        volume.render(surface.clone());
        let history = vec![
            Candle::new(0, 1.0, 2.0, 1.0, 2.0, 5.0),
            Candle::new(60, 2.0, 2.0, 1.0, 1.0, 6.0),
        ];
        volume.update(&history);
        volume.update_last(&Candle::new(60, 2.0, 3.0, 1.0, 3.0, 9.0), &history);

        let pane = surface.pane("volume").unwrap();
        let snap = pane.snapshot();
        let points = &snap.series[0].points;
        assert_eq!(points.len(), 2);
        assert_eq!(points[1].value, Some(9.0));
        assert_eq!(points[1].color.as_deref(), Some(UP_COLOR));

        volume.destroy();
        volume.destroy();
        assert!(surface.pane("volume").is_none());
    }

    #[test]
    fn empty_history_clears_bars() {
        let surface = Arc::new(MemorySurface::new());
        let mut volume = VolumeIndicator::new(VolumeConfig::default());
        volume.render(surface.clone());
        volume.update(&[Candle::new(0, 1.0, 2.0, 1.0, 2.0, 5.0)]);
        volume.update(&[]);
        let pane = surface.pane("volume").unwrap();
        assert!(pane.snapshot().series[0].points.is_empty());
    }
}
