// =============================================================================
// In-memory chart surface and time scale
// =============================================================================

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::debug;

use crate::chart::{
    ChartSurface, LogicalRange, PriceLine, RangeHandler, SeriesId, SeriesOptions, SeriesPoint,
    TimeScale,
};
use crate::error::FeedError;

// ---------------------------------------------------------------------------
// MemoryTimeScale
// ---------------------------------------------------------------------------

/// Time scale that notifies every subscriber on every `set_visible_range`,
/// synchronously, even when the range did not change.
#[derive(Default)]
pub struct MemoryTimeScale {
    range: Mutex<Option<LogicalRange>>,
    handlers: Mutex<Vec<(u64, RangeHandler)>>,
    next_id: AtomicU64,
    notifications: AtomicU64,
}

impl MemoryTimeScale {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn handler_count(&self) -> usize {
        self.handlers.lock().len()
    }

    /// Total handler invocations so far.
    #[cfg(test)]
    pub fn notifications(&self) -> u64 {
        self.notifications.load(Ordering::Relaxed)
    }
}

impl TimeScale for MemoryTimeScale {
    fn visible_range(&self) -> Option<LogicalRange> {
        *self.range.lock()
    }

    fn set_visible_range(&self, range: LogicalRange) {
        *self.range.lock() = Some(range);
        let handlers: Vec<RangeHandler> =
            self.handlers.lock().iter().map(|(_, h)| h.clone()).collect();
        for handler in handlers {
            self.notifications.fetch_add(1, Ordering::Relaxed);
            handler(range);
        }
    }

    fn subscribe_range_change(&self, handler: RangeHandler) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers.lock().push((id, handler));
        id
    }

    fn unsubscribe_range_change(&self, id: u64) {
        self.handlers.lock().retain(|(hid, _)| *hid != id);
    }
}

// ---------------------------------------------------------------------------
// MemorySurface
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct SeriesSnapshot {
    pub id: SeriesId,
    pub options: SeriesOptions,
    pub points: Vec<SeriesPoint>,
    pub price_lines: Vec<PriceLine>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PaneSnapshot {
    pub name: String,
    pub height: u32,
    pub surface: SurfaceSnapshot,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SurfaceSnapshot {
    pub series: Vec<SeriesSnapshot>,
    pub panes: Vec<PaneSnapshot>,
}

struct SeriesRecord {
    options: SeriesOptions,
    points: Vec<SeriesPoint>,
    price_lines: Vec<PriceLine>,
}

struct Pane {
    height: u32,
    surface: Arc<MemorySurface>,
}

/// Chart surface that keeps every series in memory.
pub struct MemorySurface {
    series: RwLock<BTreeMap<SeriesId, SeriesRecord>>,
    panes: RwLock<BTreeMap<String, Pane>>,
    time_scale: Arc<MemoryTimeScale>,
    next_id: AtomicU64,
}

impl MemorySurface {
    pub fn new() -> Self {
        Self {
            series: RwLock::new(BTreeMap::new()),
            panes: RwLock::new(BTreeMap::new()),
            time_scale: Arc::new(MemoryTimeScale::new()),
            next_id: AtomicU64::new(1),
        }
    }

    #[cfg(test)]
    pub fn memory_time_scale(&self) -> &Arc<MemoryTimeScale> {
        &self.time_scale
    }

    #[cfg(test)]
    pub fn series_count(&self) -> usize {
        self.series.read().len()
    }

    #[cfg(test)]
    pub fn points(&self, id: SeriesId) -> Option<Vec<SeriesPoint>> {
        self.series.read().get(&id).map(|s| s.points.clone())
    }

    #[cfg(test)]
    pub fn price_lines(&self, id: SeriesId) -> Vec<PriceLine> {
        self.series
            .read()
            .get(&id)
            .map(|s| s.price_lines.clone())
            .unwrap_or_default()
    }

    #[cfg(test)]
    pub fn pane(&self, name: &str) -> Option<Arc<MemorySurface>> {
        self.panes.read().get(name).map(|p| p.surface.clone())
    }

    #[cfg(test)]
    pub fn pane_names(&self) -> Vec<String> {
        self.panes.read().keys().cloned().collect()
    }

    pub fn snapshot(&self) -> SurfaceSnapshot {
        let series = self
            .series
            .read()
            .iter()
            .map(|(id, s)| SeriesSnapshot {
                id: *id,
                options: s.options.clone(),
                points: s.points.clone(),
                price_lines: s.price_lines.clone(),
            })
            .collect();
        let panes = self
            .panes
            .read()
            .iter()
            .map(|(name, p)| PaneSnapshot {
                name: name.clone(),
                height: p.height,
                surface: p.surface.snapshot(),
            })
            .collect();
        SurfaceSnapshot { series, panes }
    }
}

impl Default for MemorySurface {
    fn default() -> Self {
        Self::new()
    }
}

impl ChartSurface for MemorySurface {
    fn add_series(&self, options: SeriesOptions) -> SeriesId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(id, title = %options.title, "series added");
        self.series.write().insert(
            id,
            SeriesRecord {
                options,
                points: Vec::new(),
                price_lines: Vec::new(),
            },
        );
        id
    }

    fn remove_series(&self, id: SeriesId) -> bool {
        self.series.write().remove(&id).is_some()
    }

    fn set_series_data(&self, id: SeriesId, points: Vec<SeriesPoint>) {
        if let Some(series) = self.series.write().get_mut(&id) {
            series.points = points;
        }
    }

    fn update_series(&self, id: SeriesId, point: SeriesPoint) -> Result<(), FeedError> {
        let mut map = self.series.write();
        let series = map
            .get_mut(&id)
            .ok_or_else(|| FeedError::Sink(format!("unknown series {id}")))?;

        match series.points.last().map(|p| p.time) {
            Some(last) if point.time < last => Err(FeedError::Sink(format!(
                "series {id}: point time {} older than last {last}",
                point.time
            ))),
            Some(last) if point.time == last => {
                if let Some(slot) = series.points.last_mut() {
                    *slot = point;
                }
                Ok(())
            }
            _ => {
                series.points.push(point);
                Ok(())
            }
        }
    }

    fn set_series_color(&self, id: SeriesId, color: &str) {
        if let Some(series) = self.series.write().get_mut(&id) {
            series.options.color = Some(color.to_string());
        }
    }

    fn add_price_line(&self, id: SeriesId, line: PriceLine) {
        if let Some(series) = self.series.write().get_mut(&id) {
            series.price_lines.push(line);
        }
    }

    fn time_scale(&self) -> Arc<dyn TimeScale> {
        self.time_scale.clone()
    }

    fn create_pane(&self, name: &str, height: u32) -> Arc<dyn ChartSurface> {
        let mut panes = self.panes.write();
        let pane = panes.entry(name.to_string()).or_insert_with(|| Pane {
            height,
            surface: Arc::new(MemorySurface::new()),
        });
        pane.surface.clone()
    }

    fn remove_pane(&self, name: &str) -> bool {
        self.panes.write().remove(name).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chart::SeriesKind;

    #[test]
    fn update_series_appends_replaces_and_rejects_older() {
        let surface = MemorySurface::new();
        let id = surface.add_series(SeriesOptions::line("ema", Some("orange"), 2));
        surface.set_series_data(id, vec![SeriesPoint::new(0, Some(1.0))]);

        surface.update_series(id, SeriesPoint::new(60, Some(2.0))).unwrap();
        surface.update_series(id, SeriesPoint::new(60, Some(3.0))).unwrap();
        assert!(surface.update_series(id, SeriesPoint::new(0, Some(9.0))).is_err());

        let points = surface.points(id).unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[1].value, Some(3.0));
    }

    #[test]
    fn panes_are_created_once_and_snapshotted() {
        let surface = MemorySurface::new();
        let a = surface.create_pane("rsi", 120);
        let b = surface.create_pane("rsi", 300);
        a.add_series(SeriesOptions::histogram("bars", None));
        assert_eq!(surface.pane_names(), vec!["rsi".to_string()]);
        assert_eq!(surface.pane("rsi").unwrap().series_count(), 1);
        drop(b);

        let snap = surface.snapshot();
        assert_eq!(snap.panes[0].height, 120);
        assert_eq!(snap.panes[0].surface.series[0].options.kind, SeriesKind::Histogram);
        assert!(surface.remove_pane("rsi"));
        assert!(!surface.remove_pane("rsi"));
    }

    #[test]
    fn time_scale_notifies_on_every_set() {
        let scale = MemoryTimeScale::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let id = scale.subscribe_range_change(Arc::new(move |r| sink.lock().push(r)));

        let r = LogicalRange { from: 0.0, to: 10.0 };
        scale.set_visible_range(r);
        scale.set_visible_range(r);
        assert_eq!(seen.lock().len(), 2);
        assert_eq!(scale.visible_range(), Some(r));

        scale.unsubscribe_range_change(id);
        scale.set_visible_range(r);
        assert_eq!(seen.lock().len(), 2);
        assert_eq!(scale.handler_count(), 0);
    }
}
