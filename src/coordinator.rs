// =============================================================================
// Data Coordinator — History owner and chart driver
// =============================================================================
//
// For every running key the coordinator owns exactly one History sequence and
// one chart consumer (render sink + chart surface + attached indicators).
//
//   start_feed  = load_history → seed sink and indicators → subscribe
//   on_tick     = merge → sink.handle_data_update → (closed bar) indicators
//   stop_feed   = unsubscribe → close key → drop History → destroy indicators
//
// All History mutation and every sink / indicator call happens under one
// mutex, so each event runs to completion before the next is observed and a
// closed-bar recompute always sees the History after that bar's merge.  The
// lock is never held across an await or across a registry call.
// =============================================================================

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info};

use crate::chart::{ChartSurface, ChartView, RenderSink};
use crate::feed::{FeedClient, KlineEvent, KlineListener, ListenerHandle};
use crate::indicators::Indicator;
use crate::market_data::{Candle, HistoryStore, MergeOutcome, SubscriptionKey};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoordinatorError {
    #[error("feed {0} is already running")]
    AlreadyRunning(SubscriptionKey),

    #[error("no feed running for {0}")]
    NotRunning(SubscriptionKey),
}

// =============================================================================
// ChartConsumer
// =============================================================================

/// Everything that renders one key: the candle sink, the surface indicators
/// draw on, and the indicators themselves.
pub struct ChartConsumer {
    sink: Arc<dyn RenderSink>,
    surface: Arc<dyn ChartSurface>,
    indicators: Vec<Box<dyn Indicator>>,
    listener: Option<ListenerHandle>,
}

impl ChartConsumer {
    pub fn new(sink: Arc<dyn RenderSink>, surface: Arc<dyn ChartSurface>) -> Self {
        Self {
            sink,
            surface,
            indicators: Vec::new(),
            listener: None,
        }
    }

    pub fn for_view(view: &Arc<ChartView>) -> Self {
        Self::new(view.clone(), view.surface().clone())
    }

    pub fn with_indicators(mut self, indicators: Vec<Box<dyn Indicator>>) -> Self {
        self.indicators = indicators;
        self
    }

    pub fn indicator_names(&self) -> Vec<String> {
        self.indicators.iter().map(|i| i.name()).collect()
    }

    fn seed(&mut self, history: &[Candle]) {
        self.sink.set_data(history);
        for indicator in &mut self.indicators {
            indicator.render(self.surface.clone());
            indicator.update(history);
        }
    }

    fn destroy_indicators(&mut self) {
        for indicator in &mut self.indicators {
            indicator.destroy();
        }
    }
}

// =============================================================================
// DataCoordinator
// =============================================================================

struct CoordinatorState {
    history: HistoryStore,
    consumers: HashMap<SubscriptionKey, ChartConsumer>,
}

struct CoordinatorInner {
    feed: Arc<FeedClient>,
    history_limit: u32,
    state: Mutex<CoordinatorState>,
}

/// Cheap to clone; all clones drive the same charts.
#[derive(Clone)]
pub struct DataCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl DataCoordinator {
    pub fn new(feed: Arc<FeedClient>, history_limit: u32, max_history: Option<usize>) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                feed,
                history_limit,
                state: Mutex::new(CoordinatorState {
                    history: HistoryStore::new(max_history),
                    consumers: HashMap::new(),
                }),
            }),
        }
    }

    #[cfg(test)]
    pub fn feed(&self) -> &Arc<FeedClient> {
        &self.inner.feed
    }

    /// Fetch a fresh batch and overwrite the stored History for `key` with
    /// it.  An empty batch (fetch failure) also overwrites.
    pub async fn load_history(&self, key: &SubscriptionKey) -> Vec<Candle> {
        let candles = self
            .inner
            .feed
            .fetch_history(key, self.inner.history_limit)
            .await;
        self.inner
            .state
            .lock()
            .history
            .replace(key, candles.clone());
        info!(key = %key, count = candles.len(), "history loaded");
        candles
    }

    /// Apply one live tick.  Ticks for keys that are not running are dropped.
    pub fn on_tick(&self, key: &SubscriptionKey, candle: Candle) -> Option<MergeOutcome> {
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;

        let Some(consumer) = state.consumers.get_mut(key) else {
            debug!(key = %key, time = candle.time, "tick for stopped feed dropped");
            return None;
        };

        let first_before = state.history.get(key).first().map(|c| c.time);
        let outcome = state.history.merge(key, candle);
        if outcome == MergeOutcome::Stale {
            return Some(outcome);
        }

        consumer.sink.handle_data_update(&candle);

        let history = state.history.get(key);
        // The retention cap dropped the oldest candle: realign the sink and
        // republish every per-tick series in full.
        let trimmed =
            first_before.is_some() && history.first().map(|c| c.time) != first_before;
        if trimmed {
            consumer.sink.retain_last(history.len());
        }
        for indicator in &mut consumer.indicators {
            if !indicator.follows_open_bar() {
                continue;
            }
            if trimmed {
                indicator.update(history);
            } else {
                indicator.update_last(&candle, history);
            }
        }
        if candle.closed {
            for indicator in &mut consumer.indicators {
                indicator.update(history);
            }
            debug!(key = %key, time = candle.time, len = history.len(), "closed bar recomputed");
        }
        Some(outcome)
    }

    /// Load History, seed `consumer` with it, then subscribe for live ticks.
    /// Returns the number of seeded candles.
    pub async fn start_feed(
        &self,
        key: &SubscriptionKey,
        mut consumer: ChartConsumer,
    ) -> Result<usize, CoordinatorError> {
        if self.is_running(key) {
            return Err(CoordinatorError::AlreadyRunning(key.clone()));
        }

        self.load_history(key).await;

        let seeded = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let history = state.history.get(key);
            if let Some(running) = state.consumers.get_mut(key) {
                // Started concurrently; the running chart follows the batch
                // that just replaced its History.
                running.seed(history);
                consumer.destroy_indicators();
                return Err(CoordinatorError::AlreadyRunning(key.clone()));
            }
            consumer.seed(history);
            state.consumers.insert(key.clone(), consumer);
            history.len()
        };

        let listener: Arc<dyn KlineListener> = Arc::new(TickForwarder {
            coordinator: Arc::downgrade(&self.inner),
        });
        let handle = self.inner.feed.subscribe(key, listener);

        let orphaned = {
            let mut state = self.inner.state.lock();
            match state.consumers.get_mut(key) {
                Some(consumer) => {
                    consumer.listener = Some(handle.clone());
                    false
                }
                None => true,
            }
        };
        if orphaned {
            // Stopped while we were subscribing.
            self.inner.feed.unsubscribe(&handle);
        }

        info!(key = %key, candles = seeded, "feed started");
        Ok(seeded)
    }

    /// Unsubscribe, discard History and release every indicator's output.
    /// The consumer is handed back so it can be restarted elsewhere.
    pub fn stop_feed(&self, key: &SubscriptionKey) -> Option<ChartConsumer> {
        let mut consumer = {
            let mut state = self.inner.state.lock();
            state.history.remove(key);
            state.consumers.remove(key)?
        };

        if let Some(handle) = consumer.listener.take() {
            self.inner.feed.unsubscribe(&handle);
        }
        // Listeners registered on the key outside the coordinator go too.
        if self.inner.feed.close(key) {
            debug!(key = %key, "remaining listeners force-closed");
        }
        consumer.destroy_indicators();
        info!(key = %key, "feed stopped");
        Some(consumer)
    }

    /// `stop_feed(old)` then `start_feed(new)` with the same consumer.
    pub async fn switch_interval(
        &self,
        old: &SubscriptionKey,
        new: &SubscriptionKey,
    ) -> Result<usize, CoordinatorError> {
        if self.is_running(new) {
            return Err(CoordinatorError::AlreadyRunning(new.clone()));
        }
        let consumer = self
            .stop_feed(old)
            .ok_or_else(|| CoordinatorError::NotRunning(old.clone()))?;
        info!(from = %old, to = %new, "switching interval");
        self.start_feed(new, consumer).await
    }

    /// Manual history reload: overwrite History and re-seed sink and
    /// indicators.  The live subscription is untouched.
    pub async fn reload(&self, key: &SubscriptionKey) -> Result<usize, CoordinatorError> {
        if !self.is_running(key) {
            return Err(CoordinatorError::NotRunning(key.clone()));
        }

        self.load_history(key).await;

        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        let Some(consumer) = state.consumers.get_mut(key) else {
            // Stopped while the batch was in flight.
            state.history.remove(key);
            return Err(CoordinatorError::NotRunning(key.clone()));
        };
        let history = state.history.get(key);
        consumer.seed(history);
        info!(key = %key, candles = history.len(), "history reloaded");
        Ok(history.len())
    }

    /// Render `indicator` on the key's chart and seed it from the current
    /// History.  Replaces an attached indicator with the same name.
    pub fn attach_indicator(
        &self,
        key: &SubscriptionKey,
        mut indicator: Box<dyn Indicator>,
    ) -> Result<(), CoordinatorError> {
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        let consumer = state
            .consumers
            .get_mut(key)
            .ok_or_else(|| CoordinatorError::NotRunning(key.clone()))?;

        let name = indicator.name();
        if let Some(pos) = consumer.indicators.iter().position(|i| i.name() == name) {
            let mut old = consumer.indicators.remove(pos);
            old.destroy();
        }

        indicator.render(consumer.surface.clone());
        indicator.update(state.history.get(key));
        consumer.indicators.push(indicator);
        info!(key = %key, indicator = %name, "indicator attached");
        Ok(())
    }

    /// Destroy and remove the indicator called `name`.
    pub fn detach_indicator(
        &self,
        key: &SubscriptionKey,
        name: &str,
    ) -> Result<bool, CoordinatorError> {
        let mut state = self.inner.state.lock();
        let consumer = state
            .consumers
            .get_mut(key)
            .ok_or_else(|| CoordinatorError::NotRunning(key.clone()))?;

        let Some(pos) = consumer.indicators.iter().position(|i| i.name() == name) else {
            return Ok(false);
        };
        let mut indicator = consumer.indicators.remove(pos);
        indicator.destroy();
        info!(key = %key, indicator = %name, "indicator detached");
        Ok(true)
    }

    pub fn is_running(&self, key: &SubscriptionKey) -> bool {
        self.inner.state.lock().consumers.contains_key(key)
    }

    pub fn running_keys(&self) -> Vec<SubscriptionKey> {
        let mut keys: Vec<SubscriptionKey> =
            self.inner.state.lock().consumers.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Read-only copy of the History for `key`.
    pub fn history(&self, key: &SubscriptionKey) -> Vec<Candle> {
        self.inner.state.lock().history.snapshot(key)
    }

    pub fn indicator_names(&self, key: &SubscriptionKey) -> Vec<String> {
        self.inner
            .state
            .lock()
            .consumers
            .get(key)
            .map(ChartConsumer::indicator_names)
            .unwrap_or_default()
    }

    /// Stop every running feed.
    pub fn stop_all(&self) {
        for key in self.running_keys() {
            self.stop_feed(&key);
        }
    }
}

impl std::fmt::Debug for DataCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataCoordinator")
            .field("running", &self.running_keys())
            .finish()
    }
}

/// Registry listener that routes ticks into the coordinator.  Holds a weak
/// reference so the registry never keeps a dropped coordinator alive.
struct TickForwarder {
    coordinator: Weak<CoordinatorInner>,
}

impl KlineListener for TickForwarder {
    fn on_kline(&self, event: &KlineEvent) -> anyhow::Result<()> {
        if let Some(inner) = self.coordinator.upgrade() {
            DataCoordinator { inner }.on_tick(&event.key, event.candle);
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
