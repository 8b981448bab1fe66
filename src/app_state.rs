// =============================================================================
// Application Session — chartfeed
// =============================================================================
//
// Binds the lifetime of the feed client (and its subscription registry), the
// data coordinator and the per-key chart views to one object.  `main` builds
// it once, the HTTP surface shares it through `Arc<AppState>`, and `shutdown`
// tears everything down in order: charts first, then live connections.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::info;

use crate::binance::{BinanceClient, BinanceConnector};
use crate::chart::ChartView;
use crate::config::AppConfig;
use crate::coordinator::{ChartConsumer, CoordinatorError, DataCoordinator};
use crate::feed::diagnostics::RecordingDiagnostics;
use crate::feed::{FeedClient, NoReconnect};
use crate::market_data::SubscriptionKey;

/// One row of the running-feeds listing.
#[derive(Debug, Clone, Serialize)]
pub struct FeedSummary {
    pub key: String,
    pub symbol: String,
    pub interval: String,
    pub connection_state: String,
    pub candles: usize,
    pub last_close: Option<f64>,
    pub indicators: Vec<String>,
}

pub struct AppState {
    pub config: RwLock<AppConfig>,
    pub feed: Arc<FeedClient>,
    pub coordinator: DataCoordinator,
    pub diagnostics: Arc<RecordingDiagnostics>,
    views: RwLock<HashMap<SubscriptionKey, Arc<ChartView>>>,
    pub start_time: Instant,
}

impl AppState {
    /// Build the production session: Binance REST client, WebSocket
    /// connector, no automatic reconnect.
    pub fn new(config: AppConfig) -> anyhow::Result<Self> {
        let rest = BinanceClient::new(
            config.rest_base_url.clone(),
            Duration::from_secs(config.request_timeout_secs),
        )
        .context("failed to build REST client")?;
        let connector = Arc::new(BinanceConnector::new(config.stream_base_url.clone()));
        let diagnostics = Arc::new(RecordingDiagnostics::new());
        let feed = FeedClient::new(rest, connector, Arc::new(NoReconnect), diagnostics.clone());
        Ok(Self::from_parts(config, Arc::new(feed), diagnostics))
    }

    pub fn from_parts(
        config: AppConfig,
        feed: Arc<FeedClient>,
        diagnostics: Arc<RecordingDiagnostics>,
    ) -> Self {
        let coordinator =
            DataCoordinator::new(feed.clone(), config.history_limit, config.max_history);
        Self {
            config: RwLock::new(config),
            feed,
            coordinator,
            diagnostics,
            views: RwLock::new(HashMap::new()),
            start_time: Instant::now(),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn view(&self, key: &SubscriptionKey) -> Option<Arc<ChartView>> {
        self.views.read().get(key).cloned()
    }

    // ── Feed lifecycle ──────────────────────────────────────────────────

    /// Start `key` on a fresh view carrying the configured indicators.
    pub async fn start_chart(&self, key: &SubscriptionKey) -> Result<usize, CoordinatorError> {
        let indicators = self.config.read().indicators.build();
        let view = Arc::new(ChartView::new());
        let consumer = ChartConsumer::for_view(&view).with_indicators(indicators);

        let seeded = self.coordinator.start_feed(key, consumer).await?;
        self.views.write().insert(key.clone(), view);
        Ok(seeded)
    }

    pub fn stop_chart(&self, key: &SubscriptionKey) -> bool {
        let stopped = self.coordinator.stop_feed(key).is_some();
        self.views.write().remove(key);
        stopped
    }

    /// Move the chart of `old` to `new`, keeping its view (and therefore any
    /// connected WebSocket clients).
    pub async fn switch_chart(
        &self,
        old: &SubscriptionKey,
        new: &SubscriptionKey,
    ) -> Result<usize, CoordinatorError> {
        let result = self.coordinator.switch_interval(old, new).await;

        let mut views = self.views.write();
        if !self.coordinator.is_running(old) {
            let view = views.remove(old);
            if let (Ok(_), Some(view)) = (&result, view) {
                views.insert(new.clone(), view);
            }
        }
        result
    }

    pub fn summaries(&self) -> Vec<FeedSummary> {
        self.coordinator
            .running_keys()
            .into_iter()
            .map(|key| {
                let state = self.feed.connection_state(&key);
                FeedSummary {
                    key: key.to_string(),
                    symbol: key.symbol.clone(),
                    interval: key.interval.clone(),
                    connection_state: state.to_string(),
                    candles: self.coordinator.history(&key).len(),
                    last_close: self.view(&key).and_then(|v| v.last_close()),
                    indicators: self.coordinator.indicator_names(&key),
                }
            })
            .collect()
    }

    /// Stop every chart, then close every live connection.
    pub fn shutdown(&self) {
        self.coordinator.stop_all();
        self.views.write().clear();
        self.feed.close_all();
        info!("session closed");
    }
}

// =============================================================================
// Tests
// =============================================================================
