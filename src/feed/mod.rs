// =============================================================================
// Feed Client — exchange metadata, historical batches, live multiplexing
// =============================================================================
//
// Failure policy: nothing here raises.  `validate_symbol` fails closed
// (`false`), `fetch_history` degrades to an empty batch, and live-stream
// faults are handled per frame / per listener inside the registry.  Every
// degraded path is reported to the injected diagnostics sink.
// =============================================================================

pub mod diagnostics;
pub mod registry;

use std::sync::Arc;

use tracing::{debug, info};

use crate::binance::client::BinanceClient;
use crate::feed::diagnostics::Diagnostics;
use crate::market_data::{Candle, SubscriptionKey};

pub use registry::{
    ConnectionState, KlineEvent, KlineListener, ListenerHandle, NoReconnect, ReconnectPolicy,
    StreamConnector, SubscriptionRegistry,
};

/// Default number of candles requested per historical batch.
pub const DEFAULT_HISTORY_LIMIT: u32 = 500;

pub struct FeedClient {
    rest: BinanceClient,
    registry: SubscriptionRegistry,
    diagnostics: Arc<dyn Diagnostics>,
}

impl FeedClient {
    pub fn new(
        rest: BinanceClient,
        connector: Arc<dyn StreamConnector>,
        reconnect: Arc<dyn ReconnectPolicy>,
        diagnostics: Arc<dyn Diagnostics>,
    ) -> Self {
        let registry = SubscriptionRegistry::new(connector, reconnect, diagnostics.clone());
        Self {
            rest,
            registry,
            diagnostics,
        }
    }

    pub fn rest(&self) -> &BinanceClient {
        &self.rest
    }

    #[cfg(test)]
    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    /// Whether the exchange lists `symbol`.  Any failure answers `false`.
    pub async fn validate_symbol(&self, symbol: &str) -> bool {
        let symbol = symbol.trim().to_uppercase();
        match self.rest.check_symbol(&symbol).await {
            Ok(()) => true,
            Err(e) => {
                self.diagnostics
                    .report(&format!("validate_symbol {symbol}"), &e);
                false
            }
        }
    }

    /// One-shot historical batch, oldest first.  Empty on any failure; never
    /// partial.
    pub async fn fetch_history(&self, key: &SubscriptionKey, limit: u32) -> Vec<Candle> {
        match self.rest.get_klines(&key.symbol, &key.interval, limit).await {
            Ok(candles) => {
                debug!(key = %key, count = candles.len(), "history batch fetched");
                candles
            }
            Err(e) => {
                self.diagnostics.report(&format!("fetch_history {key}"), &e);
                Vec::new()
            }
        }
    }

    pub fn subscribe(
        &self,
        key: &SubscriptionKey,
        listener: Arc<dyn KlineListener>,
    ) -> ListenerHandle {
        self.registry.subscribe(key, listener)
    }

    pub fn unsubscribe(&self, handle: &ListenerHandle) -> bool {
        self.registry.unsubscribe(handle)
    }

    pub fn close(&self, key: &SubscriptionKey) -> bool {
        self.registry.close(key)
    }

    pub fn close_all(&self) {
        info!("closing all live feeds");
        self.registry.close_all();
    }

    pub fn connection_state(&self, key: &SubscriptionKey) -> ConnectionState {
        self.registry.state(key)
    }
}

impl std::fmt::Debug for FeedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedClient")
            .field("rest", &self.rest)
            .field("registry", &self.registry)
            .finish()
    }
}
