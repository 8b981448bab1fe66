// =============================================================================
// Binance REST API Client — public market-data endpoints
// =============================================================================
//
// Only unsigned endpoints are used: `exchangeInfo` for symbol validation and
// `klines` for the historical batch.  Every response feeds the request-weight
// tracker before its body is inspected.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, instrument};

use crate::binance::rate_limit::{RateLimitTracker, EXCHANGE_INFO_WEIGHT, KLINES_WEIGHT};
use crate::error::FeedError;
use crate::market_data::kline::parse_history_rows;
use crate::market_data::Candle;

pub const DEFAULT_REST_URL: &str = "https://api.binance.com";

/// Binance REST client for public market data.
#[derive(Clone)]
pub struct BinanceClient {
    base_url: String,
    client: reqwest::Client,
    rate_limit: Arc<RateLimitTracker>,
}

impl BinanceClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// Create a client against `base_url` (no trailing slash required).
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, FeedError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let base_url = base_url.into().trim_end_matches('/').to_string();

        debug!(base_url = %base_url, "BinanceClient initialised");

        Ok(Self {
            base_url,
            client,
            rate_limit: Arc::new(RateLimitTracker::new()),
        })
    }

    pub fn rate_limit(&self) -> &Arc<RateLimitTracker> {
        &self.rate_limit
    }

    // -------------------------------------------------------------------------
    // Public market data
    // -------------------------------------------------------------------------

    /// GET /api/v3/klines.
    ///
    /// Returns the parsed batch oldest-first with `time` in seconds.
    #[instrument(skip(self), name = "binance::get_klines")]
    pub async fn get_klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: u32,
    ) -> Result<Vec<Candle>, FeedError> {
        let limit = limit.to_string();
        let query = [("symbol", symbol), ("interval", interval), ("limit", &limit)];
        let (status, body) = self
            .get_json("/api/v3/klines", &query, KLINES_WEIGHT)
            .await?;

        if !status.is_success() {
            return Err(FeedError::Status {
                status: status.as_u16(),
                body: body.to_string(),
            });
        }

        let candles = parse_history_rows(&body)?;
        debug!(symbol, interval, count = candles.len(), "klines fetched");
        Ok(candles)
    }

    /// GET /api/v3/exchangeInfo filtered by symbol.
    ///
    /// `Ok(())` when the exchange lists the symbol; `Err(InvalidSymbol)` when
    /// it answers 400 or omits it from the listing.
    #[instrument(skip(self), name = "binance::check_symbol")]
    pub async fn check_symbol(&self, symbol: &str) -> Result<(), FeedError> {
        let (status, body) = self
            .get_json("/api/v3/exchangeInfo", &[("symbol", symbol)], EXCHANGE_INFO_WEIGHT)
            .await?;

        if status == reqwest::StatusCode::BAD_REQUEST {
            return Err(FeedError::InvalidSymbol(symbol.to_string()));
        }
        if !status.is_success() {
            return Err(FeedError::Status {
                status: status.as_u16(),
                body: body.to_string(),
            });
        }

        let listed = body["symbols"]
            .as_array()
            .ok_or_else(|| FeedError::Malformed("exchangeInfo missing 'symbols' array".into()))?
            .iter()
            .filter_map(|s| s["symbol"].as_str())
            .any(|s| s.eq_ignore_ascii_case(symbol));

        if listed {
            debug!(symbol, "symbol listed on exchange");
            Ok(())
        } else {
            Err(FeedError::InvalidSymbol(symbol.to_string()))
        }
    }

    // -------------------------------------------------------------------------
    // Internal helpers
    // -------------------------------------------------------------------------

    /// Query values are percent-encoded by reqwest, never spliced into the URL.
    async fn get_json(
        &self,
        path: &str,
        query: &[(&str, &str)],
        weight: u32,
    ) -> Result<(reqwest::StatusCode, Value), FeedError> {
        self.rate_limit.check(weight)?;

        let url = format!("{}{}", self.base_url, path);
        let resp = self.client.get(&url).query(query).send().await?;

        self.rate_limit.update_from_headers(resp.headers());

        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .map_err(|e| FeedError::Malformed(format!("response from {path}: {e}")))?;

        Ok((status, body))
    }
}

impl std::fmt::Debug for BinanceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceClient")
            .field("base_url", &self.base_url)
            .field("rate_limit", &self.rate_limit)
            .finish()
    }
}
