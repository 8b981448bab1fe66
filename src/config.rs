// =============================================================================
// Application Configuration — feeds, endpoints, indicators, atomic save
// =============================================================================
//
// Loaded once at startup from `chartfeed.json` (path overridable through
// `CHARTFEED_CONFIG`), then patched by environment overrides.  Persistence uses
// an atomic tmp + rename pattern.  Every field carries a serde default so an
// older or partial file always loads.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::binance::client::DEFAULT_REST_URL;
use crate::binance::stream::DEFAULT_STREAM_URL;
use crate::feed::DEFAULT_HISTORY_LIMIT;
use crate::indicators::{
    EmaConfig, EmaIndicator, Indicator, MacdConfig, MacdIndicator, RibbonIndicator, RsiConfig,
    RsiIndicator, VolumeConfig, VolumeIndicator,
};

pub const DEFAULT_CONFIG_PATH: &str = "chartfeed.json";

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_symbols() -> Vec<String> {
    vec![
        "BTCUSDT".to_string(),
        "ETHUSDT".to_string(),
        "SOLUSDT".to_string(),
        "BNBUSDT".to_string(),
    ]
}

fn default_interval() -> String {
    "1m".to_string()
}

fn default_history_limit() -> u32 {
    DEFAULT_HISTORY_LIMIT
}

fn default_rest_base_url() -> String {
    DEFAULT_REST_URL.to_string()
}

fn default_stream_base_url() -> String {
    DEFAULT_STREAM_URL.to_string()
}

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_ema() -> Vec<EmaConfig> {
    vec![
        EmaConfig::new(9, "#ff9800"),
        EmaConfig::new(21, "#2196f3"),
        EmaConfig::new(50, "#4caf50"),
        EmaConfig::new(200, "#e91e63"),
    ]
}

fn default_rsi() -> Option<RsiConfig> {
    Some(RsiConfig::default())
}

fn default_macd() -> Option<MacdConfig> {
    Some(MacdConfig::default())
}

// =============================================================================
// IndicatorSettings
// =============================================================================

/// Indicators attached to every feed started from configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSettings {
    #[serde(default = "default_ema")]
    pub ema: Vec<EmaConfig>,

    #[serde(default = "default_rsi")]
    pub rsi: Option<RsiConfig>,

    #[serde(default = "default_macd")]
    pub macd: Option<MacdConfig>,

    /// 23-line EMA trend ribbon.  Off by default; it is heavy on the main pane.
    #[serde(default)]
    pub ribbon: bool,

    #[serde(default = "default_true")]
    pub volume: bool,
}

impl Default for IndicatorSettings {
    fn default() -> Self {
        Self {
            ema: default_ema(),
            rsi: default_rsi(),
            macd: default_macd(),
            ribbon: false,
            volume: true,
        }
    }
}

impl IndicatorSettings {
    /// Fresh, unrendered indicator instances for one chart.
    pub fn build(&self) -> Vec<Box<dyn Indicator>> {
        let mut out: Vec<Box<dyn Indicator>> = Vec::new();
        if self.volume {
            out.push(Box::new(VolumeIndicator::new(VolumeConfig::default())));
        }
        for ema in &self.ema {
            out.push(Box::new(EmaIndicator::new(ema.clone())));
        }
        if self.ribbon {
            out.push(Box::new(RibbonIndicator::new()));
        }
        if let Some(rsi) = &self.rsi {
            out.push(Box::new(RsiIndicator::new(rsi.clone())));
        }
        if let Some(macd) = &self.macd {
            out.push(Box::new(MacdIndicator::new(macd.clone())));
        }
        out
    }
}

/// One indicator requested for a running feed, e.g.
/// `{"kind": "ema", "period": 34}` or `{"kind": "ribbon"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum IndicatorSpec {
    Ema(EmaConfig),
    Rsi(RsiConfig),
    Macd(MacdConfig),
    Ribbon,
    Volume(VolumeConfig),
}

impl IndicatorSpec {
    pub fn build(&self) -> Box<dyn Indicator> {
        match self {
            Self::Ema(config) => Box::new(EmaIndicator::new(config.clone())),
            Self::Rsi(config) => Box::new(RsiIndicator::new(config.clone())),
            Self::Macd(config) => Box::new(MacdIndicator::new(config.clone())),
            Self::Ribbon => Box::new(RibbonIndicator::new()),
            Self::Volume(config) => Box::new(VolumeIndicator::new(config.clone())),
        }
    }
}

// =============================================================================
// AppConfig
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    // --- Feeds ---------------------------------------------------------------

    /// Symbols started at boot, all on `interval`.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    #[serde(default = "default_interval")]
    pub interval: String,

    /// Candles requested per historical batch.
    #[serde(default = "default_history_limit")]
    pub history_limit: u32,

    /// Optional retention cap on each History.  `None` keeps everything.
    #[serde(default)]
    pub max_history: Option<usize>,

    // --- Endpoints -----------------------------------------------------------

    #[serde(default = "default_rest_base_url")]
    pub rest_base_url: String,

    #[serde(default = "default_stream_base_url")]
    pub stream_base_url: String,

    /// Address of the HTTP / WebSocket surface.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    // --- Indicators ----------------------------------------------------------

    #[serde(default)]
    pub indicators: IndicatorSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            interval: default_interval(),
            history_limit: default_history_limit(),
            max_history: None,
            rest_base_url: default_rest_base_url(),
            stream_base_url: default_stream_base_url(),
            bind_addr: default_bind_addr(),
            request_timeout_secs: default_request_timeout_secs(),
            indicators: IndicatorSettings::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            interval = %config.interval,
            "config loaded"
        );

        Ok(config)
    }

    /// `load`, or defaults with a warning when the file is missing or bad.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "using default config");
                Self::default()
            }
        }
    }

    /// Persist to `path` atomically (write `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "config saved (atomic)");
        Ok(())
    }

    /// Copy of this config patched with `CHARTFEED_SYMBOLS`,
    /// `CHARTFEED_INTERVAL` and `CHARTFEED_BIND_ADDR` from the process
    /// environment.  `self` keeps the file values, which are what gets saved.
    pub fn with_env_overrides(&self) -> Self {
        self.with_overrides(|name| std::env::var(name).ok())
    }

    fn with_overrides(&self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut patched = self.clone();
        patched.apply_overrides(lookup);
        patched
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(symbols) = lookup("CHARTFEED_SYMBOLS") {
            let parsed: Vec<String> = symbols
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
            if parsed.is_empty() {
                warn!("CHARTFEED_SYMBOLS is empty — keeping configured symbols");
            } else {
                self.symbols = parsed;
            }
        }
        if let Some(interval) = lookup("CHARTFEED_INTERVAL") {
            let interval = interval.trim();
            if !interval.is_empty() {
                self.interval = interval.to_string();
            }
        }
        if let Some(addr) = lookup("CHARTFEED_BIND_ADDR") {
            let addr = addr.trim();
            if !addr.is_empty() {
                self.bind_addr = addr.to_string();
            }
        }
    }
}
