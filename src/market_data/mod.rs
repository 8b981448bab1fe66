pub mod candle;
pub mod history;
pub mod kline;

// Re-export the core types for convenient access (e.g. `use crate::market_data::Candle`).
pub use candle::{Candle, SubscriptionKey};
pub use history::{HistoryStore, MergeOutcome};
