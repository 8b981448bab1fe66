pub mod client;
pub mod rate_limit;
pub mod stream;

pub use client::BinanceClient;
pub use stream::BinanceConnector;
