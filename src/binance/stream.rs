// =============================================================================
// Kline WebSocket Connector
// =============================================================================
//
// One spawned task per live connection.  The task connects to
// `{base}/{symbol}@kline_{interval}`, reports the handshake, forwards every
// text frame to the registry, and reports the close.  Closing from our side
// (last unsubscribe, force close) signals the task through a oneshot channel;
// dropping the handle has the same effect.
// =============================================================================

use futures_util::{SinkExt, StreamExt};
use tokio::sync::oneshot;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::error::FeedError;
use crate::feed::registry::{ConnectionLink, LiveConnection, StreamConnector};
use crate::market_data::SubscriptionKey;

pub const DEFAULT_STREAM_URL: &str = "wss://stream.binance.com:9443/ws";

/// Opens Binance single-stream kline sockets.
#[derive(Debug, Clone)]
pub struct BinanceConnector {
    base_url: String,
}

impl BinanceConnector {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn stream_url(&self, key: &SubscriptionKey) -> String {
        format!("{}/{}", self.base_url, key.stream_name())
    }
}

impl Default for BinanceConnector {
    fn default() -> Self {
        Self::new(DEFAULT_STREAM_URL)
    }
}

impl StreamConnector for BinanceConnector {
    fn connect(&self, key: &SubscriptionKey, link: ConnectionLink) -> Box<dyn LiveConnection> {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            let err = FeedError::Transport("no async runtime to drive the socket".into());
            link.report(&err);
            link.closed(&err.to_string());
            return Box::new(StreamConnection { shutdown: None });
        };

        let url = self.stream_url(key);
        runtime.spawn(run_kline_stream(url, link, shutdown_rx));

        Box::new(StreamConnection {
            shutdown: Some(shutdown_tx),
        })
    }
}

/// Handle to a spawned socket task.
pub struct StreamConnection {
    shutdown: Option<oneshot::Sender<()>>,
}

impl LiveConnection for StreamConnection {
    fn close(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            // The task may already be gone; that is fine.
            let _ = tx.send(());
        }
    }
}

/// Drive one kline socket until it closes from either side.
async fn run_kline_stream(
    url: String,
    link: ConnectionLink,
    mut shutdown: oneshot::Receiver<()>,
) {
    let key = link.key().clone();
    info!(url = %url, key = %key, "connecting to kline WebSocket");

    let connected = tokio::select! {
        res = connect_async(url.as_str()) => res,
        _ = &mut shutdown => {
            debug!(key = %key, "closed before handshake completed");
            return;
        }
    };

    let ws_stream = match connected {
        Ok((ws_stream, _response)) => ws_stream,
        Err(e) => {
            let err = FeedError::from(e);
            link.report(&err);
            link.closed(&err.to_string());
            return;
        }
    };

    link.opened();
    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                if let Err(e) = write.send(Message::Close(None)).await {
                    debug!(key = %key, error = %e, "close frame not delivered");
                }
                info!(key = %key, "kline WebSocket closed locally");
                return;
            }
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    link.frame(&text);
                }
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame
                        .map(|f| format!("remote close: {}", f.reason))
                        .unwrap_or_else(|| "remote close".to_string());
                    link.closed(&reason);
                    return;
                }
                // Ping / Pong / Binary: tungstenite answers pings itself.
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    let err = FeedError::from(e);
                    link.report(&err);
                    link.closed(&err.to_string());
                    return;
                }
                None => {
                    warn!(key = %key, "kline WebSocket stream ended");
                    link.closed("stream ended");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::diagnostics::RecordingDiagnostics;
    use crate::feed::registry::tests::kline_frame;
    use crate::feed::registry::{
        ConnectionState, KlineEvent, KlineListener, NoReconnect, SubscriptionRegistry,
    };
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::TcpListener;

    /// Local stand-in for the kline stream: accepts one socket, sends
    /// `frames`, then closes.
    async fn spawn_stream_server(frames: Vec<String>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            // Give the client time to register its listeners.
            tokio::time::sleep(Duration::from_millis(50)).await;
            for frame in frames {
                ws.send(Message::Text(frame)).await.unwrap();
            }
            let _ = ws.close(None).await;
        });
        format!("ws://{addr}/ws")
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..100 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[test]
    fn stream_url_uses_lowercase_stream_name() {
        let c = BinanceConnector::new("wss://stream.binance.com:9443/ws/");
        let key = SubscriptionKey::new("BTCUSDT", "5m");
        assert_eq!(
            c.stream_url(&key),
            "wss://stream.binance.com:9443/ws/btcusdt@kline_5m"
        );
    }

    #[tokio::test]
    async fn socket_frames_fan_out_then_remote_close_releases_key() {
        let frames = vec![
            kline_frame(60_000, 100.0, false),
            "garbage".to_string(),
            kline_frame(60_000, 101.0, true),
        ];
        let base = spawn_stream_server(frames).await;
        let diag = Arc::new(RecordingDiagnostics::new());
        let registry = SubscriptionRegistry::new(
            Arc::new(BinanceConnector::new(base)),
            Arc::new(NoReconnect),
            diag.clone(),
        );
        let key = SubscriptionKey::new("BTCUSDT", "1m");

        let seen_a: Arc<Mutex<Vec<KlineEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_b: Arc<Mutex<Vec<KlineEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let (a, b) = (seen_a.clone(), seen_b.clone());
        let la: Arc<dyn KlineListener> = Arc::new(move |e: &KlineEvent| -> anyhow::Result<()> {
            a.lock().push(e.clone());
            Ok(())
        });
        let lb: Arc<dyn KlineListener> = Arc::new(move |e: &KlineEvent| -> anyhow::Result<()> {
            b.lock().push(e.clone());
            Ok(())
        });
        registry.subscribe(&key, la);
        registry.subscribe(&key, lb);

        wait_until(|| registry.state(&key) == ConnectionState::Idle).await;

        let a = seen_a.lock().clone();
        assert_eq!(a.len(), 2);
        assert_eq!(a, *seen_b.lock());
        assert!(a[1].candle.closed);
        assert_eq!(registry.listener_count(&key), 0);
        assert_eq!(diag.count_of(crate::error::ErrorKind::Malformed), 1);
    }

    #[tokio::test]
    async fn refused_connection_releases_key() {
        let diag = Arc::new(RecordingDiagnostics::new());
        let registry = SubscriptionRegistry::new(
            Arc::new(BinanceConnector::new("ws://127.0.0.1:9/ws")),
            Arc::new(NoReconnect),
            diag.clone(),
        );
        let key = SubscriptionKey::new("BTCUSDT", "1m");
        let noop: Arc<dyn KlineListener> = Arc::new(|_: &KlineEvent| -> anyhow::Result<()> { Ok(()) });
        registry.subscribe(&key, noop);

        wait_until(|| registry.state(&key) == ConnectionState::Idle).await;
        assert_eq!(registry.state(&key), ConnectionState::Idle);
        assert_eq!(diag.count_of(crate::error::ErrorKind::Transport), 1);
    }
}
