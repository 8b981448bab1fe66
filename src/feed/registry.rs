// =============================================================================
// Subscription Registry — one live connection per key, many listeners
// =============================================================================
//
// Per key the connection moves through:
//
//   IDLE ──subscribe──▶ CONNECTING ──opened──▶ OPEN
//                           │                   │
//                           └──error / remote close / close / last unsubscribe──▶ CLOSED
//
// CLOSED is never left automatically.  The reconnect policy is consulted on
// every transport-initiated close; the default (`NoReconnect`) releases all
// per-key state at once, after which the key reports IDLE again.
//
// Fan-out is synchronous: listeners are snapshotted under the lock, the lock
// is released, then every listener is called in registration order.  A
// listener that errors or panics is reported and skipped.  Known hazard: a
// frame already being delivered can still reach a listener that unsubscribes
// concurrently.
//
// Every connection carries a generation number.  Notifications from a stale
// generation (a socket that was already replaced or torn down) are ignored.
// =============================================================================

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::FeedError;
use crate::feed::diagnostics::Diagnostics;
use crate::market_data::kline::parse_stream_frame;
use crate::market_data::{Candle, SubscriptionKey};

// =============================================================================
// Public types
// =============================================================================

/// One parsed kline delivered to every listener of a key.
#[derive(Debug, Clone, PartialEq)]
pub struct KlineEvent {
    pub key: SubscriptionKey,
    pub candle: Candle,
}

/// Receiver of parsed klines for one key.
pub trait KlineListener: Send + Sync {
    fn on_kline(&self, event: &KlineEvent) -> anyhow::Result<()>;
}

impl<F> KlineListener for F
where
    F: Fn(&KlineEvent) -> anyhow::Result<()> + Send + Sync,
{
    fn on_kline(&self, event: &KlineEvent) -> anyhow::Result<()> {
        self(event)
    }
}

/// Returned by `subscribe`; pass it back to `unsubscribe` to detach.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ListenerHandle {
    key: SubscriptionKey,
    id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "IDLE"),
            Self::Connecting => write!(f, "CONNECTING"),
            Self::Open => write!(f, "OPEN"),
            Self::Closed => write!(f, "CLOSED"),
        }
    }
}

/// A transport-level connection owned by the registry.
pub trait LiveConnection: Send {
    /// Tear the connection down.  Must be safe to call more than once.
    fn close(&mut self);
}

/// Opens live connections.  Implementations report back through the
/// [`ConnectionLink`]; they must not block inside `connect`.
pub trait StreamConnector: Send + Sync {
    fn connect(&self, key: &SubscriptionKey, link: ConnectionLink) -> Box<dyn LiveConnection>;
}

/// Hook consulted whenever the transport closes a connection on its own.
///
/// `attempt` counts consecutive closes since the key was last OPEN.
/// Returning `Some(delay)` keeps the listeners and reopens after `delay`;
/// `None` releases the key.
pub trait ReconnectPolicy: Send + Sync {
    fn on_closed(&self, key: &SubscriptionKey, attempt: u32) -> Option<Duration>;
}

/// Never reconnect; a closed key must be subscribed again explicitly.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoReconnect;

impl ReconnectPolicy for NoReconnect {
    fn on_closed(&self, _key: &SubscriptionKey, _attempt: u32) -> Option<Duration> {
        None
    }
}

// =============================================================================
// Internal state
// =============================================================================

struct Subscription {
    listeners: Vec<(u64, Arc<dyn KlineListener>)>,
    state: ConnectionState,
    generation: u64,
    connection: Option<Box<dyn LiveConnection>>,
    reconnect_attempts: u32,
}

impl Subscription {
    fn idle() -> Self {
        Self {
            listeners: Vec::new(),
            state: ConnectionState::Idle,
            generation: 0,
            connection: None,
            reconnect_attempts: 0,
        }
    }
}

struct RegistryInner {
    subscriptions: Mutex<HashMap<SubscriptionKey, Subscription>>,
    connector: Arc<dyn StreamConnector>,
    reconnect: Arc<dyn ReconnectPolicy>,
    diagnostics: Arc<dyn Diagnostics>,
    next_listener_id: AtomicU64,
    next_generation: AtomicU64,
}

// =============================================================================
// SubscriptionRegistry
// =============================================================================

/// Owned registry of keyed listener sets and their live connections.
///
/// Cheap to clone; all clones share the same registry.  Its lifetime is the
/// application session: call [`close_all`](Self::close_all) on shutdown.
#[derive(Clone)]
pub struct SubscriptionRegistry {
    inner: Arc<RegistryInner>,
}

impl SubscriptionRegistry {
    pub fn new(
        connector: Arc<dyn StreamConnector>,
        reconnect: Arc<dyn ReconnectPolicy>,
        diagnostics: Arc<dyn Diagnostics>,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                subscriptions: Mutex::new(HashMap::new()),
                connector,
                reconnect,
                diagnostics,
                next_listener_id: AtomicU64::new(1),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    /// Register `listener` under `key`.  The first listener of a key opens
    /// its single live connection; later listeners share it.
    pub fn subscribe(
        &self,
        key: &SubscriptionKey,
        listener: Arc<dyn KlineListener>,
    ) -> ListenerHandle {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);

        let open_generation = {
            let mut subs = self.inner.subscriptions.lock();
            let sub = subs.entry(key.clone()).or_insert_with(Subscription::idle);
            sub.listeners.push((id, listener));
            debug!(key = %key, listener = id, listeners = sub.listeners.len(), "listener added");

            match sub.state {
                ConnectionState::Idle | ConnectionState::Closed => {
                    Some(self.begin_connecting(sub))
                }
                ConnectionState::Connecting | ConnectionState::Open => None,
            }
        };

        if let Some(generation) = open_generation {
            self.open(key, generation);
        }

        ListenerHandle {
            key: key.clone(),
            id,
        }
    }

    /// Detach a listener.  Removing the last listener closes the connection
    /// and drops every piece of per-key state immediately.
    ///
    /// Returns `false` if the handle was not registered.
    pub fn unsubscribe(&self, handle: &ListenerHandle) -> bool {
        let (removed, connection) = {
            let mut subs = self.inner.subscriptions.lock();
            let Some(sub) = subs.get_mut(&handle.key) else {
                return false;
            };

            let before = sub.listeners.len();
            sub.listeners.retain(|(id, _)| *id != handle.id);
            let removed = sub.listeners.len() != before;

            let connection = if removed && sub.listeners.is_empty() {
                subs.remove(&handle.key).and_then(|s| s.connection)
            } else {
                None
            };
            (removed, connection)
        };

        if let Some(mut connection) = connection {
            connection.close();
            info!(key = %handle.key, "last listener removed — connection closed");
        }
        removed
    }

    /// Force-close `key` regardless of its listener count.
    pub fn close(&self, key: &SubscriptionKey) -> bool {
        let removed = self.inner.subscriptions.lock().remove(key);
        match removed {
            Some(sub) => {
                if let Some(mut connection) = sub.connection {
                    connection.close();
                }
                info!(key = %key, listeners = sub.listeners.len(), "subscription force-closed");
                true
            }
            None => false,
        }
    }

    /// Close every connection and forget every listener.
    pub fn close_all(&self) {
        let drained: Vec<(SubscriptionKey, Subscription)> =
            self.inner.subscriptions.lock().drain().collect();
        let count = drained.len();
        for (_key, sub) in drained {
            if let Some(mut connection) = sub.connection {
                connection.close();
            }
        }
        info!(count, "all subscriptions closed");
    }

    pub fn state(&self, key: &SubscriptionKey) -> ConnectionState {
        self.inner
            .subscriptions
            .lock()
            .get(key)
            .map_or(ConnectionState::Idle, |s| s.state)
    }

    #[cfg(test)]
    pub fn listener_count(&self, key: &SubscriptionKey) -> usize {
        self.inner
            .subscriptions
            .lock()
            .get(key)
            .map_or(0, |s| s.listeners.len())
    }

    #[cfg(test)]
    pub fn has_connection(&self, key: &SubscriptionKey) -> bool {
        self.inner
            .subscriptions
            .lock()
            .get(key)
            .is_some_and(|s| s.connection.is_some())
    }

    pub fn keys(&self) -> Vec<SubscriptionKey> {
        let mut keys: Vec<SubscriptionKey> =
            self.inner.subscriptions.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    // -------------------------------------------------------------------------
    // Connection lifecycle
    // -------------------------------------------------------------------------

    fn begin_connecting(&self, sub: &mut Subscription) -> u64 {
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        sub.generation = generation;
        sub.state = ConnectionState::Connecting;
        generation
    }

    /// Ask the connector for a connection.  Runs outside the lock because a
    /// connector may report `opened` / `closed` synchronously.
    fn open(&self, key: &SubscriptionKey, generation: u64) {
        info!(key = %key, generation, "opening live connection");
        let link = ConnectionLink {
            key: key.clone(),
            generation,
            registry: Arc::downgrade(&self.inner),
        };
        let mut connection = self.inner.connector.connect(key, link);

        {
            let mut subs = self.inner.subscriptions.lock();
            if let Some(sub) = subs.get_mut(key) {
                let live = matches!(
                    sub.state,
                    ConnectionState::Connecting | ConnectionState::Open
                );
                if sub.generation == generation && live {
                    sub.connection = Some(connection);
                    return;
                }
            }
        }

        // The key was torn down (or reconnected) while we were connecting.
        debug!(key = %key, generation, "discarding orphaned connection");
        connection.close();
    }

    /// Reopen a CLOSED key whose reconnect delay elapsed, if nobody else
    /// reopened or released it in the meantime.
    fn reopen(&self, key: &SubscriptionKey, expected_generation: u64) {
        let generation = {
            let mut subs = self.inner.subscriptions.lock();
            match subs.get_mut(key) {
                Some(sub)
                    if sub.state == ConnectionState::Closed
                        && sub.generation == expected_generation
                        && !sub.listeners.is_empty() =>
                {
                    self.begin_connecting(sub)
                }
                _ => return,
            }
        };
        self.open(key, generation);
    }

    fn mark_open(&self, key: &SubscriptionKey, generation: u64) {
        let mut subs = self.inner.subscriptions.lock();
        if let Some(sub) = subs.get_mut(key) {
            if sub.generation == generation && sub.state == ConnectionState::Connecting {
                sub.state = ConnectionState::Open;
                sub.reconnect_attempts = 0;
                info!(key = %key, generation, "live connection open");
            }
        }
    }

    fn mark_closed(&self, key: &SubscriptionKey, generation: u64, reason: &str) {
        let (retry, connection) = {
            let mut subs = self.inner.subscriptions.lock();
            let Some(sub) = subs.get_mut(key) else {
                return;
            };
            if sub.generation != generation || sub.state == ConnectionState::Closed {
                return;
            }

            sub.state = ConnectionState::Closed;
            sub.reconnect_attempts += 1;
            let connection = sub.connection.take();
            warn!(key = %key, generation, reason, "live connection closed");

            match self.inner.reconnect.on_closed(key, sub.reconnect_attempts) {
                Some(delay) => (Some(delay), connection),
                None => {
                    subs.remove(key);
                    info!(key = %key, "subscription released after close");
                    (None, connection)
                }
            }
        };

        if let Some(mut connection) = connection {
            connection.close();
        }

        if let Some(delay) = retry {
            self.schedule_reopen(key, generation, delay);
        }
    }

    fn schedule_reopen(&self, key: &SubscriptionKey, generation: u64, delay: Duration) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(key = %key, "no async runtime for reconnect — releasing subscription");
            self.inner.subscriptions.lock().remove(key);
            return;
        };

        info!(key = %key, delay_ms = delay.as_millis() as u64, "reconnect scheduled");
        let registry = Arc::downgrade(&self.inner);
        let key = key.clone();
        runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = registry.upgrade() {
                SubscriptionRegistry { inner }.reopen(&key, generation);
            }
        });
    }

    // -------------------------------------------------------------------------
    // Fan-out
    // -------------------------------------------------------------------------

    fn dispatch(&self, key: &SubscriptionKey, generation: u64, candle: Candle) -> usize {
        let listeners: Vec<(u64, Arc<dyn KlineListener>)> = {
            let subs = self.inner.subscriptions.lock();
            match subs.get(key) {
                Some(sub) if sub.generation == generation => sub.listeners.clone(),
                _ => return 0,
            }
        };

        let event = KlineEvent {
            key: key.clone(),
            candle,
        };

        let mut delivered = 0;
        for (id, listener) in listeners {
            let outcome = catch_unwind(AssertUnwindSafe(|| listener.on_kline(&event)));
            let failure = match outcome {
                Ok(Ok(())) => {
                    delivered += 1;
                    continue;
                }
                Ok(Err(e)) => format!("{e:#}"),
                Err(panic) => panic_message(panic.as_ref()),
            };
            self.inner.diagnostics.report(
                &format!("fan-out {key}"),
                &FeedError::Listener {
                    id,
                    reason: failure,
                },
            );
        }
        delivered
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("keys", &self.keys())
            .finish()
    }
}

// =============================================================================
// ConnectionLink — the transport's way back into the registry
// =============================================================================

/// Handed to a [`StreamConnector`] for one connection.  Holds only a weak
/// reference, so a lingering transport task never keeps the registry alive.
#[derive(Clone)]
pub struct ConnectionLink {
    key: SubscriptionKey,
    generation: u64,
    registry: Weak<RegistryInner>,
}

impl ConnectionLink {
    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    #[cfg(test)]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn registry(&self) -> Option<SubscriptionRegistry> {
        self.registry
            .upgrade()
            .map(|inner| SubscriptionRegistry { inner })
    }

    /// Handshake completed: CONNECTING → OPEN.
    pub fn opened(&self) {
        if let Some(registry) = self.registry() {
            registry.mark_open(&self.key, self.generation);
        }
    }

    /// Handle one inbound text frame.  Parse failures are reported and the
    /// frame dropped; frames without a kline payload are ignored.  Returns
    /// the number of listeners that accepted the event.
    pub fn frame(&self, text: &str) -> usize {
        let Some(registry) = self.registry() else {
            return 0;
        };

        match parse_stream_frame(text) {
            Ok(Some(candle)) => registry.dispatch(&self.key, self.generation, candle),
            Ok(None) => 0,
            Err(e) => {
                registry
                    .inner
                    .diagnostics
                    .report(&format!("frame {}", self.key), &e);
                0
            }
        }
    }

    /// Report a transport failure without closing (e.g. before retrying).
    pub fn report(&self, error: &FeedError) {
        if let Some(registry) = self.registry() {
            registry
                .inner
                .diagnostics
                .report(&format!("connection {}", self.key), error);
        }
    }

    /// Transport error or remote close: → CLOSED.
    pub fn closed(&self, reason: &str) {
        if let Some(registry) = self.registry() {
            registry.mark_closed(&self.key, self.generation, reason);
        }
    }
}

impl std::fmt::Debug for ConnectionLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionLink")
            .field("key", &self.key)
            .field("generation", &self.generation)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::feed::diagnostics::RecordingDiagnostics;
    use std::sync::atomic::AtomicBool;

    /// Connector that records every connection and lets tests drive frames.
    #[derive(Default)]
    pub(crate) struct MockConnector {
        pub links: Mutex<Vec<ConnectionLink>>,
        pub closed: Arc<Mutex<Vec<u64>>>,
        pub open_immediately: AtomicBool,
    }

    pub(crate) struct MockConnection {
        generation: u64,
        closed: Arc<Mutex<Vec<u64>>>,
        done: bool,
    }

    impl LiveConnection for MockConnection {
        fn close(&mut self) {
            if !self.done {
                self.done = true;
                self.closed.lock().push(self.generation);
            }
        }
    }

    impl StreamConnector for MockConnector {
        fn connect(&self, _key: &SubscriptionKey, link: ConnectionLink) -> Box<dyn LiveConnection> {
            if self.open_immediately.load(Ordering::Relaxed) {
                link.opened();
            }
            let generation = link.generation();
            self.links.lock().push(link);
            Box::new(MockConnection {
                generation,
                closed: self.closed.clone(),
                done: false,
            })
        }
    }

    impl MockConnector {
        pub(crate) fn opening() -> Arc<Self> {
            let c = Self::default();
            c.open_immediately.store(true, Ordering::Relaxed);
            Arc::new(c)
        }

        pub(crate) fn link(&self, i: usize) -> ConnectionLink {
            self.links.lock()[i].clone()
        }

        pub(crate) fn connects(&self) -> usize {
            self.links.lock().len()
        }
    }

    pub(crate) fn kline_frame(open_time_ms: i64, close: f64, closed: bool) -> String {
        format!(
            r#"{{"e":"kline","s":"BTCUSDT","k":{{"t":{open_time_ms},"o":"{close}","h":"{close}","l":"{close}","c":"{close}","v":"1.0","x":{closed}}}}}"#
        )
    }

    pub(crate) type Seen = Arc<Mutex<Vec<(Candle, bool)>>>;

    pub(crate) fn collector() -> (Arc<dyn KlineListener>, Seen) {
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let listener = move |event: &KlineEvent| -> anyhow::Result<()> {
            sink.lock().push((event.candle, event.candle.closed));
            Ok(())
        };
        (Arc::new(listener), seen)
    }

    fn registry(
        connector: Arc<MockConnector>,
    ) -> (SubscriptionRegistry, Arc<RecordingDiagnostics>) {
        let diag = Arc::new(RecordingDiagnostics::new());
        let reg = SubscriptionRegistry::new(connector, Arc::new(NoReconnect), diag.clone());
        (reg, diag)
    }

    fn key() -> SubscriptionKey {
        SubscriptionKey::new("BTCUSDT", "1m")
    }

    #[test]
    fn first_subscribe_connects_and_later_ones_share() {
        let connector = Arc::new(MockConnector::default());
        let (reg, _) = registry(connector.clone());
        let (a, _) = collector();
        let (b, _) = collector();

        reg.subscribe(&key(), a);
        assert_eq!(reg.state(&key()), ConnectionState::Connecting);
        reg.subscribe(&key(), b);

        assert_eq!(connector.connects(), 1);
        assert_eq!(reg.listener_count(&key()), 2);

        connector.link(0).opened();
        assert_eq!(reg.state(&key()), ConnectionState::Open);
    }

    #[test]
    fn fan_out_delivers_identical_events() {
        let connector = MockConnector::opening();
        let (reg, _) = registry(connector.clone());
        let (a, seen_a) = collector();
        let (b, seen_b) = collector();
        reg.subscribe(&key(), a);
        reg.subscribe(&key(), b);

        let link = connector.link(0);
        assert_eq!(link.frame(&kline_frame(60_000, 100.0, false)), 2);
        assert_eq!(link.frame(&kline_frame(60_000, 101.0, true)), 2);

        let a = seen_a.lock().clone();
        assert_eq!(a.len(), 2);
        assert_eq!(a, *seen_b.lock());
        assert_eq!(a[1].0.time, 60);
        assert!(a[1].1);
    }

    #[test]
    fn unsubscribing_all_listeners_tears_down() {
        let connector = MockConnector::opening();
        let (reg, _) = registry(connector.clone());
        let (a, _) = collector();
        let (b, _) = collector();
        let ha = reg.subscribe(&key(), a);
        let hb = reg.subscribe(&key(), b);

        assert!(reg.unsubscribe(&ha));
        assert!(reg.has_connection(&key()));
        assert!(connector.closed.lock().is_empty());

        assert!(reg.unsubscribe(&hb));
        assert!(!reg.has_connection(&key()));
        assert_eq!(reg.listener_count(&key()), 0);
        assert_eq!(reg.state(&key()), ConnectionState::Idle);
        assert!(reg.keys().is_empty());
        assert_eq!(*connector.closed.lock(), vec![connector.link(0).generation()]);

        assert!(!reg.unsubscribe(&hb));
    }

    #[test]
    fn malformed_frame_is_dropped_without_closing() {
        let connector = MockConnector::opening();
        let (reg, diag) = registry(connector.clone());
        let (a, seen) = collector();
        reg.subscribe(&key(), a);

        let link = connector.link(0);
        assert_eq!(link.frame("{not json"), 0);
        assert_eq!(link.frame(r#"{"result":null,"id":1}"#), 0);
        assert_eq!(link.frame(&kline_frame(0, 5.0, false)), 1);

        assert_eq!(reg.state(&key()), ConnectionState::Open);
        assert_eq!(seen.lock().len(), 1);
        assert_eq!(diag.count_of(ErrorKind::Malformed), 1);
    }

    #[test]
    fn failing_listener_does_not_block_others() {
        let connector = MockConnector::opening();
        let (reg, diag) = registry(connector.clone());
        let erroring = |_: &KlineEvent| -> anyhow::Result<()> { anyhow::bail!("boom") };
        let panicking = |_: &KlineEvent| -> anyhow::Result<()> { panic!("listener panic") };
        reg.subscribe(&key(), Arc::new(erroring));
        reg.subscribe(&key(), Arc::new(panicking));
        let (good, seen) = collector();
        reg.subscribe(&key(), good);

        assert_eq!(connector.link(0).frame(&kline_frame(0, 1.0, true)), 1);
        assert_eq!(seen.lock().len(), 1);
        assert_eq!(diag.count_of(ErrorKind::Listener), 2);
        assert_eq!(reg.state(&key()), ConnectionState::Open);
    }

    #[test]
    fn remote_close_releases_key_without_retry() {
        let connector = MockConnector::opening();
        let (reg, _) = registry(connector.clone());
        let (a, _) = collector();
        reg.subscribe(&key(), a);

        connector.link(0).closed("remote close");
        assert_eq!(reg.state(&key()), ConnectionState::Idle);
        assert_eq!(reg.listener_count(&key()), 0);
        assert_eq!(connector.connects(), 1);

        // A fresh subscribe is required to reconnect.
        let (b, _) = collector();
        reg.subscribe(&key(), b);
        assert_eq!(connector.connects(), 2);
    }

    #[test]
    fn stale_generation_notifications_are_ignored() {
        let connector = MockConnector::opening();
        let (reg, _) = registry(connector.clone());
        let (a, _) = collector();
        reg.subscribe(&key(), a);
        let old = connector.link(0);
        reg.close(&key());
        let (b, seen) = collector();
        reg.subscribe(&key(), b);

        old.closed("late close from torn-down socket");
        assert_eq!(old.frame(&kline_frame(0, 1.0, true)), 0);
        assert_eq!(reg.state(&key()), ConnectionState::Open);
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn unsubscribe_from_inside_callback_does_not_deadlock() {
        let connector = MockConnector::opening();
        let (reg, _) = registry(connector.clone());
        let slot: Arc<Mutex<Option<ListenerHandle>>> = Arc::new(Mutex::new(None));

        let reg2 = reg.clone();
        let slot2 = slot.clone();
        let listener = move |_: &KlineEvent| -> anyhow::Result<()> {
            if let Some(handle) = slot2.lock().take() {
                reg2.unsubscribe(&handle);
            }
            Ok(())
        };
        let handle = reg.subscribe(&key(), Arc::new(listener));
        *slot.lock() = Some(handle);

        let link = connector.link(0);
        assert_eq!(link.frame(&kline_frame(0, 1.0, false)), 1);
        assert_eq!(reg.state(&key()), ConnectionState::Idle);
        assert_eq!(link.frame(&kline_frame(60_000, 1.0, false)), 0);
    }

    #[test]
    fn close_all_clears_every_key() {
        let connector = MockConnector::opening();
        let (reg, _) = registry(connector.clone());
        let (a, _) = collector();
        let eth = SubscriptionKey::new("ethusdt", "5m");
        reg.subscribe(&key(), a.clone());
        reg.subscribe(&eth, a);
        assert_eq!(reg.keys().len(), 2);

        reg.close_all();
        assert!(reg.keys().is_empty());
        assert_eq!(connector.closed.lock().len(), 2);
    }

    struct FixedDelay(Duration);

    impl ReconnectPolicy for FixedDelay {
        fn on_closed(&self, _key: &SubscriptionKey, attempt: u32) -> Option<Duration> {
            (attempt <= 3).then_some(self.0)
        }
    }

    #[tokio::test]
    async fn reconnect_policy_reopens_after_delay() {
        let connector = MockConnector::opening();
        let reg = SubscriptionRegistry::new(
            connector.clone(),
            Arc::new(FixedDelay(Duration::from_millis(10))),
            Arc::new(RecordingDiagnostics::new()),
        );
        let (a, seen) = collector();
        reg.subscribe(&key(), a);

        connector.link(0).closed("remote close");
        assert_eq!(reg.state(&key()), ConnectionState::Closed);
        assert_eq!(reg.listener_count(&key()), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(connector.connects(), 2);
        assert_eq!(reg.state(&key()), ConnectionState::Open);

        connector.link(1).frame(&kline_frame(0, 3.0, true));
        assert_eq!(seen.lock().len(), 1);
    }
}
