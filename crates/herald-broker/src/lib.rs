// In-process push broker: bounded per-channel logs fanned out to connections.
// Each connection drains its subscriptions by priority tier and quota; a small
// pool of streamer threads retriggers delivery after every inject.
use ahash::RandomState;
use bytes::Bytes;
use hashbrown::HashMap;
use herald_common::ids::ConnectionId;
use herald_common::{ChannelInfo, ChannelOptions};
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

#[cfg(feature = "telemetry")]
macro_rules! t_histogram {
    ($($tt:tt)*) => {
        metrics::histogram!($($tt)*)
    };
}

#[cfg(not(feature = "telemetry"))]
macro_rules! t_histogram {
    ($($tt:tt)*) => {
        $crate::NoopHistogram
    };
}

pub mod channel;
mod registry;
mod schedule;
mod streamer;
pub mod subscriber;
#[cfg(test)]
mod test_support;
pub mod timings;

use registry::Registry;
use streamer::StreamerPool;
pub use subscriber::Subscriber;

pub type Result<T> = std::result::Result<T, BrokerError>;

#[cfg(not(feature = "telemetry"))]
#[derive(Copy, Clone)]
pub(crate) struct NoopHistogram;

#[cfg(not(feature = "telemetry"))]
impl NoopHistogram {
    pub(crate) fn record(&self, _value: f64) {}
}

#[cfg(feature = "telemetry")]
#[inline]
pub(crate) fn t_should_sample() -> bool {
    timings::should_sample()
}

#[cfg(not(feature = "telemetry"))]
#[inline]
pub(crate) fn t_should_sample() -> bool {
    false
}

#[cfg(feature = "telemetry")]
#[inline]
pub(crate) fn t_now_if(sample: bool) -> Option<Instant> {
    sample.then(Instant::now)
}

#[cfg(not(feature = "telemetry"))]
#[inline]
pub(crate) fn t_now_if(_sample: bool) -> Option<Instant> {
    None
}

#[derive(thiserror::Error, Debug)]
pub enum BrokerError {
    #[error("channel not found: {0}")]
    ChannelNotFound(String),
    #[error("channel already exists: {0}")]
    ChannelExists(String),
    #[error("channel {channel} is over its fill rate")]
    Throttled { channel: String },
    #[error("connection not found: {0}")]
    ConnectionNotFound(ConnectionId),
    #[error("connection already registered: {0}")]
    ConnectionExists(ConnectionId),
    #[error("invalid options: {0}")]
    InvalidOptions(#[from] herald_common::Error),
    #[error("failed to spawn streamer thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("broker is shut down")]
    Closed,
}

#[derive(thiserror::Error, Debug)]
pub enum DeliveryError {
    #[error("transport failed for {0}")]
    TransportFailed(ConnectionId),
}

/// Result of handing one payload to a connection's transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// Transport cannot take more right now; it will call
    /// [`Broker::on_write_available`] once it drains.
    Busy,
    /// Connection is unusable and should be torn down.
    Failed,
}

/// Per-connection transport the delivery loop writes into.
///
/// `try_send` must not block. A transport that returns [`SendOutcome::Busy`]
/// owns re-triggering delivery through [`Broker::on_write_available`].
pub trait Outbound: Send + Sync {
    fn try_send(&self, payload: &Bytes) -> SendOutcome;

    /// A write is still being flushed; delivery waits for its completion hook.
    fn is_write_in_progress(&self) -> bool {
        false
    }

    /// Called when a streamer takes the connection.
    fn acquire_usage(&self) {}

    /// Called when a streamer lets go of the connection.
    fn release_usage(&self) {}
}

/// Payload lifecycle hooks shared by every channel of a broker.
pub trait MessageFactory: Send + Sync {
    /// Runs once per inject, before the payload enters a log.
    fn pre_encode(&self, payload: Bytes) -> Bytes {
        payload
    }

    /// Runs exactly once for every payload the broker took ownership of.
    fn dispose(&self, payload: Bytes) {
        drop(payload);
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughFactory;

impl MessageFactory for PassthroughFactory {}

const DEFAULT_STREAMERS: usize = 1;
const DEFAULT_IDLE_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerOptions {
    // Streamer worker threads.
    pub streamers: usize,
    // Longest a streamer sleeps with nothing flagged.
    pub idle_interval: Duration,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            streamers: DEFAULT_STREAMERS,
            idle_interval: DEFAULT_IDLE_INTERVAL,
        }
    }
}

impl BrokerOptions {
    pub fn validate(&self) -> herald_common::Result<()> {
        if self.streamers == 0 {
            return Err(herald_common::Error::Config(
                "streamers must be greater than zero".into(),
            ));
        }
        if self.idle_interval.is_zero() {
            return Err(herald_common::Error::Config(
                "idle_interval must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Push broker facade.
///
/// ```
/// use bytes::Bytes;
/// use herald_broker::{Broker, BrokerOptions, Outbound, SendOutcome};
/// use herald_common::{ChannelOptions, ids::ConnectionId};
/// use std::sync::{Arc, Mutex};
///
/// #[derive(Default)]
/// struct Recorder(Mutex<Vec<Bytes>>);
///
/// impl Outbound for Recorder {
///     fn try_send(&self, payload: &Bytes) -> SendOutcome {
///         self.0.lock().expect("lock").push(payload.clone());
///         SendOutcome::Sent
///     }
/// }
///
/// let broker = Broker::new(BrokerOptions::default()).expect("broker");
/// broker
///     .create_channel("quotes", ChannelOptions::default())
///     .expect("create");
/// let recorder = Arc::new(Recorder::default());
/// broker.connect(ConnectionId(1), recorder.clone()).expect("connect");
/// broker
///     .subscribe(ConnectionId(1), "quotes", false)
///     .expect("subscribe");
/// broker
///     .inject(Bytes::from_static(b"hello"), "quotes", "", 0)
///     .expect("inject");
/// // A streamer thread delivers in the background.
/// while recorder.0.lock().expect("lock").is_empty() {
///     std::thread::sleep(std::time::Duration::from_millis(1));
/// }
/// assert_eq!(recorder.0.lock().expect("lock").as_slice(), [Bytes::from_static(b"hello")]);
/// broker.shutdown();
/// ```
pub struct Broker {
    registry: Registry,
    // Connection id -> delivery state.
    connections: RwLock<HashMap<ConnectionId, Arc<Subscriber>, RandomState>>,
    streamers: StreamerPool,
    closed: AtomicBool,
}

impl fmt::Debug for Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broker")
            .field("channels", &self.registry.names())
            .field("connections", &self.connections.read().len())
            .field("streamers", &self.streamers.len())
            .finish()
    }
}

impl Broker {
    pub fn new(options: BrokerOptions) -> Result<Self> {
        Self::with_factory(options, Arc::new(PassthroughFactory))
    }

    pub fn with_factory(options: BrokerOptions, factory: Arc<dyn MessageFactory>) -> Result<Self> {
        options.validate()?;
        let streamers = StreamerPool::start(options.streamers, options.idle_interval)?;
        Ok(Self {
            registry: Registry::new(factory),
            connections: RwLock::new(HashMap::with_hasher(RandomState::new())),
            streamers,
            closed: AtomicBool::new(false),
        })
    }

    pub fn create_channel(&self, name: &str, options: ChannelOptions) -> Result<()> {
        self.ensure_open()?;
        let channel = self.registry.create(name, options)?;
        tracing::info!(channel = name, options = %channel.options(), "channel created");
        Ok(())
    }

    /// Drop a channel, unsubscribe every connection from it and free its log.
    pub fn remove_channel(&self, name: &str) -> Result<()> {
        let channel = self
            .registry
            .remove(name)
            .ok_or_else(|| BrokerError::ChannelNotFound(name.to_string()))?;
        for subscriber in self.subscribers() {
            subscriber.unsubscribe(name);
        }
        let freed = channel.drain_all();
        tracing::info!(channel = name, freed, "channel removed");
        Ok(())
    }

    /// Append a payload to `channel` and wake the streamers. Returns the
    /// assigned sequence number. On error the payload has already been
    /// disposed through the message factory.
    pub fn inject(
        &self,
        payload: Bytes,
        channel: &str,
        kill_key: &str,
        category: i32,
    ) -> Result<u64> {
        if self.closed.load(Ordering::Acquire) {
            self.registry.dispose(payload);
            return Err(BrokerError::Closed);
        }
        let seq = self.registry.inject(payload, channel, kill_key, category)?;
        self.streamers.signal_all();
        Ok(seq)
    }

    /// Remove the first entry in `channel` with `kill_key` and a category
    /// other than `category`.
    pub fn evict(&self, kill_key: &str, category: i32, channel: &str) -> Result<bool> {
        self.registry.evict(kill_key, category, channel)
    }

    /// Subscribe a connection. Returns false when it was already subscribed.
    pub fn subscribe(
        &self,
        connection: ConnectionId,
        channel: &str,
        ignore_previous: bool,
    ) -> Result<bool> {
        let subscriber = self
            .connection(connection)
            .ok_or(BrokerError::ConnectionNotFound(connection))?;
        let target = self
            .registry
            .get(channel)
            .ok_or_else(|| BrokerError::ChannelNotFound(channel.to_string()))?;
        let added = subscriber.subscribe(target, ignore_previous);
        if added && let Some(worker) = subscriber.worker() {
            // Deliver any retained backlog without waiting for the next inject.
            self.streamers.signal(worker);
        }
        Ok(added)
    }

    pub fn unsubscribe(&self, connection: ConnectionId, channel: &str) -> bool {
        self.connection(connection)
            .is_some_and(|subscriber| subscriber.unsubscribe(channel))
    }

    pub fn unsubscribe_all(&self, connection: ConnectionId) {
        if let Some(subscriber) = self.connection(connection) {
            subscriber.unsubscribe_all();
        }
    }

    /// Transport completion hook: a previous write finished or the transport
    /// stopped being busy. Unknown connections are ignored.
    pub fn on_write_available(
        &self,
        connection: ConnectionId,
    ) -> std::result::Result<usize, DeliveryError> {
        match self.connection(connection) {
            Some(subscriber) => subscriber.tick(false),
            None => Ok(0),
        }
    }

    /// Register a connection, subscribe it to every global channel and hand it
    /// to the least loaded streamer.
    pub fn connect(
        &self,
        id: ConnectionId,
        transport: Arc<dyn Outbound>,
    ) -> Result<Arc<Subscriber>> {
        self.ensure_open()?;
        let subscriber = Arc::new(Subscriber::new(id, transport));
        {
            let mut connections = self.connections.write();
            if connections.contains_key(&id) {
                return Err(BrokerError::ConnectionExists(id));
            }
            connections.insert(id, Arc::clone(&subscriber));
        }
        let mut subscribed = false;
        for channel in self.registry.globals() {
            subscribed |= subscriber.subscribe(channel, false);
        }
        let worker = self.streamers.add_connection(&subscriber);
        if subscribed {
            // Retained global backlog goes out without waiting for an inject.
            self.streamers.signal(worker);
        }
        tracing::info!(connection = %id, worker, "connection registered");
        Ok(subscriber)
    }

    /// Forget a connection. Returns false when it was not registered.
    pub fn disconnect(&self, connection: ConnectionId) -> bool {
        let Some(subscriber) = self.connections.write().remove(&connection) else {
            return false;
        };
        subscriber.unsubscribe_all();
        self.streamers.remove_connection(&subscriber);
        tracing::info!(connection = %connection, "connection removed");
        true
    }

    pub fn connection(&self, connection: ConnectionId) -> Option<Arc<Subscriber>> {
        self.connections.read().get(&connection).cloned()
    }

    pub fn channel_names(&self) -> Vec<String> {
        self.registry.names()
    }

    pub fn channel_infos(&self) -> Vec<ChannelInfo> {
        self.registry.infos()
    }

    pub fn channel_info(&self, name: &str) -> Option<ChannelInfo> {
        self.registry.get(name).map(|channel| channel.info())
    }

    /// Stop the streamers, then free every retained message. Idempotent.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.streamers.shutdown();
        let freed = self.registry.drain_all();
        tracing::info!(freed, "broker shut down");
    }

    fn subscribers(&self) -> Vec<Arc<Subscriber>> {
        self.connections.read().values().cloned().collect()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::Closed);
        }
        Ok(())
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{CountingFactory, ScriptedOutbound, payload};
    use std::thread;

    fn broker() -> (Broker, Arc<CountingFactory>) {
        let factory = Arc::new(CountingFactory::default());
        let broker = Broker::with_factory(BrokerOptions::default(), factory.clone()).expect("broker");
        (broker, factory)
    }

    fn eventually(what: &str, mut check: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !check() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn attach(broker: &Broker, id: u64) -> Arc<ScriptedOutbound> {
        let outbound = Arc::new(ScriptedOutbound::default());
        broker
            .connect(ConnectionId(id), outbound.clone())
            .expect("connect");
        outbound
    }

    #[test]
    fn zero_streamers_are_rejected() {
        let err = Broker::new(BrokerOptions {
            streamers: 0,
            ..BrokerOptions::default()
        })
        .expect_err("invalid");
        assert!(matches!(err, BrokerError::InvalidOptions(_)));
    }

    #[test]
    fn inject_is_delivered_by_the_streamer() {
        let (broker, _) = broker();
        broker
            .create_channel("quotes", ChannelOptions::default())
            .expect("create");
        let outbound = attach(&broker, 1);
        assert!(broker.subscribe(ConnectionId(1), "quotes", false).expect("subscribe"));

        broker.inject(payload("tick"), "quotes", "", 0).expect("inject");
        eventually("delivery", || outbound.sent() == vec![payload("tick")]);
    }

    #[test]
    fn connect_delivers_retained_global_backlog() {
        let (broker, _) = broker();
        broker
            .create_channel("news", ChannelOptions::default().with_global(true))
            .expect("create");
        broker.inject(payload("retained"), "news", "", 0).expect("inject");
        // Let the streamer drain its mask and go back to parking.
        thread::sleep(Duration::from_millis(50));

        let outbound = attach(&broker, 1);
        eventually("global backlog", || outbound.sent() == vec![payload("retained")]);
    }

    #[test]
    fn subscribe_delivers_retained_backlog() {
        let (broker, _) = broker();
        broker
            .create_channel("quotes", ChannelOptions::default().with_max_messages(3))
            .expect("create");
        for name in ["P1", "P2", "P3", "P4"] {
            broker.inject(payload(name), "quotes", "", 0).expect("inject");
        }
        let outbound = attach(&broker, 1);
        broker.subscribe(ConnectionId(1), "quotes", false).expect("subscribe");
        eventually("backlog", || outbound.sent().len() == 3);
        assert_eq!(outbound.sent(), vec![payload("P2"), payload("P3"), payload("P4")]);
    }

    #[test]
    fn ignore_previous_skips_backlog() {
        let (broker, _) = broker();
        broker
            .create_channel("quotes", ChannelOptions::default())
            .expect("create");
        broker.inject(payload("old"), "quotes", "", 0).expect("inject");
        let outbound = attach(&broker, 1);
        broker.subscribe(ConnectionId(1), "quotes", true).expect("subscribe");
        broker.inject(payload("new"), "quotes", "", 0).expect("inject");
        eventually("new message", || !outbound.sent().is_empty());
        assert_eq!(outbound.sent(), vec![payload("new")]);
    }

    #[test]
    fn unknown_channel_and_connection_are_errors() {
        let (broker, factory) = broker();
        let err = broker
            .inject(payload("lost"), "missing", "", 0)
            .expect_err("unknown channel");
        assert!(matches!(err, BrokerError::ChannelNotFound(_)));
        assert_eq!(factory.disposed(), vec![payload("lost")]);

        let err = broker
            .subscribe(ConnectionId(9), "missing", false)
            .expect_err("unknown connection");
        assert!(matches!(err, BrokerError::ConnectionNotFound(ConnectionId(9))));
        attach(&broker, 9);
        let err = broker
            .subscribe(ConnectionId(9), "missing", false)
            .expect_err("unknown channel");
        assert!(matches!(err, BrokerError::ChannelNotFound(_)));
        assert_eq!(broker.on_write_available(ConnectionId(42)).expect("ignored"), 0);
    }

    #[test]
    fn duplicate_connection_is_rejected() {
        let (broker, _) = broker();
        attach(&broker, 1);
        let err = broker
            .connect(ConnectionId(1), Arc::new(ScriptedOutbound::default()))
            .expect_err("duplicate");
        assert!(matches!(err, BrokerError::ConnectionExists(ConnectionId(1))));
    }

    #[test]
    fn global_channels_are_subscribed_on_connect() {
        let (broker, _) = broker();
        broker
            .create_channel("news", ChannelOptions::default().with_global(true))
            .expect("create");
        broker
            .create_channel("private", ChannelOptions::default())
            .expect("create");
        attach(&broker, 1);
        let subscriber = broker.connection(ConnectionId(1)).expect("connection");
        assert_eq!(subscriber.subscriptions(), vec!["news"]);
    }

    #[test]
    fn busy_transport_resumes_on_next_tick() {
        let (broker, _) = broker();
        broker
            .create_channel("quotes", ChannelOptions::default())
            .expect("create");
        let outbound = Arc::new(ScriptedOutbound::default());
        outbound.script([SendOutcome::Busy]);
        let subscriber = Subscriber::new(ConnectionId(5), outbound.clone());
        let target = broker.registry.get("quotes").expect("channel");
        subscriber.subscribe(target, false);
        broker.registry.inject(payload("a"), "quotes", "", 0).expect("inject");

        assert_eq!(subscriber.tick(true).expect("busy"), 0);
        assert_eq!(subscriber.tick(false).expect("resume"), 1);
        assert_eq!(outbound.sent(), vec![payload("a")]);
    }

    #[test]
    fn evict_reaches_the_channel() {
        let (broker, factory) = broker();
        broker
            .create_channel("quotes", ChannelOptions::default())
            .expect("create");
        broker.inject(payload("stale"), "quotes", "EURUSD", 1).expect("inject");
        assert!(broker.evict("EURUSD", 2, "quotes").expect("evict"));
        assert_eq!(factory.disposed(), vec![payload("stale")]);
        assert_eq!(broker.channel_info("quotes").expect("info").depth, 0);
    }

    #[test]
    fn remove_channel_unsubscribes_connections() {
        let (broker, factory) = broker();
        broker
            .create_channel("quotes", ChannelOptions::default())
            .expect("create");
        attach(&broker, 1);
        broker.subscribe(ConnectionId(1), "quotes", false).expect("subscribe");
        broker.unsubscribe_all(ConnectionId(1));
        broker.subscribe(ConnectionId(1), "quotes", false).expect("resubscribe");

        // Hold the streamer off so the entry is still live when the channel goes.
        broker.streamers.shutdown();
        broker.registry.inject(payload("a"), "quotes", "", 0).expect("inject");
        broker.remove_channel("quotes").expect("remove");

        let subscriber = broker.connection(ConnectionId(1)).expect("connection");
        assert!(subscriber.subscriptions().is_empty());
        assert!(broker.channel_names().is_empty());
        assert_eq!(factory.disposed(), vec![payload("a")]);
        assert!(matches!(
            broker.remove_channel("quotes"),
            Err(BrokerError::ChannelNotFound(_))
        ));
    }

    #[test]
    fn disconnect_releases_streamer_usage() {
        let (broker, _) = broker();
        let outbound = attach(&broker, 1);
        assert_eq!(outbound.usage(), 1);
        assert!(broker.disconnect(ConnectionId(1)));
        assert!(!broker.disconnect(ConnectionId(1)));
        eventually("usage released", || outbound.usage() == 0);
        assert!(broker.connection(ConnectionId(1)).is_none());
    }

    #[test]
    fn shutdown_frees_every_retained_message() {
        let (broker, factory) = broker();
        broker
            .create_channel("a", ChannelOptions::default())
            .expect("create");
        broker
            .create_channel("b", ChannelOptions::default())
            .expect("create");
        broker.inject(payload("1"), "a", "", 0).expect("inject");
        broker.inject(payload("2"), "b", "", 0).expect("inject");

        broker.shutdown();
        assert_eq!(factory.disposed_count(), 2);
        let err = broker
            .inject(payload("late"), "a", "", 0)
            .expect_err("closed");
        assert!(matches!(err, BrokerError::Closed));
        assert_eq!(factory.disposed_count(), 3);
        broker.shutdown();
    }

    #[test]
    fn broker_error_display() {
        assert_eq!(
            BrokerError::ChannelNotFound("x".into()).to_string(),
            "channel not found: x"
        );
        assert_eq!(
            BrokerError::Throttled {
                channel: "x".into()
            }
            .to_string(),
            "channel x is over its fill rate"
        );
        assert_eq!(
            DeliveryError::TransportFailed(ConnectionId(3)).to_string(),
            "transport failed for conn-3"
        );
    }
}
