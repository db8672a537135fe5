//! Pub/sub relay bridge
//!
//! Connects this process's session registry to the shared broadcast
//! channel. Outbound: handlers enqueue one frame per origin event and a
//! publisher task writes it to the channel exactly once. Inbound: every
//! process receives every frame and delivers it only to the recipients it
//! holds locally.
//!
//! Delivery is at-most-once and best effort by contract: `publish` never
//! waits for the network, nothing is acknowledged, and nothing is retried.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use rand::Rng;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, IntoConnectionInfo};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, trace, warn};

use crate::config::Config;
use crate::error::RelayError;
use crate::message::RelayEnvelope;
use crate::registry::SessionRegistry;
use crate::server::ShutdownSignal;

/// Capacity of the in-process bus
const LOCAL_BUS_CAPACITY: usize = 1024;

/// Frames waiting for the publisher task
pub const PUBLISH_QUEUE_CAPACITY: usize = 1024;

/// Upper bound on one Redis connect or publish
const RELAY_IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Reconnect backoff bounds
const BACKOFF_BASE: Duration = Duration::from_millis(250);
const BACKOFF_MAX: Duration = Duration::from_secs(10);

/// One message on one relay channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayFrame {
    pub channel: String,
    pub payload: String,
}

/// Fire-and-forget handle for publishing relay envelopes
#[derive(Debug, Clone)]
pub struct RelayPublisher {
    tx: mpsc::Sender<RelayFrame>,
}

impl RelayPublisher {
    /// Queue `envelope` for a single publish on `channel`
    ///
    /// Returns without waiting. A full queue means the relay is not keeping
    /// up and the frame is dropped.
    pub fn publish(&self, channel: &str, envelope: &RelayEnvelope) -> Result<(), RelayError> {
        self.publish_raw(channel, envelope.encode()?)
    }

    pub fn publish_raw(&self, channel: &str, payload: String) -> Result<(), RelayError> {
        let frame = RelayFrame {
            channel: channel.to_string(),
            payload,
        };
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(frame) => {
                warn!(channel = %frame.channel, "Relay publish queue full, frame dropped");
                RelayError::QueueFull
            }
            mpsc::error::TrySendError::Closed(_) => RelayError::PublisherClosed,
        })
    }
}

/// Receiving half of the publish queue, consumed by the publisher task
#[derive(Debug)]
pub struct Outbox {
    rx: mpsc::Receiver<RelayFrame>,
}

impl Outbox {
    #[cfg(test)]
    pub(crate) fn try_recv(&mut self) -> Result<RelayFrame, mpsc::error::TryRecvError> {
        self.rx.try_recv()
    }
}

/// Create a connected publisher/outbox pair holding up to `capacity` frames
pub fn outbox(capacity: usize) -> (RelayPublisher, Outbox) {
    let (tx, rx) = mpsc::channel(capacity);
    (RelayPublisher { tx }, Outbox { rx })
}

/// In-process broadcast channel
///
/// Stands in for the shared backbone when every server lives in one
/// process: single-node deployments without Redis, and tests.
#[derive(Debug, Clone)]
pub struct LocalBus {
    tx: broadcast::Sender<RelayFrame>,
}

impl LocalBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(LOCAL_BUS_CAPACITY)
    }
}

/// Redis connection settings for the relay
#[derive(Debug, Clone)]
pub struct RedisRelay {
    client: redis::Client,
    max_retries: u32,
}

impl RedisRelay {
    pub fn connect(url: &str, password: Option<&str>, max_retries: u32) -> Result<Self, RelayError> {
        let mut info = url.into_connection_info()?;
        if let Some(password) = password {
            info.redis.password = Some(password.to_string());
        }
        Ok(Self {
            client: redis::Client::open(info)?,
            max_retries,
        })
    }
}

/// Shared channel implementation
#[derive(Debug, Clone)]
pub enum RelayBackend {
    Redis(RedisRelay),
    Local(LocalBus),
}

impl RelayBackend {
    /// Redis when a URL is configured, otherwise a private in-process bus
    pub fn from_config(config: &Config) -> Result<Self, RelayError> {
        match &config.redis_url {
            Some(url) => Ok(Self::Redis(RedisRelay::connect(
                url,
                config.redis_password.as_deref(),
                config.relay_max_retries,
            )?)),
            None => Ok(Self::Local(LocalBus::default())),
        }
    }
}

/// Deliver a relay envelope to the recipients held by `registry`
///
/// Recipients are tried independently; one that is not connected here
/// does not stop delivery to the rest. Returns how many were written.
pub fn deliver_local(registry: &SessionRegistry, envelope: &RelayEnvelope) -> usize {
    let mut delivered = 0;
    for user in envelope.recipient.ids() {
        let Some(conn) = registry.get(user) else {
            continue;
        };
        match conn.send(envelope.data()) {
            Ok(()) => {
                trace!(%user, "Recipient found locally, message delivered");
                delivered += 1;
            }
            Err(e) => warn!(%user, error = %e, "Dropping relayed message"),
        }
    }
    delivered
}

/// Handle one raw frame received from the relay channel
///
/// Undecodable frames are dropped; a misbehaving peer must not take this
/// process down.
pub fn handle_frame(registry: &SessionRegistry, payload: &str) -> usize {
    match RelayEnvelope::decode(payload) {
        Ok(envelope) => deliver_local(registry, &envelope),
        Err(e) => {
            debug!(error = %e, "Dropping malformed relay frame");
            0
        }
    }
}

/// Running publisher and subscriber tasks
#[derive(Debug)]
pub struct RelayBridge {
    publisher: JoinHandle<()>,
    /// `None` once the subscriber's result has been taken
    subscriber: Option<JoinHandle<Result<(), RelayError>>>,
}

impl RelayBridge {
    /// Start relaying between `backend` and `registry`
    ///
    /// Subscribes to every channel in `channels`; both tasks stop when
    /// `shutdown` fires.
    pub fn spawn(
        backend: RelayBackend,
        channels: Vec<String>,
        outbox: Outbox,
        registry: Arc<SessionRegistry>,
        shutdown: ShutdownSignal,
    ) -> Self {
        let (publisher, subscriber) = match backend {
            RelayBackend::Local(bus) => {
                // Subscribe before returning so no frame published afterwards is missed
                let rx = bus.tx.subscribe();
                (
                    tokio::spawn(run_local_publisher(bus, outbox, shutdown.clone())),
                    tokio::spawn(run_local_subscriber(rx, channels, registry, shutdown)),
                )
            }
            RelayBackend::Redis(redis) => (
                tokio::spawn(run_redis_publisher(
                    redis.client.clone(),
                    outbox,
                    shutdown.clone(),
                )),
                tokio::spawn(run_redis_subscriber(redis, channels, registry, shutdown)),
            ),
        };
        Self {
            publisher,
            subscriber: Some(subscriber),
        }
    }

    /// Resolves when the subscriber stops; pending forever once it has
    ///
    /// Cancel-safe, for use in `select!` loops.
    pub async fn subscriber_stopped(&mut self) -> Result<(), RelayError> {
        let Some(handle) = self.subscriber.as_mut() else {
            return std::future::pending().await;
        };
        let result = handle.await;
        self.subscriber = None;
        flatten(result)
    }

    /// Wait for both tasks after shutdown has been signalled
    pub async fn join(self) -> Result<(), RelayError> {
        if let Err(e) = self.publisher.await {
            error!(error = %e, "Relay publisher task panicked");
        }
        match self.subscriber {
            Some(handle) => flatten(handle.await),
            None => Ok(()),
        }
    }
}

fn flatten(
    result: Result<Result<(), RelayError>, tokio::task::JoinError>,
) -> Result<(), RelayError> {
    result.unwrap_or_else(|e| {
        error!(error = %e, "Relay subscriber task panicked");
        Err(RelayError::SubscriptionLost)
    })
}

async fn run_local_publisher(bus: LocalBus, mut outbox: Outbox, mut shutdown: ShutdownSignal) {
    loop {
        let frame = tokio::select! {
            biased;
            frame = outbox.rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = shutdown.wait() => break,
        };
        if bus.tx.send(frame).is_err() {
            trace!("No relay subscribers, frame dropped");
        }
    }

    // Frames queued before shutdown still go out
    while let Ok(frame) = outbox.rx.try_recv() {
        let _ = bus.tx.send(frame);
    }
    debug!("Relay publisher stopped");
}

async fn run_local_subscriber(
    mut rx: broadcast::Receiver<RelayFrame>,
    channels: Vec<String>,
    registry: Arc<SessionRegistry>,
    mut shutdown: ShutdownSignal,
) -> Result<(), RelayError> {
    loop {
        tokio::select! {
            _ = shutdown.wait() => break,
            frame = rx.recv() => match frame {
                Ok(frame) if channels.contains(&frame.channel) => {
                    handle_frame(&registry, &frame.payload);
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Relay subscriber lagged, frames dropped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(RelayError::SubscriptionLost);
                }
            },
        }
    }
    debug!("Relay subscriber stopped");
    Ok(())
}

/// Publish side of the Redis relay
///
/// Connects lazily. After a failed connect or publish the connection is
/// dropped and frames are discarded until the backoff delay has passed.
struct RedisPublisher {
    client: redis::Client,
    conn: Option<ConnectionManager>,
    io_timeout: Duration,
    failures: u32,
    retry_at: Option<Instant>,
}

impl RedisPublisher {
    fn new(client: redis::Client, io_timeout: Duration) -> Self {
        Self {
            client,
            conn: None,
            io_timeout,
            failures: 0,
            retry_at: None,
        }
    }

    async fn publish(&mut self, frame: &RelayFrame) -> Result<i64, RelayError> {
        if self.conn.is_none() {
            if self.retry_at.is_some_and(|at| Instant::now() < at) {
                return Err(RelayError::Reconnecting);
            }
            let connected = timeout(self.io_timeout, ConnectionManager::new(self.client.clone())).await;
            match connected {
                Ok(Ok(manager)) => self.conn = Some(manager),
                Ok(Err(e)) => return Err(self.failed(e.into())),
                Err(_) => return Err(self.failed(RelayError::Timeout)),
            }
        }

        let Some(conn) = self.conn.as_mut() else {
            return Err(RelayError::Reconnecting);
        };
        let published = timeout(
            self.io_timeout,
            conn.publish::<_, _, i64>(&frame.channel, &frame.payload),
        )
        .await;
        match published {
            Ok(Ok(receivers)) => {
                self.failures = 0;
                self.retry_at = None;
                Ok(receivers)
            }
            Ok(Err(e)) => Err(self.failed(e.into())),
            Err(_) => Err(self.failed(RelayError::Timeout)),
        }
    }

    fn failed(&mut self, err: RelayError) -> RelayError {
        self.conn = None;
        self.failures += 1;
        self.retry_at = Some(Instant::now() + backoff(self.failures));
        err
    }
}

async fn run_redis_publisher(client: redis::Client, mut outbox: Outbox, mut shutdown: ShutdownSignal) {
    let mut publisher = RedisPublisher::new(client, RELAY_IO_TIMEOUT);

    loop {
        let frame = tokio::select! {
            biased;
            frame = outbox.rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = shutdown.wait() => break,
        };

        match publisher.publish(&frame).await {
            Ok(receivers) => trace!(channel = %frame.channel, receivers, "Relay frame published"),
            Err(RelayError::Reconnecting) => {
                debug!(channel = %frame.channel, "Relay reconnect pending, frame dropped");
            }
            Err(e) => error!(error = %e, channel = %frame.channel, "Relay publish failed, frame dropped"),
        }
    }

    // Frames queued before shutdown still go out while the connection works
    while let Ok(frame) = outbox.rx.try_recv() {
        if let Err(e) = publisher.publish(&frame).await {
            debug!(error = %e, "Relay publish failed during shutdown");
            break;
        }
    }
    debug!("Relay publisher stopped");
}

async fn run_redis_subscriber(
    redis: RedisRelay,
    channels: Vec<String>,
    registry: Arc<SessionRegistry>,
    mut shutdown: ShutdownSignal,
) -> Result<(), RelayError> {
    let mut failures = 0u32;

    loop {
        match subscribe_once(&redis.client, &channels, &registry, &mut shutdown, &mut failures).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                failures += 1;
                error!(
                    error = %e,
                    attempt = failures,
                    "Relay subscription failed, cross-process delivery is down"
                );
                if failures >= redis.max_retries {
                    return Err(RelayError::RetriesExhausted(failures));
                }
                tokio::select! {
                    _ = shutdown.wait() => return Ok(()),
                    _ = tokio::time::sleep(backoff(failures)) => {}
                }
            }
        }
    }
}

/// Subscribe and pump frames until shutdown (Ok) or connection loss (Err)
async fn subscribe_once(
    client: &redis::Client,
    channels: &[String],
    registry: &SessionRegistry,
    shutdown: &mut ShutdownSignal,
    failures: &mut u32,
) -> Result<(), RelayError> {
    let mut pubsub = client.get_async_pubsub().await?;
    for channel in channels {
        pubsub.subscribe(channel).await?;
    }
    *failures = 0;
    info!(?channels, "Subscribed to relay channels");

    let outcome = {
        let mut messages = pubsub.on_message();
        loop {
            tokio::select! {
                _ = shutdown.wait() => break Ok(()),
                msg = messages.next() => match msg {
                    Some(msg) => match msg.get_payload::<String>() {
                        Ok(payload) => {
                            handle_frame(registry, &payload);
                        }
                        Err(e) => debug!(error = %e, "Dropping non-text relay frame"),
                    },
                    None => break Err(RelayError::SubscriptionLost),
                },
            }
        }
    };

    if outcome.is_ok() {
        if let Err(e) = pubsub.unsubscribe(channels.to_vec()).await {
            debug!(error = %e, "Relay unsubscribe failed during shutdown");
        }
        debug!("Relay subscriber stopped");
    }
    outcome
}

fn backoff(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE.saturating_mul(1 << attempt.saturating_sub(1).min(6));
    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..250));
    exp.min(BACKOFF_MAX) + jitter
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::sync::mpsc;

    use crate::connection::{Connection, Outbound};
    use crate::server::Shutdown;
    use crate::types::UserId;

    fn register(registry: &SessionRegistry, user: &str) -> mpsc::Receiver<Outbound> {
        let (tx, rx) = mpsc::channel(8);
        registry.put(UserId::new(user), Arc::new(Connection::new(UserId::new(user), tx)));
        rx
    }

    #[test]
    fn test_single_recipient_delivered_locally() {
        let registry = SessionRegistry::new();
        let mut bob = register(&registry, "bob");

        let delivered = handle_frame(&registry, r#"{"recipient":"bob","data":{"text":"hi"}}"#);

        assert_eq!(delivered, 1);
        assert_eq!(
            bob.try_recv().unwrap(),
            Outbound::Text(r#"{"text":"hi"}"#.to_string())
        );
    }

    #[test]
    fn test_absent_recipient_is_not_an_error() {
        let registry = SessionRegistry::new();
        assert_eq!(handle_frame(&registry, r#"{"recipient":"bob","data":1}"#), 0);
    }

    #[test]
    fn test_many_recipients_continue_past_misses() {
        let registry = SessionRegistry::new();
        let mut a = register(&registry, "a");
        let mut c = register(&registry, "c");

        let delivered = handle_frame(&registry, r#"{"recipient":["a","b","c"],"data":"x"}"#);

        assert_eq!(delivered, 2);
        assert_eq!(a.try_recv().unwrap(), Outbound::Text(r#""x""#.to_string()));
        assert_eq!(c.try_recv().unwrap(), Outbound::Text(r#""x""#.to_string()));
    }

    #[test]
    fn test_malformed_frames_are_dropped() {
        let registry = SessionRegistry::new();
        let mut bob = register(&registry, "bob");

        for frame in ["", "nope", "[]", r#"{"data":1}"#, r#"{"recipient":"bob"}"#] {
            assert_eq!(handle_frame(&registry, frame), 0);
        }
        assert!(bob.try_recv().is_err());
    }

    #[test]
    fn test_publish_after_shutdown_fails() {
        let (publisher, outbox) = outbox(8);
        drop(outbox);
        let relay = RelayEnvelope::from_value(UserId::new("b"), &1).unwrap();
        assert!(matches!(
            publisher.publish("global", &relay),
            Err(RelayError::PublisherClosed)
        ));
    }

    #[test]
    fn test_full_publish_queue_drops_frame() {
        let (publisher, mut outbox) = outbox(1);
        let relay = RelayEnvelope::from_value(UserId::new("b"), &1).unwrap();

        publisher.publish("global", &relay).unwrap();
        assert!(matches!(
            publisher.publish("global", &relay),
            Err(RelayError::QueueFull)
        ));

        // The queued frame is intact and room is available again
        assert_eq!(outbox.try_recv().unwrap().payload, r#"{"recipient":"b","data":1}"#);
        publisher.publish("global", &relay).unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_redis_backs_off() {
        let client = redis::Client::open("redis://127.0.0.1:1/").unwrap();
        let mut publisher = RedisPublisher::new(client, Duration::from_secs(2));
        let frame = RelayFrame {
            channel: "global".to_string(),
            payload: "{}".to_string(),
        };

        let first = timeout(Duration::from_secs(5), publisher.publish(&frame))
            .await
            .unwrap();
        assert!(first.is_err());
        assert_eq!(publisher.failures, 1);

        // Within the backoff window no connect is attempted
        assert!(matches!(
            publisher.publish(&frame).await,
            Err(RelayError::Reconnecting)
        ));
        assert_eq!(publisher.failures, 1);
    }

    #[test]
    fn test_backoff_is_bounded() {
        assert!(backoff(1) >= BACKOFF_BASE);
        assert!(backoff(50) <= BACKOFF_MAX + Duration::from_millis(250));
    }

    /// Two "processes" on one bus: only the one holding the recipient delivers
    #[tokio::test]
    async fn test_broadcast_delivers_only_where_recipient_lives() {
        let bus = LocalBus::default();
        let shutdown = Shutdown::new();

        let registry_a = Arc::new(SessionRegistry::new());
        let registry_b = Arc::new(SessionRegistry::new());
        let mut bob_on_b = register(&registry_b, "bob");
        let mut carol_on_a = register(&registry_a, "carol");

        let (publisher_a, outbox_a) = outbox(8);
        let (_publisher_b, outbox_b) = outbox(8);
        let channels = vec!["global".to_string()];
        let bridge_a = RelayBridge::spawn(
            RelayBackend::Local(bus.clone()),
            channels.clone(),
            outbox_a,
            registry_a.clone(),
            shutdown.signal(),
        );
        let bridge_b = RelayBridge::spawn(
            RelayBackend::Local(bus.clone()),
            channels,
            outbox_b,
            registry_b.clone(),
            shutdown.signal(),
        );

        let relay = RelayEnvelope::from_value(UserId::new("bob"), &"hello").unwrap();
        publisher_a.publish("global", &relay).unwrap();

        let got = timeout(Duration::from_secs(1), bob_on_b.recv()).await.unwrap();
        assert_eq!(got, Some(Outbound::Text(r#""hello""#.to_string())));

        // Frames on channels nobody subscribed to are ignored
        publisher_a.publish("elsewhere", &relay).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(bob_on_b.try_recv().is_err());
        assert!(carol_on_a.try_recv().is_err());

        shutdown.trigger();
        bridge_a.join().await.unwrap();
        bridge_b.join().await.unwrap();
    }
}
