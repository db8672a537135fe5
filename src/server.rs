//! RelayServer context object
//!
//! Owns everything one server instance needs: its session registry,
//! dispatch table, codec, authenticator and relay publisher. Handlers get
//! a `&RelayServer` as an explicit argument, so several independent
//! servers can live in one process.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, trace, warn};

use crate::auth::Authenticator;
use crate::config::Config;
use crate::connection::Connection;
use crate::dispatch::DispatchTable;
use crate::error::{AppError, DecodeError, RelayError};
use crate::handler::handle_connection;
use crate::heartbeat;
use crate::message::{Codec, Envelope, Recipient, RelayEnvelope};
use crate::registry::SessionRegistry;
use crate::relay::{self, Outbox, RelayBackend, RelayBridge, RelayPublisher};
use crate::types::Tag;

/// Extra time given to connection tasks to close after shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Listen backlog for the server socket
const LISTEN_BACKLOG: u32 = 1024;

/// Shutdown trigger shared by every task of one server
#[derive(Debug)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving side of `Shutdown`
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Resolves once shutdown has been triggered (or the trigger is gone)
    pub async fn wait(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }
}

/// Builder collecting handlers before the server starts
pub struct ServerBuilder {
    config: Config,
    dispatch: DispatchTable,
}

impl ServerBuilder {
    /// Register the handler for `tag` (last registration wins)
    pub fn on<F>(mut self, tag: impl Into<Tag>, handler: F) -> Self
    where
        F: Fn(&RelayServer, &Arc<Connection>, Envelope) + Send + Sync + 'static,
    {
        self.dispatch.register(tag, handler);
        self
    }

    pub fn on_connect<F>(mut self, hook: F) -> Self
    where
        F: Fn(&RelayServer, &Arc<Connection>) + Send + Sync + 'static,
    {
        self.dispatch.set_on_connect(hook);
        self
    }

    pub fn on_disconnect<F>(mut self, hook: F) -> Self
    where
        F: Fn(&RelayServer, &Arc<Connection>) + Send + Sync + 'static,
    {
        self.dispatch.set_on_disconnect(hook);
        self
    }

    pub fn build(self) -> RelayServer {
        if self.config.secret.is_none() {
            warn!("No secret provided, connecting clients will not be verified");
        }

        let (publisher, outbox) = relay::outbox(relay::PUBLISH_QUEUE_CAPACITY);
        RelayServer {
            inner: Arc::new(Inner {
                codec: Codec::new(self.config.tag_field.clone()),
                auth: Authenticator::new(self.config.secret.as_deref()),
                registry: Arc::new(SessionRegistry::new()),
                dispatch: self.dispatch,
                publisher,
                outbox: Mutex::new(Some(outbox)),
                shutdown: Shutdown::new(),
                config: self.config,
            }),
        }
    }
}

struct Inner {
    config: Config,
    codec: Codec,
    auth: Authenticator,
    registry: Arc<SessionRegistry>,
    dispatch: DispatchTable,
    publisher: RelayPublisher,
    /// Taken by `serve`
    outbox: Mutex<Option<Outbox>>,
    shutdown: Shutdown,
}

/// Handle to one server instance
///
/// Cheap to clone; every clone refers to the same registry and relay.
#[derive(Clone)]
pub struct RelayServer {
    inner: Arc<Inner>,
}

impl RelayServer {
    pub fn builder(config: Config) -> ServerBuilder {
        ServerBuilder {
            config,
            dispatch: DispatchTable::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn codec(&self) -> &Codec {
        &self.inner.codec
    }

    pub fn authenticator(&self) -> &Authenticator {
        &self.inner.auth
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.inner.registry
    }

    pub fn dispatch_table(&self) -> &DispatchTable {
        &self.inner.dispatch
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.inner.shutdown.signal()
    }

    /// Stop `serve` and every connection task
    pub fn shutdown(&self) {
        self.inner.shutdown.trigger();
    }

    /// Write text to a local connection
    ///
    /// Best effort: a closed or saturated connection drops the message.
    pub fn send(&self, conn: &Connection, text: impl Into<String>) {
        if let Err(e) = conn.send(text) {
            warn!(user = %conn.user(), error = %e, "Dropping outbound message");
        }
    }

    /// Serialize `value` and write it to a local connection
    pub fn send_json<T: Serialize>(&self, conn: &Connection, value: &T) {
        match serde_json::to_string(value) {
            Ok(json) => self.send(conn, json),
            Err(e) => error!(error = %e, "Failed to serialize message"),
        }
    }

    /// Deliver `envelope` wherever its recipients are connected
    ///
    /// Recipients connected here are written directly. The rest are
    /// published once, as a single relay envelope on the default channel,
    /// for the other processes to pick up. Local recipients are left out
    /// of the published envelope so nobody gets two copies. Returns the
    /// number of local deliveries.
    pub fn deliver(&self, envelope: &RelayEnvelope) -> Result<usize, RelayError> {
        let mut delivered = 0;
        let mut remote = Vec::new();

        for user in envelope.recipient.ids() {
            match self.inner.registry.get(user) {
                Some(conn) => match conn.send(envelope.data()) {
                    Ok(()) => delivered += 1,
                    Err(e) => warn!(%user, error = %e, "Dropping local delivery"),
                },
                None => remote.push(user.clone()),
            }
        }

        if !remote.is_empty() {
            let recipient = match &envelope.recipient {
                Recipient::One(user) => Recipient::One(user.clone()),
                Recipient::Many(_) => Recipient::Many(remote),
            };
            let outbound = RelayEnvelope {
                recipient,
                data: envelope.data.clone(),
            };
            self.publish(self.inner.config.default_channel(), &outbound)?;
        }

        Ok(delivered)
    }

    /// Publish `envelope` on `channel` for every process, this one included
    ///
    /// Fire-and-forget; see `RelayPublisher::publish`.
    pub fn publish(&self, channel: &str, envelope: &RelayEnvelope) -> Result<(), RelayError> {
        self.inner.publisher.publish(channel, envelope)
    }

    /// Decode an inbound text frame and dispatch it
    ///
    /// Undecodable frames are logged and dropped; the connection stays up.
    /// Returns whether a handler ran.
    pub fn handle_message(&self, conn: &Arc<Connection>, text: &str) -> bool {
        trace!(user = %conn.user(), %text, "Received frame");
        self.dispatch_decoded(conn, self.inner.codec.decode(text))
    }

    /// Binary frames are accepted when they carry UTF-8 text
    pub fn handle_binary(&self, conn: &Arc<Connection>, bytes: &[u8]) -> bool {
        self.dispatch_decoded(conn, self.inner.codec.decode_bytes(bytes))
    }

    fn dispatch_decoded(&self, conn: &Arc<Connection>, decoded: Result<Envelope, DecodeError>) -> bool {
        match decoded {
            Ok(envelope) => self.inner.dispatch.dispatch(self, conn, envelope),
            Err(e) => {
                warn!(user = %conn.user(), error = %e, "Dropping undecodable message");
                false
            }
        }
    }

    /// Accept connections until `shutdown` resolves or the relay fails
    ///
    /// Starts the heartbeat and the relay bridge on `backend`. On the way
    /// out every connection is closed and the relay unsubscribed. A fatal
    /// relay failure is returned as an error.
    pub async fn serve<F>(&self, listener: TcpListener, backend: RelayBackend, shutdown: F) -> Result<(), AppError>
    where
        F: Future<Output = ()>,
    {
        let outbox = self
            .inner
            .outbox
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(AppError::AlreadyServing)?;

        let config = &self.inner.config;
        let mut bridge = RelayBridge::spawn(
            backend,
            config.channels.clone(),
            outbox,
            self.inner.registry.clone(),
            self.shutdown_signal(),
        );
        let heartbeat = tokio::spawn(heartbeat::run(
            self.inner.registry.clone(),
            config.ping_interval,
            self.shutdown_signal(),
        ));

        info!(
            addr = ?listener.local_addr().ok(),
            channels = ?config.channels,
            ping_interval_ms = config.ping_interval.as_millis() as u64,
            "Relay server accepting connections"
        );

        let mut connections = JoinSet::new();
        let mut stop = self.shutdown_signal();
        tokio::pin!(shutdown);

        // Connection accept loop
        let outcome = loop {
            tokio::select! {
                _ = &mut shutdown => break Ok(()),
                _ = stop.wait() => break Ok(()),
                result = bridge.subscriber_stopped() => {
                    if let Err(e) = &result {
                        error!(error = %e, "Relay bridge failed, stopping server");
                    }
                    break result;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        trace!("New connection from {}", addr);
                        let server = self.clone();
                        connections.spawn(async move {
                            if let Err(e) = handle_connection(stream, server).await {
                                debug!(peer = %addr, error = %e, "Connection handler error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                    }
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        };

        info!(connections = self.inner.registry.len(), "Relay server shutting down");
        self.shutdown();

        let grace = config.write_timeout + SHUTDOWN_GRACE;
        if tokio::time::timeout(grace, async { while connections.join_next().await.is_some() {} })
            .await
            .is_err()
        {
            warn!(remaining = connections.len(), "Connections did not close in time, aborting");
            connections.shutdown().await;
        }

        let _ = heartbeat.await;
        let relay_result = bridge.join().await;

        outcome?;
        relay_result?;
        Ok(())
    }
}

/// Bind the listening socket for `config`
///
/// The port can be shared by several worker processes; the kernel
/// balances accepted connections across them.
pub async fn bind(config: &Config) -> Result<TcpListener, AppError> {
    let addr = tokio::net::lookup_host(config.bind_addr())
        .await?
        .next()
        .ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                format!("cannot resolve {}", config.bind_addr()),
            )
        })?;

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    #[cfg(unix)]
    socket.set_reuseport(true)?;
    socket.bind(addr)?;
    Ok(socket.listen(LISTEN_BACKLOG)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::sync::mpsc;

    use crate::connection::Outbound;
    use crate::relay::RelayFrame;
    use crate::types::UserId;

    fn connect(server: &RelayServer, user: &str) -> (Arc<Connection>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(8);
        let conn = Arc::new(Connection::new(UserId::new(user), tx));
        server.registry().put(conn.user().clone(), conn.clone());
        (conn, rx)
    }

    fn take_outbox(server: &RelayServer) -> Outbox {
        server.inner.outbox.lock().unwrap().take().unwrap()
    }

    fn published(outbox: &mut Outbox) -> Vec<RelayFrame> {
        let mut frames = Vec::new();
        while let Ok(frame) = outbox.try_recv() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn test_deliver_single_local_recipient() {
        let server = RelayServer::builder(Config::default()).build();
        let mut outbox = take_outbox(&server);
        let (_bob, mut rx) = connect(&server, "bob");

        let relay = RelayEnvelope::from_value(UserId::new("bob"), &"hi").unwrap();
        assert_eq!(server.deliver(&relay).unwrap(), 1);

        assert_eq!(rx.try_recv().unwrap(), Outbound::Text(r#""hi""#.to_string()));
        assert!(published(&mut outbox).is_empty());
    }

    #[test]
    fn test_deliver_remote_recipient_publishes_once() {
        let server = RelayServer::builder(Config::default()).build();
        let mut outbox = take_outbox(&server);

        let relay = RelayEnvelope::from_value(UserId::new("bob"), &"hi").unwrap();
        assert_eq!(server.deliver(&relay).unwrap(), 0);

        assert_eq!(
            published(&mut outbox),
            vec![RelayFrame {
                channel: "global".to_string(),
                payload: r#"{"recipient":"bob","data":"hi"}"#.to_string(),
            }]
        );
    }

    #[test]
    fn test_deliver_mixed_recipients_publishes_only_remote() {
        let server = RelayServer::builder(Config::default()).build();
        let mut outbox = take_outbox(&server);
        let (_a, mut rx_a) = connect(&server, "a");

        let ids = vec![UserId::new("a"), UserId::new("b"), UserId::new("c")];
        let relay = RelayEnvelope::from_value(ids, &1).unwrap();
        assert_eq!(server.deliver(&relay).unwrap(), 1);

        assert_eq!(rx_a.try_recv().unwrap(), Outbound::Text("1".to_string()));
        let frames = published(&mut outbox);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload, r#"{"recipient":["b","c"],"data":1}"#);
    }

    #[test]
    fn test_handle_message_dispatches() {
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = hits.clone();
        let server = RelayServer::builder(Config::default())
            .on("chat", move |_, conn, envelope| {
                assert_eq!(conn.user().as_str(), "alice");
                assert_eq!(envelope.tag().as_str(), "chat");
                seen.fetch_add(1, Ordering::SeqCst);
            })
            .build();
        let (alice, _rx) = connect(&server, "alice");

        assert!(server.handle_message(&alice, r#"{"t": "chat"}"#));
        assert!(server.handle_binary(&alice, br#"{"t": "chat"}"#));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_undecodable_message_invokes_nothing() {
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = hits.clone();
        let server = RelayServer::builder(Config::default())
            .on("chat", move |_, _, _| {
                seen.fetch_add(1, Ordering::SeqCst);
            })
            .build();
        let (alice, _rx) = connect(&server, "alice");

        for frame in [r#"{"type": "chat"}"#, "{", "null", r#"{"t": ["chat"]}"#] {
            assert!(!server.handle_message(&alice, frame));
        }
        assert!(!server.handle_binary(&alice, &[0xc3, 0x28]));
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        // Data frames are not liveness responses
        alice.mark_unconfirmed();
        server.handle_message(&alice, r#"{"t": "chat"}"#);
        assert!(!alice.is_alive());
    }

    #[test]
    fn test_handler_can_deliver_through_server() {
        let server = RelayServer::builder(Config::default())
            .on("m", |server, _, envelope| {
                if let Some(relay) = envelope.relay() {
                    server.deliver(relay).unwrap();
                }
            })
            .build();
        let (alice, _rx_alice) = connect(&server, "alice");
        let (_bob, mut rx_bob) = connect(&server, "bob");

        server.handle_message(&alice, r#"{"t":"m","recipient":"bob","data":{"x": 1}}"#);

        assert_eq!(rx_bob.try_recv().unwrap(), Outbound::Text(r#"{"x": 1}"#.to_string()));
    }

    #[tokio::test]
    async fn test_serve_twice_fails() {
        let server = RelayServer::builder(Config::default()).build();
        let _outbox = take_outbox(&server);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let result = server
            .serve(listener, RelayBackend::Local(Default::default()), async {})
            .await;
        assert!(matches!(result, Err(AppError::AlreadyServing)));
    }

    #[tokio::test]
    async fn test_shutdown_signal() {
        let shutdown = Shutdown::new();
        let mut signal = shutdown.signal();
        assert!(!signal.is_triggered());

        shutdown.trigger();
        signal.wait().await;
        assert!(signal.is_triggered());

        // Late subscribers see the trigger too
        shutdown.signal().wait().await;
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let config = Config {
            port: 0,
            ..Config::default()
        };
        let listener = bind(&config).await.unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }
}
