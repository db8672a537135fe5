//! Connection handle
//!
//! Send-side capability and liveness state of one accepted WebSocket.
//! The handle is shared between the session registry and the task that
//! owns the socket; the socket itself never leaves that task.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{mpsc, Notify};

use crate::error::SendError;
use crate::types::{ConnectionId, UserId};

/// Frame queued for the connection's writer task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Ping,
}

/// Live connection owned by this process
///
/// Holds the user identity, the outbound queue and the liveness flag
/// flipped by the heartbeat sweep and by pongs.
#[derive(Debug)]
pub struct Connection {
    user: UserId,
    id: ConnectionId,
    /// Server → client frame queue
    sender: mpsc::Sender<Outbound>,
    /// Cleared on each heartbeat tick, set again by a pong
    alive: AtomicBool,
    terminated: AtomicBool,
    terminate: Notify,
}

impl Connection {
    /// Create a new connection for `user` writing into `sender`
    pub fn new(user: UserId, sender: mpsc::Sender<Outbound>) -> Self {
        Self {
            user,
            id: ConnectionId::new(),
            sender,
            alive: AtomicBool::new(true),
            terminated: AtomicBool::new(false),
            terminate: Notify::new(),
        }
    }

    pub fn user(&self) -> &UserId {
        &self.user
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue a text frame without waiting
    ///
    /// A full queue means the client is not keeping up; the frame is
    /// dropped rather than stalling the caller.
    pub fn send(&self, text: impl Into<String>) -> Result<(), SendError> {
        self.enqueue(Outbound::Text(text.into()))
    }

    /// Queue a liveness probe
    pub fn ping(&self) -> Result<(), SendError> {
        self.enqueue(Outbound::Ping)
    }

    fn enqueue(&self, frame: Outbound) -> Result<(), SendError> {
        self.sender.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => SendError::ChannelClosed,
        })
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Record a liveness response
    pub fn mark_alive(&self) {
        self.alive.store(true, Ordering::Release);
    }

    /// Clear the liveness flag, returning whether it was set
    pub fn mark_unconfirmed(&self) -> bool {
        self.alive.swap(false, Ordering::AcqRel)
    }

    /// Ask the owning task to close the socket and tear down
    pub fn terminate(&self) {
        self.terminated.store(true, Ordering::Release);
        self.terminate.notify_waiters();
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Resolves once `terminate` has been called, including before the wait
    pub async fn terminated(&self) {
        let notified = self.terminate.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_terminated() {
            return;
        }
        notified.await;
    }
}
