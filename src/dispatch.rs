//! Event dispatch table
//!
//! Maps a message tag to the application handler for it, plus the
//! connected/disconnected lifecycle hooks. Handlers receive the server
//! and the originating connection as explicit arguments.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::warn;

use crate::connection::Connection;
use crate::message::Envelope;
use crate::server::RelayServer;
use crate::types::Tag;

/// Handler for one message tag
pub type Handler = Arc<dyn Fn(&RelayServer, &Arc<Connection>, Envelope) + Send + Sync>;

/// Lifecycle callback fired on connect/disconnect
pub type ConnectionHook = Arc<dyn Fn(&RelayServer, &Arc<Connection>) + Send + Sync>;

/// Tag → handler table
///
/// Exactly one handler per tag. Registering a tag twice replaces the
/// earlier handler (last registration wins); callers must not rely on
/// multiple handlers per tag.
#[derive(Clone, Default)]
pub struct DispatchTable {
    handlers: HashMap<Tag, Handler>,
    on_connect: Option<ConnectionHook>,
    on_disconnect: Option<ConnectionHook>,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `tag`, returning the handler it replaced
    pub fn register<F>(&mut self, tag: impl Into<Tag>, handler: F) -> Option<Handler>
    where
        F: Fn(&RelayServer, &Arc<Connection>, Envelope) + Send + Sync + 'static,
    {
        let tag = tag.into();
        let replaced = self.handlers.insert(tag.clone(), Arc::new(handler));
        if replaced.is_some() {
            warn!(%tag, "Handler registered twice, previous handler replaced");
        }
        replaced
    }

    pub fn set_on_connect<F>(&mut self, hook: F)
    where
        F: Fn(&RelayServer, &Arc<Connection>) + Send + Sync + 'static,
    {
        self.on_connect = Some(Arc::new(hook));
    }

    pub fn set_on_disconnect<F>(&mut self, hook: F)
    where
        F: Fn(&RelayServer, &Arc<Connection>) + Send + Sync + 'static,
    {
        self.on_disconnect = Some(Arc::new(hook));
    }

    pub fn contains(&self, tag: &Tag) -> bool {
        self.handlers.contains_key(tag)
    }

    /// Route `envelope` to its handler
    ///
    /// Returns false (after logging) when no handler is registered.
    pub fn dispatch(&self, server: &RelayServer, conn: &Arc<Connection>, envelope: Envelope) -> bool {
        match self.handlers.get(envelope.tag()) {
            Some(handler) => {
                handler(server, conn, envelope);
                true
            }
            None => {
                warn!(tag = %envelope.tag(), user = %conn.user(), "Unhandled message type");
                false
            }
        }
    }

    pub fn connected(&self, server: &RelayServer, conn: &Arc<Connection>) {
        if let Some(hook) = &self.on_connect {
            hook(server, conn);
        }
    }

    pub fn disconnected(&self, server: &RelayServer, conn: &Arc<Connection>) {
        if let Some(hook) = &self.on_disconnect {
            hook(server, conn);
        }
    }
}

impl fmt::Debug for DispatchTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchTable")
            .field("tags", &self.handlers.keys().collect::<Vec<_>>())
            .field("on_connect", &self.on_connect.is_some())
            .field("on_disconnect", &self.on_disconnect.is_some())
            .finish()
    }
}
