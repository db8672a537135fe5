//! WebSocket connection handler
//!
//! Handles individual client connections: authenticated WebSocket
//! handshake, registration, inbound decoding and dispatch, outbound
//! writes, and teardown.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, trace, warn};

use crate::auth::Identity;
use crate::connection::{Connection, Outbound};
use crate::error::{AppError, AuthError};
use crate::server::RelayServer;

/// Handle a new TCP connection
///
/// Performs the authenticated WebSocket handshake, registers the
/// connection, and runs it until the client goes away, the heartbeat
/// reaps it, or the server shuts down.
pub async fn handle_connection(stream: TcpStream, server: RelayServer) -> Result<(), AppError> {
    let peer_addr = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    trace!("New TCP connection from {}", peer_addr);

    // WebSocket handshake, refused before upgrade when the token is bad
    let mut identity: Option<Identity> = None;
    let auth = server.authenticator();
    let callback = |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
        match auth.verify(req.uri()) {
            Ok(verified) => {
                identity = Some(verified);
                Ok(response)
            }
            Err(e) => Err(reject(&e)),
        }
    };
    let handshake_timeout = server.config().handshake_timeout;
    let accepted = match timeout(
        handshake_timeout,
        tokio_tungstenite::accept_hdr_async(stream, callback),
    )
    .await
    {
        Ok(accepted) => accepted,
        Err(_) => {
            debug!(peer = %peer_addr, "Handshake timed out, closing");
            return Ok(());
        }
    };

    let ws_stream = match accepted {
        Ok(ws) => ws,
        Err(WsError::Http(response)) => {
            debug!(peer = %peer_addr, status = %response.status(), "Handshake refused");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };
    let Some(identity) = identity else {
        return Ok(());
    };

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    // Create channel for server -> client frames
    let config = server.config();
    let (msg_tx, mut msg_rx) = mpsc::channel::<Outbound>(config.outbound_buffer);
    let conn = Arc::new(Connection::new(identity.user, msg_tx));

    // Register, replacing any earlier connection of the same user
    if let Some(prior) = server.registry().put(conn.user().clone(), conn.clone()) {
        info!(user = %conn.user(), replaced = %prior.id(), "Replacing previous connection");
        prior.terminate();
    }
    let registration = Registration {
        server: server.clone(),
        conn: conn.clone(),
    };
    info!(user = %conn.user(), conn_id = %conn.id(), peer = %peer_addr, "Client connected");

    server.dispatch_table().connected(&server, &conn);

    // Spawn write task (Outbound -> WebSocket)
    let write_timeout = config.write_timeout;
    let writer_conn = conn.clone();
    let mut write_task = tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                biased;
                _ = writer_conn.terminated() => break,
                frame = msg_rx.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };

            let message = match frame {
                Outbound::Text(text) => Message::Text(text.into()),
                Outbound::Ping => Message::Ping(Vec::new()),
            };

            match timeout(write_timeout, ws_sender.send(message)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!(user = %writer_conn.user(), error = %e, "WebSocket send failed");
                    return;
                }
                Err(_) => {
                    warn!(user = %writer_conn.user(), "WebSocket write timed out, closing");
                    return;
                }
            }
        }

        // Send close frame when done
        let _ = timeout(write_timeout, ws_sender.close()).await;
    });

    // Spawn read task (WebSocket -> dispatch)
    let reader_server = server.clone();
    let reader_conn = conn.clone();
    let mut read_task = tokio::spawn(async move {
        while let Some(msg_result) = ws_receiver.next().await {
            match msg_result {
                Ok(Message::Text(text)) => {
                    reader_server.handle_message(&reader_conn, &text);
                }
                Ok(Message::Binary(bytes)) => {
                    reader_server.handle_binary(&reader_conn, &bytes);
                }
                Ok(Message::Pong(_)) => {
                    reader_conn.mark_alive();
                }
                Ok(Message::Ping(_)) => {
                    // Pong is handled automatically by tungstenite
                    trace!(user = %reader_conn.user(), "Ping from client");
                }
                Ok(Message::Close(_)) => {
                    debug!(user = %reader_conn.user(), "Client sent close frame");
                    break;
                }
                Ok(Message::Frame(_)) => {}
                Err(e) => {
                    debug!(user = %reader_conn.user(), error = %e, "WebSocket read error");
                    break;
                }
            }
        }
    });

    // Wait for either side to finish, or for shutdown
    let mut shutdown = server.shutdown_signal();
    tokio::select! {
        _ = &mut read_task => {
            trace!(user = %conn.user(), "Read task completed");
        }
        _ = &mut write_task => {
            trace!(user = %conn.user(), "Write task completed");
        }
        _ = shutdown.wait() => {
            conn.terminate();
            let _ = (&mut write_task).await;
        }
    }
    read_task.abort();
    write_task.abort();

    drop(registration);
    server.dispatch_table().disconnected(&server, &conn);

    info!(user = %conn.user(), conn_id = %conn.id(), "Client disconnected");

    Ok(())
}

/// Registry entry of a live connection
///
/// Dropping it unregisters the connection, also when the task unwinds
/// out of an application hook. A replacement connection keeps its entry.
struct Registration {
    server: RelayServer,
    conn: Arc<Connection>,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.conn.terminate();
        self.server
            .registry()
            .remove_connection(self.conn.user(), self.conn.id());
    }
}

/// Refusal sent instead of the upgrade response
fn reject(err: &AuthError) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(err.to_string()));
    *response.status_mut() = StatusCode::UNAUTHORIZED;
    response
}
