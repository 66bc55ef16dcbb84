//! TCP server and per-connection protocol loop.
//!
//! One task per accepted connection, all sharing a single [`SessionStore`].
//! A connection runs decode -> process -> respond until the peer closes or
//! an unrecoverable error occurs. Malformed input and unknown commands drop
//! the connection without a response; domain failures (duplicate login,
//! unknown recipient) are reported in-protocol with a non-OK status code
//! and the connection stays open.

use crate::config::Config;
use crate::protocol::{read_frame, Command, FrameError, ParseError, Response, StatusCode};
use crate::session::{ConnId, SessionError, SessionStore};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, trace, warn};

/// Server instance
pub struct Server {
    config: Config,
    store: Arc<SessionStore>,
    connection_limit: Arc<Semaphore>,
    next_conn_id: AtomicU64,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: Config) -> Self {
        let connection_limit = Arc::new(Semaphore::new(config.max_connections));
        Server {
            config,
            store: SessionStore::new(),
            connection_limit,
            next_conn_id: AtomicU64::new(1),
        }
    }

    /// Start the server and begin accepting connections
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.listen).await?;
        info!(address = %self.config.listen, "Server listening");

        loop {
            // Wait for a connection slot
            let permit = self.connection_limit.clone().acquire_owned().await?;

            match listener.accept().await {
                Ok((stream, addr)) => {
                    let conn = ConnId(self.next_conn_id.fetch_add(1, Ordering::Relaxed));
                    debug!(peer = %addr, conn = conn.0, "New connection");

                    let store = Arc::clone(&self.store);

                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, store, conn).await {
                            debug!(conn = conn.0, error = %e, "Connection error");
                        }
                        drop(permit);
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    /// Get a reference to the session store for testing
    #[cfg(test)]
    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }
}

/// Drive a single client connection to completion.
///
/// Whatever ends the loop, the connection's user (if any) is logged out so
/// nobody stays marked online after their transport is gone.
pub(crate) async fn handle_connection<S>(
    mut stream: S,
    store: Arc<SessionStore>,
    conn: ConnId,
) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let result = connection_loop(&mut stream, &store, conn).await;
    store.logout(conn);
    result
}

async fn connection_loop<S>(
    stream: &mut S,
    store: &SessionStore,
    conn: ConnId,
) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let body = match read_frame(stream).await {
            Ok(Some(body)) => body,
            Ok(None) => {
                trace!(conn = conn.0, "Connection closed by client");
                return Ok(());
            }
            Err(e @ (FrameError::Malformed | FrameError::TooLarge(_))) => {
                warn!(conn = conn.0, error = %e, "Dropping connection on bad frame");
                return Ok(());
            }
            Err(FrameError::Io(e)) => return Err(e),
        };

        let command = match Command::parse(&body) {
            Ok(command) => command,
            Err(e @ ParseError::UnknownCommand(_)) => {
                warn!(conn = conn.0, error = %e, "Dropping connection on unknown command");
                return Ok(());
            }
            Err(e) => {
                warn!(conn = conn.0, error = %e, "Dropping connection on malformed command");
                return Ok(());
            }
        };

        trace!(conn = conn.0, ?command, "Processing command");

        let response = match execute_command(&command, store, conn).await {
            Ok(response) => response,
            Err(SessionError::QueueClosed) => {
                // Drain side vanished while senders remain; nothing sane to
                // report to the client.
                error!(conn = conn.0, "Recipient queue closed, dropping connection");
                return Ok(());
            }
            Err(e) => {
                debug!(conn = conn.0, error = %e, "Command rejected");
                Response::with_status(&command.metadata(), error_status(&e))
            }
        };

        stream.write_all(&response.encode()).await?;
    }
}

/// Execute one parsed command against the store.
pub(crate) async fn execute_command(
    command: &Command,
    store: &SessionStore,
    conn: ConnId,
) -> Result<Response, SessionError> {
    match command {
        Command::Login { metadata, username } => {
            store.login(conn, username)?;
            Ok(Response::ok(metadata))
        }

        Command::Message {
            metadata,
            text,
            from,
            to,
            sent_at,
        } => {
            store.enqueue(from, to, *sent_at, text).await?;
            Ok(Response::ok(metadata))
        }

        Command::CorrelationIdTest { metadata } => Ok(Response::ok(metadata)),
    }
}

/// Wire status reported for a recoverable domain failure.
fn error_status(error: &SessionError) -> StatusCode {
    match error {
        SessionError::UserAlreadyOnline => StatusCode::UserAlreadyLogged,
        SessionError::RecipientNotFound => StatusCode::UserNotFound,
        // Handled before responding; mapped here for completeness
        SessionError::QueueClosed => StatusCode::UserNotFound,
    }
}
