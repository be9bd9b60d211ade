//! Handshake gate
//!
//! Upgrades a freshly accepted TCP stream to a WebSocket, then waits a
//! bounded time for the client's username claim before handing the
//! connection to the registry. Connections that never identify themselves
//! are closed here and the registry never hears of them.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::{self, Instant};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tracing::{debug, info};

use crate::connection::Connection;
use crate::error::AppError;
use crate::message::ClaimUsernameRequest;
use crate::registry::RegistryHandle;
use crate::types::Username;

/// Accepts new connections on behalf of the registry
#[derive(Debug, Clone)]
pub struct HandshakeGate {
    registry: RegistryHandle,
    ws_path: String,
    timeout: Duration,
}

impl HandshakeGate {
    pub fn new(registry: RegistryHandle, ws_path: impl Into<String>, timeout: Duration) -> Self {
        Self {
            registry,
            ws_path: ws_path.into(),
            timeout,
        }
    }

    /// Handle a new TCP connection end to end
    ///
    /// Performs the upgrade (only on the configured path), waits for the
    /// username claim and emits a join. Ownership of the connection passes
    /// to the registry on success. The upgrade and the claim share one
    /// deadline, so a peer that never completes the HTTP upgrade is dropped
    /// as well.
    pub async fn accept<S>(&self, stream: S, peer: String) -> Result<(), AppError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let ws_path = self.ws_path.clone();
        let check_path = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            if req.uri().path() == ws_path {
                return Ok(resp);
            }
            let mut err = ErrorResponse::new(Some("not found".to_string()));
            *err.status_mut() = StatusCode::NOT_FOUND;
            Err(err)
        };

        let deadline = Instant::now() + self.timeout;
        let upgrade = tokio_tungstenite::accept_hdr_async(stream, check_path);
        let ws = match time::timeout_at(deadline, upgrade).await {
            Ok(ws) => ws?,
            Err(_) => {
                debug!("Upgrade from {} timed out", peer);
                return Err(AppError::HandshakeTimeout);
            }
        };
        debug!("WebSocket upgraded for {}", peer);

        let connection = Connection::new(ws, peer);
        let (username, connection) = self.claim_until(connection, deadline).await?;
        info!("{} claims '{}'", connection.peer(), username);

        self.registry.join(username, connection).await
    }

    /// Wait for the username claim
    ///
    /// On timeout, unreadable input, a non-claim message or an empty name
    /// the connection is closed and an error returned. There is no retry.
    pub async fn claim(&self, connection: Connection) -> Result<(Username, Connection), AppError> {
        self.claim_until(connection, Instant::now() + self.timeout).await
    }

    async fn claim_until(
        &self,
        mut connection: Connection,
        deadline: Instant,
    ) -> Result<(Username, Connection), AppError> {
        let result = time::timeout_at(deadline, connection.recv::<ClaimUsernameRequest>()).await;

        let err = match result {
            Ok(Ok(claim)) if !claim.username.is_empty() => return Ok((claim.username, connection)),
            Ok(Ok(_)) => AppError::InvalidUsername(String::new()),
            Ok(Err(e)) => AppError::HandshakeDecode(e),
            Err(_) => AppError::HandshakeTimeout,
        };

        connection.close().await;
        Err(err)
    }
}
