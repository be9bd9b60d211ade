//! Relay server: listener, accept loop and lifecycle
//!
//! Owns the TCP listener, spawns the registry actor and one handshake task
//! per accepted connection. Shutdown runs in order: stop accepting, drop
//! pending handshakes, then let the registry close every session.

use std::future::Future;
use std::net::SocketAddr;

use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::AppError;
use crate::handshake::HandshakeGate;
use crate::registry::Registry;

/// A bound, not yet running relay server
pub struct ChatServer {
    listener: TcpListener,
    config: Config,
}

impl ChatServer {
    /// Validate the config and bind the listener
    pub async fn bind(config: Config) -> Result<Self, AppError> {
        config.validate()?;
        let listener = TcpListener::bind(&config.bind_addr).await?;
        Ok(Self { listener, config })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, AppError> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until `shutdown` resolves
    pub async fn run<F>(self, shutdown: F) -> Result<(), AppError>
    where
        F: Future<Output = ()>,
    {
        let (registry, handle) = Registry::new(&self.config);
        let registry_task = tokio::spawn(registry.run());

        let gate = HandshakeGate::new(
            handle.clone(),
            self.config.ws_path.clone(),
            self.config.handshake_timeout(),
        );
        info!(
            "Chat relay listening on ws://{}{}",
            self.local_addr()?,
            self.config.ws_path
        );

        let mut handshakes = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }

                res = self.listener.accept() => {
                    match res {
                        Ok((stream, addr)) => {
                            debug!("New connection from {}", addr);
                            let gate = gate.clone();
                            handshakes.spawn(async move {
                                if let Err(e) = gate.accept(stream, addr.to_string()).await {
                                    warn!("Handshake with {} failed: {}", addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }

                Some(res) = handshakes.join_next() => {
                    if let Err(e) = res {
                        if e.is_panic() {
                            error!("A handshake task panicked: {e:?}");
                        }
                    }
                }
            }
        }

        drop(self.listener);
        handshakes.shutdown().await;
        debug!("Pending handshakes aborted");

        if handle.shutdown().await.is_err() {
            warn!("Registry already stopped");
        }
        if let Err(e) = registry_task.await {
            error!("Registry task failed: {e:?}");
        }

        info!("Chat relay stopped");
        Ok(())
    }
}
