//! Registry actor implementation
//!
//! The single owner of the username → session map. Every mutation arrives
//! as a `RegistryCommand` on one mpsc channel and is applied in arrival
//! order, so the map needs no lock and every presence broadcast is taken
//! from a consistent view.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::{mpsc, oneshot};
use tokio::time;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::connection::Connection;
use crate::error::AppError;
use crate::message::ServerMessage;
use crate::session::{Session, SessionSettings};
use crate::types::{SessionId, Username};

/// Commands sent to the registry actor
#[derive(Debug)]
pub enum RegistryCommand {
    /// A connection finished its handshake and claims `username`
    Join {
        username: Username,
        connection: Connection,
    },
    /// Route a chat message
    Forward {
        from: Username,
        to: Username,
        content: String,
    },
    /// A session's reader stopped
    Leave {
        username: Username,
        session_id: SessionId,
    },
    /// Remove a user regardless of which session holds the name
    Kick { username: Username },
    /// Snapshot of active usernames
    ListUsers {
        reply: oneshot::Sender<BTreeSet<Username>>,
    },
    /// Close every session and stop the actor
    Shutdown { done: oneshot::Sender<()> },
}

/// Cloneable sending side of the registry channel
#[derive(Debug, Clone)]
pub struct RegistryHandle {
    sender: mpsc::Sender<RegistryCommand>,
}

impl RegistryHandle {
    pub fn new(sender: mpsc::Sender<RegistryCommand>) -> Self {
        Self { sender }
    }

    async fn send(&self, cmd: RegistryCommand) -> Result<(), AppError> {
        self.sender.send(cmd).await.map_err(|_| AppError::RegistryClosed)
    }

    /// Hand a claimed connection over to the registry
    pub async fn join(&self, username: Username, connection: Connection) -> Result<(), AppError> {
        self.send(RegistryCommand::Join {
            username,
            connection,
        })
        .await
    }

    pub async fn forward(
        &self,
        from: Username,
        to: Username,
        content: String,
    ) -> Result<(), AppError> {
        self.send(RegistryCommand::Forward { from, to, content }).await
    }

    pub async fn leave(&self, username: Username, session_id: SessionId) -> Result<(), AppError> {
        self.send(RegistryCommand::Leave {
            username,
            session_id,
        })
        .await
    }

    pub async fn kick(&self, username: Username) -> Result<(), AppError> {
        self.send(RegistryCommand::Kick { username }).await
    }

    /// Currently active usernames
    pub async fn users(&self) -> Result<BTreeSet<Username>, AppError> {
        let (reply, rx) = oneshot::channel();
        self.send(RegistryCommand::ListUsers { reply }).await?;
        rx.await.map_err(|_| AppError::RegistryClosed)
    }

    /// Stop the registry and wait until every session writer has drained
    /// (bounded by the configured grace period).
    pub async fn shutdown(&self) -> Result<(), AppError> {
        let (done, rx) = oneshot::channel();
        self.send(RegistryCommand::Shutdown { done }).await?;
        rx.await.map_err(|_| AppError::RegistryClosed)
    }
}

/// The registry actor
///
/// Holds the active sessions and processes commands one at a time.
/// Never performs socket I/O itself: it only enqueues to mailboxes and
/// spawns tasks.
pub struct Registry {
    /// Active sessions: Username -> Session
    sessions: HashMap<Username, Session>,
    /// Command receiver channel
    receiver: mpsc::Receiver<RegistryCommand>,
    /// Given to each session's reader
    handle: RegistryHandle,
    settings: SessionSettings,
    shutdown_grace: Duration,
}

impl Registry {
    /// Create the actor and a handle for talking to it
    pub fn new(config: &Config) -> (Self, RegistryHandle) {
        let (sender, receiver) = mpsc::channel(config.command_buffer);
        let handle = RegistryHandle::new(sender);
        let registry = Self {
            sessions: HashMap::new(),
            receiver,
            handle: handle.clone(),
            settings: config.session_settings(),
            shutdown_grace: config.shutdown_grace(),
        };
        (registry, handle)
    }

    /// Run the registry event loop until a `Shutdown` command arrives
    pub async fn run(mut self) {
        info!("Registry started");

        while let Some(cmd) = self.receiver.recv().await {
            if !self.handle_command(cmd).await {
                break;
            }
        }

        info!("Registry stopped");
    }

    /// Process a single command
    ///
    /// Returns false once the registry should stop.
    async fn handle_command(&mut self, cmd: RegistryCommand) -> bool {
        match cmd {
            RegistryCommand::Join {
                username,
                connection,
            } => {
                if let Err(e) = self.handle_join(username, connection) {
                    warn!("Join rejected: {}", e);
                }
            }
            RegistryCommand::Forward { from, to, content } => {
                if let Err(e) = self.handle_forward(from, to, content) {
                    debug!("Chat dropped: {}", e);
                }
            }
            RegistryCommand::Leave {
                username,
                session_id,
            } => {
                self.handle_leave(username, Some(session_id));
            }
            RegistryCommand::Kick { username } => {
                info!("Kicking '{}'", username);
                self.handle_leave(username, None);
            }
            RegistryCommand::ListUsers { reply } => {
                let _ = reply.send(self.active_users());
            }
            RegistryCommand::Shutdown { done } => {
                self.handle_shutdown().await;
                let _ = done.send(());
                return false;
            }
        }
        true
    }

    /// Claim a username for a new connection
    fn handle_join(&mut self, username: Username, connection: Connection) -> Result<(), AppError> {
        if self.sessions.contains_key(&username) {
            // Closing writes a frame, keep it off the actor loop
            tokio::spawn(connection.close());
            return Err(AppError::UsernameConflict(username));
        }

        info!("'{}' joined from {}", username, connection.peer());
        let session = Session::spawn(
            username.clone(),
            connection,
            self.handle.clone(),
            self.settings,
        );
        self.sessions.insert(username, session);
        debug!("Active sessions: {}", self.sessions.len());

        self.broadcast();
        Ok(())
    }

    /// Route a direct message, stamping it with the routing time
    fn handle_forward(
        &self,
        from: Username,
        to: Username,
        content: String,
    ) -> Result<(), AppError> {
        let Some(recipient) = self.sessions.get(&to) else {
            return Err(AppError::RecipientNotFound(to));
        };

        if let Err(e) = recipient.deliver(ServerMessage::chat(from.clone(), to.clone(), content)) {
            warn!("Chat from '{}' to '{}' dropped: {}", from, to, e);
        }
        Ok(())
    }

    /// Remove a session and announce the new user set
    ///
    /// With `Some(id)` only the session with that id is removed, so a late
    /// leave from an older session cannot evict a newer holder of the name.
    /// Removing an absent user is a no-op.
    fn handle_leave(&mut self, username: Username, session_id: Option<SessionId>) {
        let matches = match (self.sessions.get(&username), session_id) {
            (Some(session), Some(id)) => session.id == id,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if !matches {
            debug!("Leave for '{}' ignored (not active)", username);
            return;
        }

        if let Some(session) = self.sessions.remove(&username) {
            info!("'{}' left", username);
            drop(session.close());
            debug!("Active sessions: {}", self.sessions.len());
            self.broadcast();
        }
    }

    /// Close all sessions, then wait for their writers to drain
    async fn handle_shutdown(&mut self) {
        info!("Registry shutting down, closing {} sessions", self.sessions.len());

        let writers: Vec<_> = self
            .sessions
            .drain()
            .map(|(_, session)| session.close())
            .collect();

        if time::timeout(self.shutdown_grace, join_all(writers)).await.is_err() {
            warn!("Some session writers did not drain within {:?}", self.shutdown_grace);
        }
    }

    fn active_users(&self) -> BTreeSet<Username> {
        self.sessions.keys().cloned().collect()
    }

    /// Send the current user set to every active session
    fn broadcast(&self) {
        let msg = ServerMessage::broadcast(self.active_users());
        for session in self.sessions.values() {
            if let Err(e) = session.deliver(msg.clone()) {
                warn!("Broadcast to '{}' dropped: {}", session.username, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use serde_json::{json, Value};

    use super::*;
    use crate::connection::testing::{next_json, pair, pair_with_buffer, send_json, ClientSide};

    fn start() -> RegistryHandle {
        let (registry, handle) = Registry::new(&Config::default());
        tokio::spawn(registry.run());
        handle
    }

    async fn join(handle: &RegistryHandle, name: &str) -> ClientSide {
        let (conn, client) = pair(name).await;
        handle.join(Username::from(name), conn).await.unwrap();
        client
    }

    fn users_of(value: &Value) -> BTreeSet<String> {
        assert_eq!(value["type"], "BROADCAST");
        value["users"]
            .as_array()
            .unwrap()
            .iter()
            .map(|u| u.as_str().unwrap().to_string())
            .collect()
    }

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[tokio::test]
    async fn test_join_broadcasts_to_everyone() {
        let handle = start();
        let mut alice = join(&handle, "alice").await;
        assert_eq!(users_of(&next_json(&mut alice).await.unwrap()), set(&["alice"]));

        let mut bob = join(&handle, "bob").await;
        assert_eq!(users_of(&next_json(&mut alice).await.unwrap()), set(&["alice", "bob"]));
        assert_eq!(users_of(&next_json(&mut bob).await.unwrap()), set(&["alice", "bob"]));
    }

    #[tokio::test]
    async fn test_duplicate_join_rejected_without_broadcast() {
        let handle = start();
        let mut alice = join(&handle, "alice").await;
        next_json(&mut alice).await.unwrap();

        let mut impostor = join(&handle, "alice").await;
        assert_eq!(next_json(&mut impostor).await, None);

        // Next frame alice sees comes from bob's join, not the rejected claim
        let _bob = join(&handle, "bob").await;
        assert_eq!(users_of(&next_json(&mut alice).await.unwrap()), set(&["alice", "bob"]));
    }

    #[tokio::test]
    async fn test_usernames_case_sensitive() {
        let handle = start();
        let _lower = join(&handle, "alice").await;
        let _upper = join(&handle, "Alice").await;

        let users = handle.users().await.unwrap();
        assert_eq!(users.len(), 2);
    }

    #[tokio::test]
    async fn test_forward_delivers_chat() {
        let handle = start();
        let mut alice = join(&handle, "alice").await;
        let mut bob = join(&handle, "bob").await;
        next_json(&mut alice).await.unwrap();
        next_json(&mut alice).await.unwrap();
        next_json(&mut bob).await.unwrap();

        let before = chrono::Utc::now();
        send_json(&mut alice, json!({"toUsername": "bob", "content": "hi"})).await;

        let chat = next_json(&mut bob).await.unwrap();
        assert_eq!(chat["type"], "CHAT");
        assert_eq!(chat["fromUsername"], "alice");
        assert_eq!(chat["toUsername"], "bob");
        assert_eq!(chat["content"], "hi");
        let ts = chrono::DateTime::parse_from_rfc3339(chat["timestamp"].as_str().unwrap()).unwrap();
        assert!(ts >= before);
    }

    #[tokio::test]
    async fn test_forward_to_absent_is_silent() {
        let handle = start();
        let mut alice = join(&handle, "alice").await;
        next_json(&mut alice).await.unwrap();

        handle
            .forward("alice".into(), "nobody".into(), "hello?".into())
            .await
            .unwrap();

        // Alice gets nothing back for the dropped chat; the next frame is bob's join
        let _bob = join(&handle, "bob").await;
        assert_eq!(users_of(&next_json(&mut alice).await.unwrap()), set(&["alice", "bob"]));
    }

    #[tokio::test]
    async fn test_disconnect_broadcasts_leave() {
        let handle = start();
        let alice = join(&handle, "alice").await;
        let mut bob = join(&handle, "bob").await;
        next_json(&mut bob).await.unwrap();

        drop(alice);
        assert_eq!(users_of(&next_json(&mut bob).await.unwrap()), set(&["bob"]));
        assert_eq!(handle.users().await.unwrap(), BTreeSet::from([Username::from("bob")]));
    }

    #[tokio::test]
    async fn test_stale_leave_is_noop() {
        let handle = start();
        let mut alice = join(&handle, "alice").await;
        next_json(&mut alice).await.unwrap();

        handle.leave("alice".into(), SessionId::new()).await.unwrap();
        handle.leave("ghost".into(), SessionId::new()).await.unwrap();

        assert_eq!(handle.users().await.unwrap(), BTreeSet::from([Username::from("alice")]));
        let _bob = join(&handle, "bob").await;
        assert_eq!(users_of(&next_json(&mut alice).await.unwrap()), set(&["alice", "bob"]));
    }

    #[tokio::test]
    async fn test_kick_removes_once() {
        let handle = start();
        let mut alice = join(&handle, "alice").await;
        let mut bob = join(&handle, "bob").await;
        next_json(&mut bob).await.unwrap();

        handle.kick("alice".into()).await.unwrap();
        handle.kick("alice".into()).await.unwrap();

        assert_eq!(users_of(&next_json(&mut bob).await.unwrap()), set(&["bob"]));
        // Alice's mailbox is closed: pending broadcasts drain, then the socket closes
        while next_json(&mut alice).await.is_some() {}

        let _carol = join(&handle, "carol").await;
        assert_eq!(users_of(&next_json(&mut bob).await.unwrap()), set(&["bob", "carol"]));
    }

    #[tokio::test]
    async fn test_name_reusable_after_leave() {
        let handle = start();
        let first = join(&handle, "alice").await;
        drop(first);

        // Wait for the leave to land
        let mut tries = 0;
        while !handle.users().await.unwrap().is_empty() {
            tries += 1;
            assert!(tries < 100, "alice never left");
            time::sleep(Duration::from_millis(10)).await;
        }

        let mut second = join(&handle, "alice").await;
        assert_eq!(users_of(&next_json(&mut second).await.unwrap()), set(&["alice"]));
    }

    #[tokio::test]
    async fn test_stalled_recipient_does_not_block_others() {
        let config = Config {
            mailbox_capacity: 1,
            write_timeout_ms: 60_000,
            ..Config::default()
        };
        let (registry, handle) = Registry::new(&config);
        tokio::spawn(registry.run());

        // Never read, and its socket buffer is smaller than one frame
        let (conn, _stalled) = pair_with_buffer("stalled", 64).await;
        handle.join(Username::from("stalled"), conn).await.unwrap();
        let _alice = join(&handle, "alice").await;
        let mut bob = join(&handle, "bob").await;
        let everyone = set(&["alice", "bob", "stalled"]);
        assert_eq!(users_of(&next_json(&mut bob).await.unwrap()), everyone);

        for i in 0..100 {
            let content = format!("flood {i}");
            handle.forward("alice".into(), "stalled".into(), content).await.unwrap();
        }
        handle.forward("alice".into(), "bob".into(), "hi".into()).await.unwrap();
        let chat = next_json(&mut bob).await.unwrap();
        assert_eq!(chat["type"], "CHAT");
        assert_eq!(chat["content"], "hi");

        let _carol = join(&handle, "carol").await;
        let everyone = set(&["alice", "bob", "carol", "stalled"]);
        assert_eq!(users_of(&next_json(&mut bob).await.unwrap()), everyone);
        assert_eq!(handle.users().await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_shutdown_closes_sessions() {
        let handle = start();
        let mut alice = join(&handle, "alice").await;
        next_json(&mut alice).await.unwrap();

        handle.shutdown().await.unwrap();

        assert_eq!(next_json(&mut alice).await, None);
        assert!(matches!(handle.users().await, Err(AppError::RegistryClosed)));
    }
}
