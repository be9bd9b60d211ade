//! Session: one claimed username bound to one live connection
//!
//! Each session runs two tasks. The reader turns inbound forward requests
//! into registry commands; the writer drains the session's bounded mailbox
//! onto the socket. Only the registry ever holds the mailbox sender, so only
//! the registry can close it.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connection::{Connection, ConnectionReader, ConnectionWriter};
use crate::error::{ConnectionError, DeliveryError};
use crate::message::{ForwardMessageRequest, ServerMessage};
use crate::registry::RegistryHandle;
use crate::types::{SessionId, Username};

/// Per-session tuning taken from the server config
#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    /// Bounded mailbox size
    pub mailbox_capacity: usize,
    /// Deadline for writing a single message to the socket
    pub write_timeout: Duration,
}

/// Writer-local lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Writing mailbox entries to the connection
    Active,
    /// A write failed; entries are dequeued and discarded until the mailbox closes
    Draining,
    /// Mailbox closed and drained, connection closed
    Closed,
}

/// Sending side of a session's outbound queue
///
/// Enqueueing never waits: a full mailbox means the writer is stalled and
/// the message is dropped for this recipient only.
#[derive(Debug)]
pub struct Mailbox {
    sender: mpsc::Sender<ServerMessage>,
}

impl Mailbox {
    /// Create a mailbox and the receiver its writer drains
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ServerMessage>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self { sender }, receiver)
    }

    pub fn deliver(&self, msg: ServerMessage) -> Result<(), DeliveryError> {
        self.sender.try_send(msg).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryError::MailboxFull,
            TrySendError::Closed(_) => DeliveryError::MailboxClosed,
        })
    }
}

/// Live session as held by the registry
#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub username: Username,
    mailbox: Mailbox,
    writer: JoinHandle<SessionState>,
}

impl Session {
    /// Split the connection and start the reader and writer tasks
    pub fn spawn(
        username: Username,
        connection: Connection,
        registry: RegistryHandle,
        settings: SessionSettings,
    ) -> Self {
        let id = SessionId::new();
        let (mailbox, outbox) = Mailbox::new(settings.mailbox_capacity);
        let (reader, writer) = connection.split(settings.write_timeout);

        tokio::spawn(run_reader(id, username.clone(), reader, registry));
        let writer = tokio::spawn(run_writer(username.clone(), writer, outbox));

        Self {
            id,
            username,
            mailbox,
            writer,
        }
    }

    /// Enqueue a message for this session's writer
    pub fn deliver(&self, msg: ServerMessage) -> Result<(), DeliveryError> {
        self.mailbox.deliver(msg)
    }

    /// Close the mailbox
    ///
    /// Consumes the session, so the mailbox is closed exactly once. The
    /// writer finishes the queued entries and then exits; its handle is
    /// returned for callers that want to wait for that.
    pub fn close(self) -> JoinHandle<SessionState> {
        drop(self.mailbox);
        self.writer
    }
}

/// Reader loop
///
/// Emits exactly one leave when it stops, whatever the cause.
pub(crate) async fn run_reader(
    id: SessionId,
    username: Username,
    mut conn: ConnectionReader,
    registry: RegistryHandle,
) {
    loop {
        match conn.recv::<ForwardMessageRequest>().await {
            Ok(request) => {
                debug!(
                    "'{}' -> '{}': {} bytes",
                    username,
                    request.to_username,
                    request.content.len()
                );
                if registry
                    .forward(username.clone(), request.to_username, request.content)
                    .await
                    .is_err()
                {
                    debug!("Registry closed, ending read task for '{}'", username);
                    break;
                }
            }
            Err(ConnectionError::Closed) => {
                debug!("Connection of '{}' closed", username);
                break;
            }
            Err(e) => {
                warn!("Read from '{}' ({}) failed: {}", username, conn.peer(), e);
                break;
            }
        }
    }

    if registry.leave(username.clone(), id).await.is_err() {
        debug!("Registry closed before leave of '{}'", username);
    }
    debug!("Read task ended for '{}'", username);
}

/// Writer loop
///
/// Delivers mailbox entries in FIFO order. After the first failed write the
/// connection is closed and remaining entries are discarded, so registry
/// enqueues keep succeeding until the registry closes the mailbox.
pub(crate) async fn run_writer(
    username: Username,
    mut conn: ConnectionWriter,
    mut outbox: mpsc::Receiver<ServerMessage>,
) -> SessionState {
    let mut state = SessionState::Active;

    while let Some(msg) = outbox.recv().await {
        if state == SessionState::Draining {
            continue;
        }
        if let Err(e) = conn.send(&msg).await {
            warn!("Write to '{}' ({}) failed: {}", username, conn.peer(), e);
            state = SessionState::Draining;
            conn.close().await;
        }
    }

    conn.close().await;
    info!("Session '{}' closed", username);
    SessionState::Closed
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio::time;

    use super::*;
    use crate::connection::testing::{next_json, pair, send_json};
    use crate::registry::RegistryCommand;

    fn broadcast_of(names: &[&str]) -> ServerMessage {
        ServerMessage::broadcast(names.iter().map(|n| Username::from(*n)).collect())
    }

    #[test]
    fn test_mailbox_full_drops() {
        let (mailbox, _outbox) = Mailbox::new(1);

        assert!(mailbox.deliver(broadcast_of(&["a"])).is_ok());
        assert_eq!(mailbox.deliver(broadcast_of(&["b"])), Err(DeliveryError::MailboxFull));
    }

    #[test]
    fn test_mailbox_closed_when_writer_gone() {
        let (mailbox, outbox) = Mailbox::new(4);
        drop(outbox);

        assert_eq!(mailbox.deliver(broadcast_of(&["a"])), Err(DeliveryError::MailboxClosed));
    }

    #[tokio::test]
    async fn test_writer_fifo() {
        let (conn, mut client) = pair("test").await;
        let (_reader, writer) = conn.split(Duration::from_secs(1));
        let (mailbox, outbox) = Mailbox::new(16);
        let task = tokio::spawn(run_writer(Username::from("bob"), writer, outbox));

        for i in 0..5 {
            let msg = ServerMessage::chat("alice".into(), "bob".into(), format!("m{i}"));
            mailbox.deliver(msg).unwrap();
        }
        drop(mailbox);

        for i in 0..5 {
            let value = next_json(&mut client).await.unwrap();
            assert_eq!(value["content"], format!("m{i}"));
        }
        assert_eq!(next_json(&mut client).await, None);
        assert_eq!(task.await.unwrap(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_writer_drains_after_write_error() {
        let (conn, client) = pair("test").await;
        drop(client);
        let (_reader, writer) = conn.split(Duration::from_millis(200));
        let (mailbox, outbox) = Mailbox::new(64);
        let task = tokio::spawn(run_writer(Username::from("bob"), writer, outbox));

        for _ in 0..32 {
            mailbox.deliver(broadcast_of(&["bob"])).unwrap();
        }
        drop(mailbox);

        let state = time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert_eq!(state, SessionState::Closed);
    }

    #[tokio::test]
    async fn test_reader_forwards_then_leaves_once() {
        let (conn, mut client) = pair("test").await;
        let (reader, _writer) = conn.split(Duration::from_secs(1));
        let (tx, mut rx) = mpsc::channel(8);
        let id = SessionId::new();
        let handle = RegistryHandle::new(tx);
        let task = tokio::spawn(run_reader(id, Username::from("alice"), reader, handle));

        send_json(&mut client, json!({"toUsername": "bob", "content": "hi"})).await;
        send_json(&mut client, json!({"bogus": true})).await;
        send_json(&mut client, json!({"toUsername": "bob", "content": "never"})).await;

        match rx.recv().await.unwrap() {
            RegistryCommand::Forward { from, to, content } => {
                assert_eq!(from, Username::from("alice"));
                assert_eq!(to, Username::from("bob"));
                assert_eq!(content, "hi");
            }
            other => panic!("unexpected command: {other:?}"),
        }
        match rx.recv().await.unwrap() {
            RegistryCommand::Leave { username, session_id } => {
                assert_eq!(username, Username::from("alice"));
                assert_eq!(session_id, id);
            }
            other => panic!("unexpected command: {other:?}"),
        }

        task.await.unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_reader_leaves_when_writer_closes() {
        let (conn, _client) = pair("test").await;
        let (reader, mut writer) = conn.split(Duration::from_secs(1));
        let (tx, mut rx) = mpsc::channel(8);
        let handle = RegistryHandle::new(tx);
        tokio::spawn(run_reader(SessionId::new(), Username::from("alice"), reader, handle));

        writer.close().await;

        let cmd = time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
        assert!(matches!(cmd, Some(RegistryCommand::Leave { .. })));
    }
}
