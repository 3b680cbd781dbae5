//! Conversation Registry
//!
//! Maps a conversation id to its log and the set of attached viewer
//! connections. Entries are created lazily on first reference and
//! live for the process lifetime.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::fold::ConversationLog;
use crate::protocol::{InitFrame, InitTag, ServerFrame};

/// Outbound frame capacity per connection. A connection that falls
/// this far behind is detached rather than allowed to stall siblings.
const CONNECTION_CHANNEL_CAPACITY: usize = 256;

pub fn connection_channel() -> (mpsc::Sender<ServerFrame>, mpsc::Receiver<ServerFrame>) {
    mpsc::channel(CONNECTION_CHANNEL_CAPACITY)
}

/// One conversation's shared state. The log and connection set sit
/// behind separate locks so viewers can attach and detach while a
/// submission is streaming; `submit_lock` serializes submissions for
/// this conversation in arrival order.
pub struct Conversation {
    pub id: String,
    pub log: RwLock<ConversationLog>,
    connections: RwLock<HashMap<String, mpsc::Sender<ServerFrame>>>,
    pub submit_lock: Mutex<()>,
    current_abort: Mutex<Option<CancellationToken>>,
}

impl Conversation {
    pub fn new(id: impl Into<String>) -> Self {
        Conversation {
            id: id.into(),
            log: RwLock::new(ConversationLog::new()),
            connections: RwLock::new(HashMap::new()),
            submit_lock: Mutex::new(()),
            current_abort: Mutex::new(None),
        }
    }

    /// Register a connection. If the log already has history, the new
    /// viewer immediately receives an init-messages snapshot.
    pub async fn attach(&self, connection_id: &str, tx: mpsc::Sender<ServerFrame>) {
        let snapshot = {
            let log = self.log.read().await;
            if log.is_empty() { None } else { Some(log.snapshot()) }
        };
        if let Some(messages) = snapshot {
            if tx
                .try_send(ServerFrame::Init(InitFrame {
                    trigger: InitTag::InitMessages,
                    messages,
                }))
                .is_err()
            {
                warn!(conversation = %self.id, conn = %connection_id, "Failed to send init snapshot");
            }
        }
        let mut connections = self.connections.write().await;
        connections.insert(connection_id.to_string(), tx);
        debug!(
            conversation = %self.id,
            conn = %connection_id,
            clients = connections.len(),
            "Connection attached"
        );
    }

    /// Remove a connection. Idempotent: detaching an unknown or
    /// already-removed connection is a no-op.
    pub async fn detach(&self, connection_id: &str) {
        let mut connections = self.connections.write().await;
        if connections.remove(connection_id).is_some() {
            debug!(
                conversation = %self.id,
                conn = %connection_id,
                clients = connections.len(),
                "Connection detached"
            );
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Fire-and-forget delivery to every attached connection. A full
    /// or closed channel detaches that connection only; siblings are
    /// never blocked.
    pub async fn broadcast(&self, frame: &ServerFrame) {
        self.broadcast_filtered(frame, None).await;
    }

    /// Same as [`broadcast`](Self::broadcast), skipping one connection
    /// (the submission trigger, which gets fragments through its own
    /// stream).
    pub async fn broadcast_except(&self, frame: &ServerFrame, except: &str) {
        self.broadcast_filtered(frame, Some(except)).await;
    }

    async fn broadcast_filtered(&self, frame: &ServerFrame, except: Option<&str>) {
        let mut dead = Vec::new();
        {
            let connections = self.connections.read().await;
            for (connection_id, tx) in connections.iter() {
                if Some(connection_id.as_str()) == except {
                    continue;
                }
                if tx.try_send(frame.clone()).is_err() {
                    dead.push(connection_id.clone());
                }
            }
        }
        for connection_id in dead {
            warn!(
                conversation = %self.id,
                conn = %connection_id,
                "Dropping unresponsive connection"
            );
            self.detach(&connection_id).await;
        }
    }

    /// Install the cancellation token for a new in-flight submission.
    pub async fn begin_submission(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.current_abort.lock().await = Some(token.clone());
        token
    }

    pub async fn end_submission(&self) {
        *self.current_abort.lock().await = None;
    }

    /// Cancel the in-flight submission, if any.
    pub async fn abort_current(&self) -> bool {
        match self.current_abort.lock().await.take() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

/// Process-wide conversation registry.
#[derive(Default)]
pub struct ConversationRegistry {
    conversations: RwLock<HashMap<String, Arc<Conversation>>>,
}

impl ConversationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a conversation, creating it on first reference.
    pub async fn get_or_create(&self, id: &str) -> Arc<Conversation> {
        {
            let conversations = self.conversations.read().await;
            if let Some(conversation) = conversations.get(id) {
                return conversation.clone();
            }
        }
        let mut conversations = self.conversations.write().await;
        conversations
            .entry(id.to_string())
            .or_insert_with(|| {
                debug!(conversation = %id, "Conversation created");
                Arc::new(Conversation::new(id.to_string()))
            })
            .clone()
    }

    /// Snapshot read path; `None` when the id has never been seen.
    pub async fn snapshot(&self, id: &str) -> Option<Vec<crate::protocol::Message>> {
        let conversations = self.conversations.read().await;
        match conversations.get(id) {
            Some(conversation) => Some(conversation.log.read().await.snapshot()),
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Fragment, Message};

    #[tokio::test]
    async fn get_or_create_returns_same_entry() {
        let registry = ConversationRegistry::new();
        let a = registry.get_or_create("conv-1").await;
        let b = registry.get_or_create("conv-1").await;
        assert!(Arc::ptr_eq(&a, &b));
        let c = registry.get_or_create("conv-2").await;
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[tokio::test]
    async fn attach_to_empty_log_sends_nothing() {
        let registry = ConversationRegistry::new();
        let conversation = registry.get_or_create("conv-1").await;
        let (tx, mut rx) = connection_channel();
        conversation.attach("conn-a", tx).await;
        assert_eq!(conversation.connection_count().await, 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn attach_delivers_history_snapshot() {
        let registry = ConversationRegistry::new();
        let conversation = registry.get_or_create("conv-1").await;
        conversation
            .log
            .write()
            .await
            .replace(vec![Message::user("u1", "salut")]);

        let (tx, mut rx) = connection_channel();
        conversation.attach("conn-a", tx).await;
        match rx.recv().await.unwrap() {
            ServerFrame::Init(init) => {
                assert_eq!(init.messages.len(), 1);
                assert_eq!(init.messages[0].id, "u1");
            }
            other => panic!("Expected init frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn detach_is_idempotent() {
        let registry = ConversationRegistry::new();
        let conversation = registry.get_or_create("conv-1").await;
        let (tx, _rx) = connection_channel();
        conversation.attach("conn-a", tx).await;
        conversation.detach("conn-a").await;
        conversation.detach("conn-a").await;
        conversation.detach("never-attached").await;
        assert_eq!(conversation.connection_count().await, 0);
    }

    #[tokio::test]
    async fn broadcast_skips_trigger_and_drops_dead() {
        let registry = ConversationRegistry::new();
        let conversation = registry.get_or_create("conv-1").await;
        let (tx_a, mut rx_a) = connection_channel();
        let (tx_b, mut rx_b) = connection_channel();
        let (tx_dead, rx_dead) = connection_channel();
        conversation.attach("conn-a", tx_a).await;
        conversation.attach("conn-b", tx_b).await;
        conversation.attach("conn-dead", tx_dead).await;
        drop(rx_dead);

        conversation
            .broadcast_except(&ServerFrame::Fragment(Fragment::Finish), "conn-a")
            .await;
        assert!(rx_a.try_recv().is_err());
        assert!(matches!(
            rx_b.try_recv().unwrap(),
            ServerFrame::Fragment(Fragment::Finish)
        ));
        // The dead connection was detached, not retried.
        assert_eq!(conversation.connection_count().await, 2);
    }

    #[tokio::test]
    async fn abort_current_cancels_once() {
        let registry = ConversationRegistry::new();
        let conversation = registry.get_or_create("conv-1").await;
        assert!(!conversation.abort_current().await);
        let token = conversation.begin_submission().await;
        assert!(!token.is_cancelled());
        assert!(conversation.abort_current().await);
        assert!(token.is_cancelled());
        // Token was taken; a second abort is a no-op.
        assert!(!conversation.abort_current().await);
    }

    #[tokio::test]
    async fn snapshot_read_path() {
        let registry = ConversationRegistry::new();
        assert!(registry.snapshot("missing").await.is_none());
        let conversation = registry.get_or_create("conv-1").await;
        conversation
            .log
            .write()
            .await
            .replace(vec![Message::user("u1", "salut")]);
        let snapshot = registry.snapshot("conv-1").await.unwrap();
        assert_eq!(snapshot.len(), 1);
    }
}
