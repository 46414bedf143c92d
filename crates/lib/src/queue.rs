//! Outbound queue: bounded FIFO of replies waiting for the dispatcher, with
//! same-conversation coalescing.
//!
//! A plain text reply for a conversation that already has a plain text entry
//! queued is appended to that entry instead of taking a new slot, so coalescing
//! never counts against the capacity.

use crate::api::Params;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;

/// Default number of distinct entries a queue holds.
pub const DEFAULT_CAPACITY: usize = 50;

const MERGE_SEPARATOR: &str = "\n\n";

/// Target conversation of a send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Peer {
    /// Direct conversation with a user.
    User(i64),
    /// Group conversation (chat id without the peer offset).
    Chat(i64),
}

impl Peer {
    pub fn id(&self) -> i64 {
        match self {
            Peer::User(id) | Peer::Chat(id) => *id,
        }
    }

    fn param_name(&self) -> &'static str {
        match self {
            Peer::User(_) => "user_id",
            Peer::Chat(_) => "chat_id",
        }
    }
}

/// One queued send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub peer: Peer,
    pub body: String,
    pub forward_messages: Vec<i64>,
    pub attachment: Option<String>,
    pub verification_key: Option<String>,
}

impl OutboundMessage {
    /// Plain text message without forwards or attachments.
    pub fn text(peer: Peer, body: impl Into<String>) -> Self {
        Self {
            peer,
            body: body.into(),
            forward_messages: Vec::new(),
            attachment: None,
            verification_key: None,
        }
    }

    /// May be folded into an earlier entry for the same peer.
    fn can_merge(&self) -> bool {
        self.attachment.is_none() && self.verification_key.is_none()
    }

    /// Parameters for `messages.send`.
    pub fn to_params(&self) -> Params {
        let mut params = Params::new();
        params.insert("message".to_string(), Value::String(self.body.clone()));
        params.insert(
            self.peer.param_name().to_string(),
            Value::from(self.peer.id()),
        );
        if !self.forward_messages.is_empty() {
            let ids = self
                .forward_messages
                .iter()
                .map(|id| id.to_string())
                .collect::<Vec<_>>()
                .join(",");
            params.insert("forward_messages".to_string(), Value::String(ids));
        }
        if let Some(ref attachment) = self.attachment {
            params.insert("attachment".to_string(), Value::String(attachment.clone()));
        }
        if let Some(ref key) = self.verification_key {
            params.insert("captcha_key".to_string(), Value::String(key.clone()));
        }
        params
    }
}

/// How an accepted message was stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Merged,
    Appended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("outbound queue is full ({capacity} entries)")]
pub struct QueueFull {
    pub capacity: usize,
}

#[derive(Debug)]
struct Entry {
    message: OutboundMessage,
    cleared: bool,
}

impl Entry {
    fn merge_target_for(&self, peer: Peer) -> bool {
        !self.cleared && self.message.peer == peer && self.message.attachment.is_none()
    }
}

/// Queue shared by an agent's classification consumer and its dispatcher.
pub type SharedQueue = Arc<tokio::sync::Mutex<OutboundQueue>>;

#[derive(Debug)]
pub struct OutboundQueue {
    entries: VecDeque<Entry>,
    capacity: usize,
}

impl Default for OutboundQueue {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity,
        }
    }

    pub fn shared(capacity: usize) -> SharedQueue {
        Arc::new(tokio::sync::Mutex::new(Self::new(capacity)))
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Entries currently queued, cleared ones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    /// True if a plain text message for `peer` would currently be accepted.
    pub fn accepts(&self, peer: Peer) -> bool {
        !self.is_full() || self.entries.iter().any(|e| e.merge_target_for(peer))
    }

    /// Queue `msg`, folding it into an earlier entry for the same peer when both
    /// are plain text. Only new entries are subject to the capacity limit.
    pub fn enqueue(&mut self, msg: OutboundMessage) -> Result<Enqueued, QueueFull> {
        if msg.can_merge() {
            if let Some(entry) = self
                .entries
                .iter_mut()
                .find(|e| e.merge_target_for(msg.peer))
            {
                let target = &mut entry.message;
                target.body.push_str(MERGE_SEPARATOR);
                target.body.push_str(&msg.body);
                target.forward_messages.extend(msg.forward_messages);
                return Ok(Enqueued::Merged);
            }
        }
        if self.is_full() {
            return Err(QueueFull {
                capacity: self.capacity,
            });
        }
        self.entries.push_back(Entry {
            message: msg,
            cleared: false,
        });
        Ok(Enqueued::Appended)
    }

    /// Pop the oldest entry. `None` when the queue is empty or the entry was cleared.
    pub fn dequeue(&mut self) -> Option<OutboundMessage> {
        let entry = self.entries.pop_front()?;
        if entry.cleared {
            None
        } else {
            Some(entry.message)
        }
    }

    /// Mark every queued entry for `peer` as cleared; they dequeue as `None`.
    pub fn clear_by_id(&mut self, peer: Peer) {
        for entry in self.entries.iter_mut().filter(|e| e.message.peer == peer) {
            entry.cleared = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_attachment(peer: Peer, body: &str) -> OutboundMessage {
        OutboundMessage {
            attachment: Some("photo1_2".into()),
            ..OutboundMessage::text(peer, body)
        }
    }

    #[test]
    fn same_conversation_converges_to_one_entry() {
        let mut q = OutboundQueue::new(10);
        let peer = Peer::Chat(4);
        for body in ["one", "two", "three"] {
            let mut msg = OutboundMessage::text(peer, body);
            msg.forward_messages = vec![body.len() as i64];
            q.enqueue(msg).unwrap();
        }
        assert_eq!(q.len(), 1);
        let merged = q.dequeue().unwrap();
        assert_eq!(merged.body, "one\n\ntwo\n\nthree");
        assert_eq!(merged.forward_messages, vec![3, 3, 5]);
        assert_eq!(merged.to_params()["forward_messages"], "3,3,5");
    }

    #[test]
    fn merged_entry_keeps_its_position() {
        let mut q = OutboundQueue::new(10);
        q.enqueue(OutboundMessage::text(Peer::User(1), "a")).unwrap();
        q.enqueue(OutboundMessage::text(Peer::User(2), "b")).unwrap();
        assert_eq!(
            q.enqueue(OutboundMessage::text(Peer::User(1), "c")),
            Ok(Enqueued::Merged)
        );
        assert_eq!(q.dequeue().unwrap().body, "a\n\nc");
        assert_eq!(q.dequeue().unwrap().body, "b");
        assert!(q.dequeue().is_none());
    }

    #[test]
    fn user_and_chat_with_same_id_do_not_merge() {
        let mut q = OutboundQueue::new(10);
        q.enqueue(OutboundMessage::text(Peer::User(5), "dm")).unwrap();
        q.enqueue(OutboundMessage::text(Peer::Chat(5), "chat")).unwrap();
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn full_queue_rejects_new_targets_but_merges() {
        let mut q = OutboundQueue::new(2);
        q.enqueue(OutboundMessage::text(Peer::User(1), "a")).unwrap();
        q.enqueue(OutboundMessage::text(Peer::User(2), "b")).unwrap();
        assert!(q.is_full());

        let err = q.enqueue(OutboundMessage::text(Peer::User(3), "c")).unwrap_err();
        assert_eq!(err, QueueFull { capacity: 2 });
        assert_eq!(q.len(), 2);
        assert!(!q.accepts(Peer::User(3)));

        assert!(q.accepts(Peer::User(2)));
        assert_eq!(
            q.enqueue(OutboundMessage::text(Peer::User(2), "b2")),
            Ok(Enqueued::Merged)
        );
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn attachments_and_verification_keys_never_merge() {
        let mut q = OutboundQueue::new(10);
        let peer = Peer::User(9);
        q.enqueue(with_attachment(peer, "pic")).unwrap();
        // plain text cannot merge into an attachment entry
        assert_eq!(
            q.enqueue(OutboundMessage::text(peer, "text")),
            Ok(Enqueued::Appended)
        );
        // an attachment message never merges into a text entry
        assert_eq!(q.enqueue(with_attachment(peer, "pic2")), Ok(Enqueued::Appended));
        let keyed = OutboundMessage {
            verification_key: Some("k".into()),
            ..OutboundMessage::text(peer, "keyed")
        };
        assert_eq!(q.enqueue(keyed), Ok(Enqueued::Appended));
        assert_eq!(q.len(), 4);
    }

    #[test]
    fn clear_by_id_tombstones_only_that_conversation() {
        let mut q = OutboundQueue::new(10);
        q.enqueue(OutboundMessage::text(Peer::Chat(1), "x")).unwrap();
        q.enqueue(OutboundMessage::text(Peer::User(2), "y")).unwrap();
        q.enqueue(with_attachment(Peer::Chat(1), "z")).unwrap();
        q.clear_by_id(Peer::Chat(1));

        // cleared entries still occupy their slots until dequeued
        assert_eq!(q.len(), 3);
        assert!(q.dequeue().is_none());
        assert_eq!(q.dequeue().unwrap().body, "y");
        assert!(q.dequeue().is_none());
        assert!(q.is_empty());
    }

    #[test]
    fn cleared_entries_are_not_merge_targets() {
        let mut q = OutboundQueue::new(10);
        q.enqueue(OutboundMessage::text(Peer::Chat(1), "old")).unwrap();
        q.clear_by_id(Peer::Chat(1));
        assert_eq!(
            q.enqueue(OutboundMessage::text(Peer::Chat(1), "new")),
            Ok(Enqueued::Appended)
        );
        assert!(q.dequeue().is_none());
        assert_eq!(q.dequeue().unwrap().body, "new");
    }

    #[test]
    fn params_address_user_or_chat() {
        let dm = OutboundMessage::text(Peer::User(7), "hi").to_params();
        assert_eq!(dm["user_id"], 7);
        assert!(dm.get("chat_id").is_none());
        assert!(dm.get("forward_messages").is_none());
        let chat = with_attachment(Peer::Chat(3), "pic").to_params();
        assert_eq!(chat["chat_id"], 3);
        assert_eq!(chat["attachment"], "photo1_2");
    }
}
