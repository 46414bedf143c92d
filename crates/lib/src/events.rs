//! Event classification for inbound messages and the built-in handlers for
//! conversation membership events.

use crate::api::{Params, PlatformApi};
use crate::channels::InboundMessage;
use crate::queue::{OutboundMessage, Peer, SharedQueue};
use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;

/// What an inbound message means for the agent that received it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Someone addressed the agent.
    Appeal,
    BotInvited,
    BotKicked,
    /// The agent left the conversation itself.
    BotLeft,
    ChatCreated,
    Gift,
    /// Someone other than the agent was invited.
    UserInvited,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Appeal => "appeal",
            EventKind::BotInvited => "bot-invited",
            EventKind::BotKicked => "bot-kicked",
            EventKind::BotLeft => "bot-left",
            EventKind::ChatCreated => "chat-created",
            EventKind::Gift => "gift",
            EventKind::UserInvited => "user-invited",
        }
    }
}

fn attachment_id(msg: &InboundMessage, key: &str) -> Option<i64> {
    msg.attachments.get(key)?.trim().parse().ok()
}

/// Classify `msg` for agent `agent_id`. Group messages that are not service
/// events only count as an appeal when `pattern` matches the body.
pub fn classify(agent_id: i64, pattern: Option<&Regex>, msg: &InboundMessage) -> Option<EventKind> {
    let act = msg.attachments.get("source_act").map(String::as_str);

    if msg.attachments.get("attach1_type").map(String::as_str) == Some("gift") {
        return Some(EventKind::Gift);
    }
    match act {
        Some("chat_create") => return Some(EventKind::ChatCreated),
        Some("chat_invite_user") => {
            if attachment_id(msg, "source_mid") != Some(agent_id) {
                return Some(EventKind::UserInvited);
            }
            if msg.sender_id != agent_id {
                return Some(EventKind::BotInvited);
            }
        }
        Some("chat_kick_user") => {
            return Some(if msg.sender_id != agent_id {
                EventKind::BotKicked
            } else {
                EventKind::BotLeft
            });
        }
        _ => {}
    }

    if msg.is_multichat {
        return match pattern {
            Some(p) if p.is_match(&msg.body) => Some(EventKind::Appeal),
            _ => None,
        };
    }
    Some(EventKind::Appeal)
}

/// Which messages a reply forwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Forward {
    /// The triggering message in group conversations, nothing in direct ones.
    #[default]
    Auto,
    /// The triggering message.
    This,
    None,
    Ids(Vec<i64>),
}

/// A handler's answer to one inbound message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reply {
    pub message: String,
    pub forward: Forward,
    pub attachment: Option<String>,
}

impl Reply {
    pub fn text(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn with_forward(mut self, forward: Forward) -> Self {
        self.forward = forward;
        self
    }
}

/// Conversation `msg` arrived in.
pub fn peer_of(msg: &InboundMessage) -> Peer {
    if msg.is_multichat {
        Peer::Chat(msg.conversation_id)
    } else {
        Peer::User(msg.conversation_id)
    }
}

/// Turn a reply into a queued send addressed to the conversation of `msg`.
/// `None` when there is nothing to send.
pub fn build_outbound(reply: Reply, msg: &InboundMessage) -> Option<OutboundMessage> {
    let forward_messages = match reply.forward {
        Forward::Ids(ids) if !ids.is_empty() => ids,
        Forward::Ids(_) | Forward::None => Vec::new(),
        Forward::This => vec![msg.message_id],
        Forward::Auto if msg.is_multichat => vec![msg.message_id],
        Forward::Auto => Vec::new(),
    };
    if reply.message.is_empty() && forward_messages.is_empty() && reply.attachment.is_none() {
        return None;
    }
    Some(OutboundMessage {
        peer: peer_of(msg),
        body: reply.message,
        forward_messages,
        attachment: reply.attachment,
        verification_key: None,
    })
}

/// What a handler may touch while handling one event.
#[derive(Clone)]
pub struct AgentContext {
    pub agent_id: i64,
    /// Gated platform client of this agent.
    pub api: Arc<dyn PlatformApi>,
    pub queue: SharedQueue,
    /// Ids of every agent run by this process (this one included).
    pub managed: Arc<BTreeSet<i64>>,
}

impl AgentContext {
    /// Remove this agent from a group conversation.
    pub async fn leave_chat(&self, chat_id: i64) {
        let mut params = Params::new();
        params.insert("chat_id".to_string(), Value::from(chat_id));
        params.insert("user_id".to_string(), Value::from(self.agent_id));
        match self.api.call("messages.removeChatUser", params).await {
            Ok(_) => log::info!("agent id{}: left chat {}", self.agent_id, chat_id),
            Err(e) => log::error!("agent id{}: unable to leave chat {}: {}", self.agent_id, chat_id, e),
        }
    }

    /// Number of managed agents among the chat's members, or `None` if the
    /// member list could not be fetched.
    async fn managed_members(&self, chat_id: i64) -> Option<usize> {
        let mut params = Params::new();
        params.insert("chat_id".to_string(), Value::from(chat_id));
        let members = match self.api.call("messages.getChatUsers", params).await {
            Ok(Value::Array(members)) => members,
            Ok(_) => return Some(0),
            Err(e) => {
                log::error!("agent id{}: unable to list chat {}: {}", self.agent_id, chat_id, e);
                return None;
            }
        };
        Some(
            members
                .iter()
                .filter_map(|m| match m {
                    Value::Number(n) => n.as_i64(),
                    Value::String(s) => s.parse().ok(),
                    _ => None,
                })
                .filter(|id| self.managed.contains(id))
                .count(),
        )
    }
}

/// Produces zero or one reply per classified message. Must not fail; errors
/// are logged by the handler.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, ctx: &AgentContext, kind: EventKind, msg: &InboundMessage) -> Option<Reply>;
}

/// Membership bookkeeping every agent needs. Appeals and gifts go to the
/// injected responder, if any.
#[derive(Clone, Default)]
pub struct BuiltinHandlers {
    greeting: Option<String>,
    responder: Option<Arc<dyn EventHandler>>,
}

impl BuiltinHandlers {
    pub fn new(greeting: Option<String>) -> Self {
        Self {
            greeting: greeting.filter(|g| !g.trim().is_empty()),
            responder: None,
        }
    }

    pub fn with_responder(mut self, responder: Arc<dyn EventHandler>) -> Self {
        self.responder = Some(responder);
        self
    }

    fn greet(&self) -> Option<Reply> {
        self.greeting
            .as_ref()
            .map(|g| Reply::text(g.clone()).with_forward(Forward::None))
    }
}

#[async_trait]
impl EventHandler for BuiltinHandlers {
    async fn handle(&self, ctx: &AgentContext, kind: EventKind, msg: &InboundMessage) -> Option<Reply> {
        match kind {
            EventKind::BotLeft | EventKind::BotKicked => {
                ctx.queue.lock().await.clear_by_id(peer_of(msg));
                None
            }
            EventKind::ChatCreated | EventKind::BotInvited => {
                // Another managed agent already serves this chat.
                if ctx.managed_members(msg.conversation_id).await? > 1 {
                    ctx.leave_chat(msg.conversation_id).await;
                    return None;
                }
                self.greet()
            }
            EventKind::UserInvited => {
                let invited = attachment_id(msg, "source_mid")?;
                if invited != ctx.agent_id && ctx.managed.contains(&invited) {
                    ctx.leave_chat(msg.conversation_id).await;
                }
                None
            }
            EventKind::Appeal | EventKind::Gift => match self.responder {
                Some(ref responder) => responder.handle(ctx, kind, msg).await,
                None => None,
            },
        }
    }
}
