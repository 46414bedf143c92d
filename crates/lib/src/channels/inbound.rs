//! Inbound message: one long-poll update normalized for classification.

use serde_json::Value;
use std::collections::BTreeMap;

/// Update type of a new message event.
pub const UPDATE_NEW_MESSAGE: i64 = 4;
/// Message flag: not yet read.
pub const FLAG_UNREAD: i64 = 1;
/// Message flag: sent by us.
pub const FLAG_OUTBOX: i64 = 2;
/// Message flag: sender is a friend (group-chat members count as well).
pub const FLAG_FRIENDS: i64 = 32;
/// Peer ids of group conversations are offset by this value.
pub const CHAT_PEER_OFFSET: i64 = 2_000_000_000;

const HTML_ENTITIES: [(&str, &str); 5] = [
    ("&lt;", "<"),
    ("&gt;", ">"),
    ("&amp;", "&"),
    ("&quot;", "\""),
    ("<br>", ". "),
];

/// Extra fields of an update (`from`, `source_act`, `attach1_type`, ...), values stringified.
pub type Attachments = BTreeMap<String, String>;

/// A message from the long-poll stream, addressed to one agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub message_id: i64,
    pub conversation_id: i64,
    pub sender_id: i64,
    pub body: String,
    pub attachments: Attachments,
    pub is_multichat: bool,
}

/// Decode the platform's HTML entities in a message body.
pub fn decode_entities(body: &str) -> String {
    let mut out = body.to_string();
    for (what, with) in HTML_ENTITIES {
        if out.contains(what) {
            out = out.replace(what, with);
        }
    }
    out
}

fn as_i64(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn attachments_of(update: &[Value]) -> Attachments {
    match update.get(7) {
        Some(Value::Object(map)) => map
            .iter()
            .map(|(k, v)| {
                let v = match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (k.clone(), v)
            })
            .collect(),
        _ => Attachments::new(),
    }
}

/// Turn one raw update tuple into an [`InboundMessage`] for `agent_id`, or `None`
/// if it is not an unread incoming message from someone else.
///
/// Tuple layout: `[type, message_id, flags, peer_id, timestamp, subject, text, extra]`.
pub fn decode_update(agent_id: i64, update: &Value) -> Option<InboundMessage> {
    let update = update.as_array()?;
    if update.first().and_then(as_i64)? != UPDATE_NEW_MESSAGE {
        return None;
    }
    let flags = update.get(2).and_then(as_i64)?;
    let peer_id = update.get(3).and_then(as_i64)?;
    let attachments = attachments_of(update);
    let group_sender = attachments
        .get("from")
        .and_then(|s| s.trim().parse::<i64>().ok())
        .filter(|id| *id != 0);

    if flags & FLAG_UNREAD == 0 || flags & FLAG_OUTBOX != 0 {
        return None;
    }
    if flags & FLAG_FRIENDS == 0 && group_sender.is_none() {
        return None;
    }
    let (conversation_id, sender_id) = match group_sender {
        Some(sender) => (peer_id - CHAT_PEER_OFFSET, sender),
        None => (peer_id, peer_id),
    };
    if sender_id == agent_id {
        return None;
    }

    let body = update.get(6).and_then(|v| v.as_str()).unwrap_or("");
    Some(InboundMessage {
        message_id: update.get(1).and_then(as_i64).unwrap_or(0),
        conversation_id,
        sender_id,
        body: decode_entities(body),
        is_multichat: group_sender.is_some(),
        attachments,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const AGENT: i64 = 100;

    #[test]
    fn direct_message_from_friend() {
        let update = json!([4, 10, 0b100001, 555, 1_500_000_000, " ... ", "&lt;hi&gt;", {}]);
        let msg = decode_update(AGENT, &update).expect("emitted");
        assert_eq!(msg.conversation_id, 555);
        assert_eq!(msg.sender_id, 555);
        assert_eq!(msg.body, "<hi>");
        assert!(!msg.is_multichat);
        assert_eq!(msg.message_id, 10);
        assert!(msg.attachments.is_empty());
    }

    #[test]
    fn group_message_uses_sender_field_and_offset() {
        let raw_peer = CHAT_PEER_OFFSET + 42;
        let update = json!([4, 11, 1, raw_peer, 0, "", "бот, привет", { "from": "321" }]);
        let msg = decode_update(AGENT, &update).expect("emitted");
        assert_eq!(msg.sender_id, 321);
        assert_eq!(msg.conversation_id, raw_peer - 2_000_000_000);
        assert!(msg.is_multichat);
        assert_eq!(msg.attachments.get("from").map(String::as_str), Some("321"));
    }

    #[test]
    fn filters_non_messages_read_outgoing_and_strangers() {
        // not a new-message event
        assert!(decode_update(AGENT, &json!([5, 1, 33, 555, 0, "", "x"])).is_none());
        // already read
        assert!(decode_update(AGENT, &json!([4, 1, 32, 555, 0, "", "x"])).is_none());
        // outgoing
        assert!(decode_update(AGENT, &json!([4, 1, 35, 555, 0, "", "x"])).is_none());
        // direct message from a non-friend
        assert!(decode_update(AGENT, &json!([4, 1, 1, 555, 0, "", "x"])).is_none());
        // malformed
        assert!(decode_update(AGENT, &json!({"type": 4})).is_none());
    }

    #[test]
    fn drops_messages_from_the_agent_itself() {
        assert!(decode_update(AGENT, &json!([4, 1, 33, AGENT, 0, "", "x"])).is_none());
        let chat = CHAT_PEER_OFFSET + 1;
        let own = json!([4, 1, 1, chat, 0, "", "x", { "from": AGENT.to_string() }]);
        assert!(decode_update(AGENT, &own).is_none());
    }

    #[test]
    fn entities_decode_in_order() {
        assert_eq!(decode_entities("a &amp; b"), "a & b");
        assert_eq!(decode_entities("&quot;q&quot;<br>next"), "\"q\". next");
        assert_eq!(decode_entities("plain"), "plain");
    }

    #[test]
    fn non_string_attachment_values_are_stringified() {
        let update = json!([4, 1, 1, CHAT_PEER_OFFSET + 3, 0, "", "", { "from": 12, "source_mid": 99 }]);
        let msg = decode_update(AGENT, &update).expect("emitted");
        assert_eq!(msg.sender_id, 12);
        assert_eq!(msg.attachments["source_mid"], "99");
    }
}
