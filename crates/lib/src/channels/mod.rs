//! Inbound side of an agent: the long-poll connector and the normalized
//! message it emits to the agent's classification consumer.

mod inbound;
mod longpoll;

pub use inbound::{decode_entities, decode_update, Attachments, InboundMessage, CHAT_PEER_OFFSET};
pub use longpoll::{LongPollChannel, LongPollSession, DEFAULT_RETRY_DELAY, DEFAULT_WAIT};
