//! Parley core library: platform client, call gate, verification coordinator,
//! long-poll ingestion, outbound queue and the admin gateway used by the CLI.

pub mod agent;
pub mod api;
pub mod channels;
pub mod config;
pub mod dispatch;
pub mod events;
pub mod gateway;
pub mod init;
pub mod queue;
pub mod verify;
