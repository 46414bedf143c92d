//! Gateway: hosts the agents and the admin HTTP API operators use to list and
//! solve verification challenges.

mod auth;
mod protocol;
mod server;

pub use auth::{operator_hash, verify_operator};
pub use protocol::{AgentStatus, ApiReply, ImageQuery, SendQuery};
pub use server::{open_shared_store, open_store, router, run_gateway, start_agents, GatewayState};
