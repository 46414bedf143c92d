//! Admin API wire types: the `{ok, response}` / `{ok: false, cause}` envelope
//! and the query parameters of each route.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const MISSED_PARAM: &str = "Missed param.";
pub const INVALID_PARAM: &str = "Invalid param.";
pub const ACCESS_DENIED: &str = "Access denied.";
pub const INTERNAL_ERROR: &str = "Internal error.";

/// Response envelope of every `/api/*` route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiReply {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

impl ApiReply {
    pub fn ok(response: Value) -> Self {
        Self {
            ok: true,
            response: Some(response),
            cause: None,
        }
    }

    /// Success without a payload: `{ "ok": true }`.
    pub fn done() -> Self {
        Self {
            ok: true,
            response: None,
            cause: None,
        }
    }

    pub fn err(cause: impl Into<String>) -> Self {
        Self {
            ok: false,
            response: None,
            cause: Some(cause.into()),
        }
    }
}

/// `GET /api/verify.image?sid=`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImageQuery {
    pub sid: Option<String>,
}

/// `GET /api/verify.send?auth_key&bot_id&sid&key&user_id`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SendQuery {
    pub auth_key: Option<String>,
    pub bot_id: Option<String>,
    pub sid: Option<String>,
    pub key: Option<String>,
    pub user_id: Option<String>,
}

/// Per-agent entry of the `GET /` status document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatus {
    pub id: i64,
    pub queue_len: usize,
    pub frozen_methods: Vec<String>,
    pub cursor: Option<String>,
}
