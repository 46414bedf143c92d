//! Remote platform API: the `call(method, params)` primitive, its error type, and
//! the per-agent call gate that every agent-side call goes through.

mod gate;
mod vk;

pub use gate::CallGate;
pub use vk::{authenticate, AuthError, Credentials, Identity, VkApiClient};

use async_trait::async_trait;
use serde_json::{Map, Value};

/// Parameters of one remote call (`name -> value`).
pub type Params = Map<String, Value>;

/// The platform demands human verification before the call may proceed.
pub const VERIFICATION_REQUIRED: i64 = 14;
/// Too many identical requests in a short time.
pub const FLOOD_CONTROL: i64 = 9;
/// Transient platform-side failure.
pub const INTERNAL_ERROR: i64 = 10;
/// Access denied (e.g. the agent was removed from the conversation).
pub const ACCESS_DENIED: i64 = 7;
/// Recipient's privacy settings forbid the message (usually: agent blocked).
pub const PRIVACY_BLOCK: i64 = 902;

/// Verification challenge attached to a code-14 failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub sid: String,
    pub image_url: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("platform error {code}: {message}")]
    Platform {
        code: i64,
        message: String,
        challenge: Option<Challenge>,
    },
    #[error("method {0} is frozen until verification completes")]
    Frozen(String),
    #[error("platform request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("unexpected platform response: {0}")]
    Decode(String),
}

impl ApiError {
    /// Shorthand for a coded platform error without a challenge.
    pub fn platform(code: i64, message: impl Into<String>) -> Self {
        ApiError::Platform {
            code,
            message: message.into(),
            challenge: None,
        }
    }

    /// Platform error code, if this is a coded platform failure.
    pub fn code(&self) -> Option<i64> {
        match self {
            ApiError::Platform { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// The single remote primitive consumed by the runtime.
#[async_trait]
pub trait PlatformApi: Send + Sync {
    async fn call(&self, method: &str, params: Params) -> Result<Value, ApiError>;
}

/// Render a JSON parameter the way the platform expects it in a form body.
pub(crate) fn param_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => if *b { "1" } else { "0" }.to_string(),
        Value::Null => String::new(),
        Value::Array(items) => items
            .iter()
            .map(param_to_string)
            .collect::<Vec<_>>()
            .join(","),
        other => other.to_string(),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted platform double shared by the unit tests.

    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays queued results in order (falling back to `{"response": 1}`-style
    /// success) and records every call it receives.
    #[derive(Default)]
    pub struct ScriptedApi {
        script: Mutex<VecDeque<Result<Value, ApiError>>>,
        calls: Mutex<Vec<(String, Params)>>,
    }

    impl ScriptedApi {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push(&self, result: Result<Value, ApiError>) {
            self.script.lock().unwrap().push_back(result);
        }

        pub fn calls(&self) -> Vec<(String, Params)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PlatformApi for ScriptedApi {
        async fn call(&self, method: &str, params: Params) -> Result<Value, ApiError> {
            self.calls
                .lock()
                .unwrap()
                .push((method.to_string(), params));
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(Value::from(1)))
        }
    }

    pub fn challenge_error(sid: &str) -> ApiError {
        ApiError::Platform {
            code: VERIFICATION_REQUIRED,
            message: "Captcha needed".to_string(),
            challenge: Some(Challenge {
                sid: sid.to_string(),
                image_url: None,
            }),
        }
    }
}
