//! Per-agent call gate: freezes a method while the platform's verification
//! challenge for it is outstanding, and retries the call once it resolves.

use super::{ApiError, Params, PlatformApi, VERIFICATION_REQUIRED};
use crate::verify::VerificationCoordinator;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Wraps an agent's platform client. Frozen methods fail fast with
/// [`ApiError::Frozen`]; everything else passes through.
pub struct CallGate {
    agent_id: i64,
    inner: Arc<dyn PlatformApi>,
    coordinator: Arc<VerificationCoordinator>,
    /// method -> number of challenges it is currently waiting on
    frozen: Mutex<HashMap<String, usize>>,
}

impl CallGate {
    pub fn new(
        agent_id: i64,
        inner: Arc<dyn PlatformApi>,
        coordinator: Arc<VerificationCoordinator>,
    ) -> Self {
        Self {
            agent_id,
            inner,
            coordinator,
            frozen: Mutex::new(HashMap::new()),
        }
    }

    pub fn agent_id(&self) -> i64 {
        self.agent_id
    }

    pub fn is_frozen(&self, method: &str) -> bool {
        self.lock().contains_key(method)
    }

    /// Methods currently frozen, sorted.
    pub fn frozen_methods(&self) -> Vec<String> {
        let mut methods: Vec<String> = self.lock().keys().cloned().collect();
        methods.sort();
        methods
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, usize>> {
        self.frozen.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn freeze(&self, method: &str) {
        *self.lock().entry(method.to_string()).or_insert(0) += 1;
    }

    fn thaw(&self, method: &str) {
        let mut frozen = self.lock();
        if let Some(count) = frozen.get_mut(method) {
            *count -= 1;
            if *count == 0 {
                frozen.remove(method);
            }
        }
    }
}

#[async_trait]
impl PlatformApi for CallGate {
    async fn call(&self, method: &str, params: Params) -> Result<Value, ApiError> {
        let mut attempt = params.clone();
        loop {
            if self.is_frozen(method) {
                return Err(ApiError::Frozen(method.to_string()));
            }
            let challenge = match self.inner.call(method, attempt.clone()).await {
                Err(ApiError::Platform {
                    code: VERIFICATION_REQUIRED,
                    challenge: Some(challenge),
                    ..
                }) => challenge,
                other => return other,
            };

            log::info!(
                "agent id{}: {} needs verification, freezing it",
                self.agent_id,
                method
            );
            self.freeze(method);
            let solved = self
                .coordinator
                .add_and_wait(self.agent_id, &challenge.sid)
                .await;
            self.thaw(method);

            attempt = params.clone();
            match solved {
                Some(key) => {
                    attempt.insert("captcha_sid".to_string(), Value::String(challenge.sid));
                    attempt.insert("captcha_key".to_string(), Value::String(key));
                }
                None => {
                    log::debug!(
                        "agent id{}: retrying {} without a solution",
                        self.agent_id,
                        method
                    );
                }
            }
        }
    }
}
