//! Verification coordinator: parks a call that hit a challenge until an operator
//! publishes the solved value (possibly from another process) or the wait times out.
//!
//! The coordinator owns a registry of pending slots keyed by `(agent_id, challenge_id)`.
//! Exactly one of {published solution, timeout} claims a slot; the loser finds the
//! slot gone and does nothing.

mod redis_store;
mod store;

pub use redis_store::RedisChallengeStore;
pub use store::{
    parse_pending_key, parse_recognized_channel, pending_key, recognized_channel, ChallengeStore,
    MemoryChallengeStore, Solution, StoreError,
};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// How long a call waits for a human before retrying without a solution.
pub const DEFAULT_VERIFICATION_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Identifies one outstanding challenge (and its publish channel).
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct ChannelKey {
    pub agent_id: i64,
    pub challenge_id: String,
}

impl ChannelKey {
    pub fn new(agent_id: i64, challenge_id: impl Into<String>) -> Self {
        Self {
            agent_id,
            challenge_id: challenge_id.into(),
        }
    }
}

struct Slot {
    generation: u64,
    tx: oneshot::Sender<String>,
}

/// Pending resolution slots. Removing a slot is what claims it.
#[derive(Default)]
pub struct PendingRegistry {
    slots: Mutex<HashMap<ChannelKey, Slot>>,
    next_generation: AtomicU64,
}

impl PendingRegistry {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ChannelKey, Slot>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Open a slot for `key`. A second wait on the same key replaces the first,
    /// whose receiver then reports closed.
    fn register(&self, key: ChannelKey) -> (u64, oneshot::Receiver<String>) {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.lock().insert(key, Slot { generation, tx });
        (generation, rx)
    }

    /// Claim whatever slot is registered under `key`.
    fn claim(&self, key: &ChannelKey) -> Option<oneshot::Sender<String>> {
        self.lock().remove(key).map(|slot| slot.tx)
    }

    /// Claim the slot only if it is still the one opened as `generation`.
    fn claim_own(&self, key: &ChannelKey, generation: u64) -> bool {
        let mut slots = self.lock();
        match slots.get(key) {
            Some(slot) if slot.generation == generation => {
                slots.remove(key);
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Releases a wait that was cancelled before it resolved: the slot is claimed
/// and the challenge dropped from the store. A no-op once the slot is gone.
struct AbandonGuard<'a> {
    pending: &'a PendingRegistry,
    store: Arc<dyn ChallengeStore>,
    key: ChannelKey,
    generation: u64,
}

impl Drop for AbandonGuard<'_> {
    fn drop(&mut self) {
        if !self.pending.claim_own(&self.key, self.generation) {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let store = Arc::clone(&self.store);
        let key = self.key.clone();
        runtime.spawn(async move {
            if let Err(e) = store.remove(key.agent_id, &key.challenge_id).await {
                log::debug!("removing abandoned challenge {}: {}", key.challenge_id, e);
            }
        });
        log::info!(
            "agent id{}: wait for challenge {} abandoned",
            self.key.agent_id,
            self.key.challenge_id
        );
    }
}

/// Bridges in-process waiting calls with out-of-process solvers through a
/// [`ChallengeStore`].
pub struct VerificationCoordinator {
    store: Arc<dyn ChallengeStore>,
    pending: PendingRegistry,
    timeout: Duration,
}

impl VerificationCoordinator {
    pub fn new(store: Arc<dyn ChallengeStore>) -> Self {
        Self {
            store,
            pending: PendingRegistry::default(),
            timeout: DEFAULT_VERIFICATION_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn pending(&self) -> &PendingRegistry {
        &self.pending
    }

    /// Subscribe to published solutions and resolve matching slots until the
    /// store's subscription ends.
    pub async fn start(self: &Arc<Self>) -> Result<JoinHandle<()>, StoreError> {
        let mut solutions = self.store.subscribe().await?;
        let coordinator = Arc::clone(self);
        log::info!("verification coordinator: listening for solved challenges");
        Ok(tokio::spawn(async move {
            while let Some(solution) = solutions.recv().await {
                coordinator.resolve(solution).await;
            }
            log::info!("verification coordinator: subscription closed");
        }))
    }

    async fn resolve(&self, solution: Solution) {
        let key = ChannelKey::new(solution.agent_id, solution.challenge_id.clone());
        // Not ours (another process is waiting) or the wait already timed out.
        let Some(slot) = self.pending.claim(&key) else {
            return;
        };
        if let Err(e) = self.remove(solution.agent_id, &solution.challenge_id).await {
            log::debug!("removing solved challenge {}: {}", solution.challenge_id, e);
        }
        log::info!(
            "agent id{}: challenge {} solved",
            solution.agent_id,
            solution.challenge_id
        );
        let _ = slot.send(solution.value);
    }

    /// Record the challenge in shared storage and wait for its solution.
    /// Returns `None` when the wait times out.
    pub async fn add_and_wait(&self, agent_id: i64, challenge_id: &str) -> Option<String> {
        let key = ChannelKey::new(agent_id, challenge_id);
        let (generation, mut rx) = self.pending.register(key.clone());
        let _abandon = AbandonGuard {
            pending: &self.pending,
            store: Arc::clone(&self.store),
            key: key.clone(),
            generation,
        };
        if let Err(e) = self.store.add(agent_id, challenge_id).await {
            log::warn!(
                "agent id{}: recording challenge {} failed: {}",
                agent_id,
                challenge_id,
                e
            );
        }
        log::info!(
            "agent id{}: waiting for challenge {} to be solved",
            agent_id,
            challenge_id
        );

        match tokio::time::timeout(self.timeout, &mut rx).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(_)) => None,
            Err(_) => {
                if !self.pending.claim_own(&key, generation) {
                    // A solution claimed the slot while the timer fired.
                    return rx.await.ok();
                }
                if let Err(e) = self.remove(agent_id, challenge_id).await {
                    log::debug!("removing expired challenge {}: {}", challenge_id, e);
                }
                log::info!(
                    "agent id{}: challenge {} expired unsolved",
                    agent_id,
                    challenge_id
                );
                None
            }
        }
    }

    /// Outstanding challenges across all agents, grouped by agent id.
    pub async fn get_all(&self) -> Result<Vec<(i64, Vec<String>)>, StoreError> {
        self.store.list().await
    }

    /// Drop a challenge from shared storage without resolving any waiter.
    pub async fn remove(&self, agent_id: i64, challenge_id: &str) -> Result<(), StoreError> {
        self.store.remove(agent_id, challenge_id).await
    }

    /// Publish a solved value for `(agent_id, challenge_id)`.
    pub async fn submit(
        &self,
        agent_id: i64,
        challenge_id: &str,
        value: &str,
    ) -> Result<(), StoreError> {
        self.store
            .publish(Solution {
                agent_id,
                challenge_id: challenge_id.to_string(),
                value: value.to_string(),
            })
            .await
    }
}
