//! Shared challenge storage: the set of outstanding challenges per agent plus the
//! publish/subscribe channel that carries solved values.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use tokio::sync::{broadcast, mpsc};

/// Channel prefix for solved challenges: `verify:recognized:<agentId>:<challengeId>`.
pub const RECOGNIZED_PREFIX: &str = "verify:recognized:";
/// Key prefix for the per-agent set of outstanding challenge ids.
pub const PENDING_PREFIX: &str = "verify:pending:";

/// A solved challenge as delivered on the publish channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Solution {
    pub agent_id: i64,
    pub challenge_id: String,
    pub value: String,
}

/// Publish channel name for one challenge.
pub fn recognized_channel(agent_id: i64, challenge_id: &str) -> String {
    format!("{}{}:{}", RECOGNIZED_PREFIX, agent_id, challenge_id)
}

/// Store key holding the outstanding challenge ids of one agent.
pub fn pending_key(agent_id: i64) -> String {
    format!("{}{}", PENDING_PREFIX, agent_id)
}

/// Agent id of a `verify:pending:<agentId>` key.
pub fn parse_pending_key(key: &str) -> Option<i64> {
    key.strip_prefix(PENDING_PREFIX)?.parse().ok()
}

/// Split a `verify:recognized:<agentId>:<challengeId>` channel name.
pub fn parse_recognized_channel(channel: &str) -> Option<(i64, String)> {
    let rest = channel.strip_prefix(RECOGNIZED_PREFIX)?;
    let (agent, challenge) = rest.split_once(':')?;
    if challenge.is_empty() {
        return None;
    }
    Some((agent.parse().ok()?, challenge.to_string()))
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("challenge store closed")]
    Closed,
}

/// Backend for outstanding challenges and their solutions. Only the
/// verification coordinator talks to it.
#[async_trait]
pub trait ChallengeStore: Send + Sync {
    /// Record `challenge_id` as outstanding for `agent_id`.
    async fn add(&self, agent_id: i64, challenge_id: &str) -> Result<(), StoreError>;

    /// Forget `challenge_id` for `agent_id` (no-op if absent).
    async fn remove(&self, agent_id: i64, challenge_id: &str) -> Result<(), StoreError>;

    /// All outstanding challenges, grouped by agent and sorted.
    async fn list(&self) -> Result<Vec<(i64, Vec<String>)>, StoreError>;

    /// Remove the challenge and publish its solved value in one step.
    async fn publish(&self, solution: Solution) -> Result<(), StoreError>;

    /// Stream of solutions published by anyone sharing this store.
    async fn subscribe(&self) -> Result<mpsc::Receiver<Solution>, StoreError>;
}

/// In-process store for single-process deployments and tests.
pub struct MemoryChallengeStore {
    pending: Mutex<BTreeMap<i64, BTreeSet<String>>>,
    solutions: broadcast::Sender<Solution>,
}

impl Default for MemoryChallengeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryChallengeStore {
    pub fn new() -> Self {
        let (solutions, _) = broadcast::channel(64);
        Self {
            pending: Mutex::new(BTreeMap::new()),
            solutions,
        }
    }

    fn forget(&self, agent_id: i64, challenge_id: &str) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(set) = pending.get_mut(&agent_id) {
            set.remove(challenge_id);
            if set.is_empty() {
                pending.remove(&agent_id);
            }
        }
    }
}

#[async_trait]
impl ChallengeStore for MemoryChallengeStore {
    async fn add(&self, agent_id: i64, challenge_id: &str) -> Result<(), StoreError> {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(agent_id)
            .or_default()
            .insert(challenge_id.to_string());
        Ok(())
    }

    async fn remove(&self, agent_id: i64, challenge_id: &str) -> Result<(), StoreError> {
        self.forget(agent_id, challenge_id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<(i64, Vec<String>)>, StoreError> {
        let pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        Ok(pending
            .iter()
            .map(|(agent, set)| (*agent, set.iter().cloned().collect()))
            .collect())
    }

    async fn publish(&self, solution: Solution) -> Result<(), StoreError> {
        self.forget(solution.agent_id, &solution.challenge_id);
        // No subscribers is not an error: nobody is waiting for this challenge.
        let _ = self.solutions.send(solution);
        Ok(())
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<Solution>, StoreError> {
        let mut rx = self.solutions.subscribe();
        let (tx, out) = mpsc::channel(64);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(solution) => {
                        if tx.send(solution).await.is_err() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("challenge subscriber lagged, {} solution(s) lost", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_names_round_trip() {
        let channel = recognized_channel(42, "9876");
        assert_eq!(channel, "verify:recognized:42:9876");
        assert_eq!(parse_recognized_channel(&channel), Some((42, "9876".to_string())));
        assert_eq!(parse_recognized_channel("verify:recognized:x:1"), None);
        assert_eq!(parse_recognized_channel("verify:recognized:42:"), None);
        assert_eq!(parse_recognized_channel("other:42:1"), None);
    }

    #[test]
    fn pending_keys_name_their_agent() {
        assert_eq!(parse_pending_key(&pending_key(-7)), Some(-7));
        assert_eq!(parse_pending_key("verify:pending:12"), Some(12));
        assert_eq!(parse_pending_key("verify:pending:abc"), None);
        assert_eq!(parse_pending_key("verify:pending:"), None);
        assert_eq!(parse_pending_key("verify:recognized:12"), None);
    }

    #[tokio::test]
    async fn memory_store_groups_by_agent() {
        let store = MemoryChallengeStore::new();
        store.add(2, "b").await.unwrap();
        store.add(1, "z").await.unwrap();
        store.add(2, "a").await.unwrap();
        assert_eq!(
            store.list().await.unwrap(),
            vec![
                (1, vec!["z".to_string()]),
                (2, vec!["a".to_string(), "b".to_string()])
            ]
        );
        store.remove(1, "z").await.unwrap();
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn publish_removes_and_notifies_subscribers() {
        let store = MemoryChallengeStore::new();
        let mut rx = store.subscribe().await.unwrap();
        store.add(7, "sid").await.unwrap();
        let solution = Solution {
            agent_id: 7,
            challenge_id: "sid".to_string(),
            value: "k3y".to_string(),
        };
        store.publish(solution.clone()).await.unwrap();
        assert!(store.list().await.unwrap().is_empty());
        assert_eq!(rx.recv().await, Some(solution));
    }
}
