//! Redis-backed challenge store: per-agent sets under `verify:pending:<agentId>`
//! and solutions published on `verify:recognized:<agentId>:<challengeId>`, so the
//! process holding a waiting call and the operator's process can be different.

use super::store::{
    parse_pending_key, parse_recognized_channel, pending_key, recognized_channel, ChallengeStore, Solution,
    StoreError, PENDING_PREFIX, RECOGNIZED_PREFIX,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use redis::AsyncCommands;
use std::time::Duration;
use tokio::sync::mpsc;

const RECONNECT_DELAY: Duration = Duration::from_millis(1500);

pub struct RedisChallengeStore {
    client: redis::Client,
    conn: redis::aio::MultiplexedConnection,
}

impl RedisChallengeStore {
    /// Connect to `url` (e.g. `redis://127.0.0.1/`).
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        log::info!("challenge store connected to redis");
        Ok(Self { client, conn })
    }
}

async fn open_pubsub(client: &redis::Client) -> Result<redis::aio::PubSub, StoreError> {
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.psubscribe(format!("{}*", RECOGNIZED_PREFIX)).await?;
    Ok(pubsub)
}

#[async_trait]
impl ChallengeStore for RedisChallengeStore {
    async fn add(&self, agent_id: i64, challenge_id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.sadd(pending_key(agent_id), challenge_id).await?;
        Ok(())
    }

    async fn remove(&self, agent_id: i64, challenge_id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.srem(pending_key(agent_id), challenge_id).await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<(i64, Vec<String>)>, StoreError> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = conn.keys(format!("{}*", PENDING_PREFIX)).await?;
        let mut sets = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(agent_id) = parse_pending_key(&key) else {
                continue;
            };
            let members: Vec<String> = conn.smembers(&key).await?;
            sets.push((agent_id, members));
        }
        Ok(sorted_listing(sets))
    }

    async fn publish(&self, solution: Solution) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .srem(pending_key(solution.agent_id), &solution.challenge_id)
            .ignore()
            .publish(
                recognized_channel(solution.agent_id, &solution.challenge_id),
                &solution.value,
            )
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<Solution>, StoreError> {
        let pubsub = open_pubsub(&self.client).await?;
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(forward_solutions(self.client.clone(), pubsub, tx));
        Ok(rx)
    }
}

/// Drop empty sets and order agents and their challenge ids.
fn sorted_listing(mut sets: Vec<(i64, Vec<String>)>) -> Vec<(i64, Vec<String>)> {
    sets.retain(|(_, members)| !members.is_empty());
    for (_, members) in sets.iter_mut() {
        members.sort();
    }
    sets.sort_by_key(|(agent_id, _)| *agent_id);
    sets
}

/// Pump pattern-subscription messages into `tx`, resubscribing when the
/// connection drops. Ends once the receiver is gone.
async fn forward_solutions(
    client: redis::Client,
    first: redis::aio::PubSub,
    tx: mpsc::Sender<Solution>,
) {
    let mut next = Some(first);
    loop {
        let pubsub = match next.take() {
            Some(p) => p,
            None => match open_pubsub(&client).await {
                Ok(p) => p,
                Err(e) => {
                    log::debug!("redis resubscribe failed: {}", e);
                    tokio::time::sleep(RECONNECT_DELAY).await;
                    continue;
                }
            },
        };
        let mut messages = Box::pin(pubsub.into_on_message());
        while let Some(msg) = messages.next().await {
            let Some((agent_id, challenge_id)) = parse_recognized_channel(msg.get_channel_name())
            else {
                continue;
            };
            let value: String = match msg.get_payload() {
                Ok(v) => v,
                Err(e) => {
                    log::debug!("ignoring undecodable solution payload: {}", e);
                    continue;
                }
            };
            let solution = Solution {
                agent_id,
                challenge_id,
                value,
            };
            if tx.send(solution).await.is_err() {
                return;
            }
        }
        if tx.is_closed() {
            return;
        }
        log::warn!("redis challenge subscription dropped, reconnecting");
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}
