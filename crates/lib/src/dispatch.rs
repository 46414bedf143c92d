//! Dispatcher: drains an agent's outbound queue at a fixed cadence and performs
//! `messages.send`, absorbing the platform's send-side error codes.

use crate::api::{ApiError, PlatformApi, ACCESS_DENIED, FLOOD_CONTROL, INTERNAL_ERROR, PRIVACY_BLOCK};
use crate::queue::{OutboundMessage, SharedQueue};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Pause between two sends (and between polls of an empty queue).
pub const DEFAULT_MESSAGES_DELAY: Duration = Duration::from_millis(1000);
/// Appended to a body the platform rejected as a flood repeat.
pub const FLOOD_FILLER: &str = " 😊";

/// Terminal result of one send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// Dropped without retry; carries the platform code when there was one.
    Dropped(Option<i64>),
}

pub struct Dispatcher {
    agent_id: i64,
    api: Arc<dyn PlatformApi>,
    queue: SharedQueue,
    delay: Duration,
    running: AtomicBool,
}

impl Dispatcher {
    pub fn new(agent_id: i64, api: Arc<dyn PlatformApi>, queue: SharedQueue) -> Self {
        Self {
            agent_id,
            api,
            queue,
            delay: DEFAULT_MESSAGES_DELAY,
            running: AtomicBool::new(false),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);
        log::info!("agent id{}: starting dispatcher", self.agent_id);
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(&self) {
        while self.running.load(Ordering::SeqCst) {
            // Outer None: queue empty. Inner None: entry was cleared.
            let next = {
                let mut queue = self.queue.lock().await;
                if queue.is_empty() {
                    None
                } else {
                    Some(queue.dequeue())
                }
            };
            match next {
                None => tokio::time::sleep(self.delay).await,
                Some(None) => continue,
                Some(Some(msg)) => {
                    if self.send(msg).await == SendOutcome::Sent {
                        log::info!("agent id{}: reply sent", self.agent_id);
                    }
                    tokio::time::sleep(self.delay).await;
                }
            }
        }
        log::info!("agent id{}: dispatcher stopped", self.agent_id);
    }

    /// Send one message, resending with a filler character for as long as the
    /// platform reports flood control. Never fails; undeliverable messages are dropped.
    pub async fn send(&self, mut msg: OutboundMessage) -> SendOutcome {
        loop {
            let err = match self.api.call("messages.send", msg.to_params()).await {
                Ok(_) => return SendOutcome::Sent,
                Err(err) => err,
            };
            match err.code() {
                Some(FLOOD_CONTROL) => {
                    msg.body.push_str(FLOOD_FILLER);
                    continue;
                }
                Some(code @ (INTERNAL_ERROR | ACCESS_DENIED | PRIVACY_BLOCK)) => {
                    log::debug!(
                        "agent id{}: dropping message to {:?} (code {})",
                        self.agent_id,
                        msg.peer,
                        code
                    );
                    return SendOutcome::Dropped(Some(code));
                }
                code => {
                    log_unsendable(self.agent_id, &err);
                    return SendOutcome::Dropped(code);
                }
            }
        }
    }
}

fn log_unsendable(agent_id: i64, err: &ApiError) {
    log::error!("agent id{}: unable to send a message: {}", agent_id, err);
}
