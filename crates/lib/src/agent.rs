//! Agent: one managed chat identity. Composes the call gate, the long-poll
//! channel, the classification consumer, the outbound queue, the dispatcher and
//! the presence/friends maintenance loops.

use crate::api::{CallGate, Params, PlatformApi};
use crate::channels::{InboundMessage, LongPollChannel};
use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::events::{build_outbound, classify, peer_of, AgentContext, EventHandler};
use crate::queue::{OutboundQueue, SharedQueue};
use crate::verify::VerificationCoordinator;
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const INBOUND_BUFFER: usize = 64;

/// Accepts incoming friend requests and withdraws outgoing ones, keeping the
/// friend count under the platform limit.
const FRIENDS_SCRIPT: &str = "var rc = 12;\
var fc = API.friends.get({ count: 1 }).count;\
var ro = API.friends.getRequests({ count: 10, out: 1 }).items;\
if (ro.length < 10) { rc = rc + (10 - ro.length); }\
var ri = API.friends.getRequests({ count: rc, sort: 0 }).items;\
var ac = 10000 + ro.length - fc;\
while (ro.length > 0) { API.friends.delete({ user_id: ro.shift() }); }\
while (ac > 0 && ri.length > 0) { API.friends.add({ user_id: ri.shift() }); ac = ac - 1; }\
return \"ok\";";

/// Per-agent tuning, usually taken from the `runtime` and `platform` config sections.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub queue_capacity: usize,
    pub messages_delay: Duration,
    pub poll_retry_delay: Duration,
    pub long_poll_wait: u64,
    pub status_delay: Option<Duration>,
    pub friends_delay: Option<Duration>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl AgentSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            queue_capacity: config.runtime.queue_capacity,
            messages_delay: config.runtime.messages_delay(),
            poll_retry_delay: config.runtime.poll_retry_delay(),
            long_poll_wait: config.platform.long_poll_wait,
            status_delay: config.runtime.status_delay(),
            friends_delay: config.runtime.friends_delay(),
        }
    }
}

pub struct Agent {
    id: i64,
    pattern: Option<Regex>,
    gate: Arc<CallGate>,
    queue: SharedQueue,
    channel: Arc<LongPollChannel>,
    dispatcher: Arc<Dispatcher>,
    handler: Arc<dyn EventHandler>,
    managed: Arc<BTreeSet<i64>>,
    settings: AgentSettings,
    running: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Agent {
    /// `api` is the agent's raw platform client; every call goes through a
    /// [`CallGate`] built on top of it.
    pub fn new(
        id: i64,
        api: Arc<dyn PlatformApi>,
        coordinator: Arc<VerificationCoordinator>,
        pattern: Option<Regex>,
        handler: Arc<dyn EventHandler>,
        managed: Arc<BTreeSet<i64>>,
        settings: AgentSettings,
    ) -> Self {
        let gate = Arc::new(CallGate::new(id, api, coordinator));
        let queue = OutboundQueue::shared(settings.queue_capacity);
        let channel = Arc::new(
            LongPollChannel::new(id, gate.clone())
                .with_wait(settings.long_poll_wait)
                .with_retry_delay(settings.poll_retry_delay),
        );
        let dispatcher = Arc::new(
            Dispatcher::new(id, gate.clone(), queue.clone()).with_delay(settings.messages_delay),
        );
        Self {
            id,
            pattern,
            gate,
            queue,
            channel,
            dispatcher,
            handler,
            managed,
            settings,
            running: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn gate(&self) -> &Arc<CallGate> {
        &self.gate
    }

    pub fn queue(&self) -> &SharedQueue {
        &self.queue
    }

    /// Current long-poll cursor, once a session is established.
    pub fn cursor(&self) -> Option<String> {
        self.channel.cursor()
    }

    pub fn context(&self) -> AgentContext {
        AgentContext {
            agent_id: self.id,
            api: self.gate.clone(),
            queue: self.queue.clone(),
            managed: self.managed.clone(),
        }
    }

    /// Spawn the long-poll, consumer, dispatcher and maintenance tasks.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let (tx, mut rx) = mpsc::channel::<InboundMessage>(INBOUND_BUFFER);
        let mut tasks = Vec::new();
        tasks.push(self.channel.clone().start_inbound(tx));

        let agent = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            // One message at a time keeps the queue single-producer.
            while let Some(msg) = rx.recv().await {
                agent.process_inbound(msg).await;
            }
            log::debug!("agent id{}: inbound stream ended", agent.id);
        }));

        tasks.push(self.dispatcher.clone().start());

        if let Some(delay) = self.settings.status_delay {
            tasks.push(self.spawn_maintenance("account.setOnline", Params::new(), delay, "update online status"));
        }
        if let Some(delay) = self.settings.friends_delay {
            let mut params = Params::new();
            params.insert("code".to_string(), Value::String(FRIENDS_SCRIPT.to_string()));
            tasks.push(self.spawn_maintenance("execute", params, delay, "process friend requests"));
        }

        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(tasks);
        log::info!("agent id{} started", self.id);
    }

    /// Stop every loop of this agent. Sends in flight are not drained.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.channel.stop();
        self.dispatcher.stop();
        for task in self.tasks.lock().unwrap_or_else(|e| e.into_inner()).drain(..) {
            task.abort();
        }
        log::info!("agent id{} stopped", self.id);
    }

    fn spawn_maintenance(
        self: &Arc<Self>,
        method: &'static str,
        params: Params,
        delay: Duration,
        what: &'static str,
    ) -> JoinHandle<()> {
        let agent = Arc::clone(self);
        tokio::spawn(async move {
            while agent.running.load(Ordering::SeqCst) {
                if let Err(e) = agent.gate.call(method, params.clone()).await {
                    log::error!("agent id{}: unable to {}: {}", agent.id, what, e);
                }
                tokio::time::sleep(delay).await;
            }
        })
    }

    /// Classify one inbound message, run its handler and queue the reply.
    /// Messages are dropped when the queue cannot take a reply for their conversation.
    pub async fn process_inbound(&self, msg: InboundMessage) {
        log::info!("agent id{}: new message in {}", self.id, msg.conversation_id);
        if !self.queue.lock().await.accepts(peer_of(&msg)) {
            log::info!(
                "agent id{}: message queue is full, message will not be processed",
                self.id
            );
            return;
        }
        let Some(kind) = classify(self.id, self.pattern.as_ref(), &msg) else {
            return;
        };
        log::debug!("agent id{}: {} in {}", self.id, kind.as_str(), msg.conversation_id);
        let ctx = self.context();
        let Some(reply) = self.handler.handle(&ctx, kind, &msg).await else {
            return;
        };
        let Some(outbound) = build_outbound(reply, &msg) else {
            return;
        };
        if let Err(e) = self.queue.lock().await.enqueue(outbound) {
            log::info!("agent id{}: reply dropped: {}", self.id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::ScriptedApi;
    use crate::channels::Attachments;
    use crate::events::{BuiltinHandlers, EventKind, Reply};
    use crate::queue::{OutboundMessage, Peer};
    use crate::verify::MemoryChallengeStore;
    use async_trait::async_trait;
    use httpmock::{Method::GET, MockServer};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    const AGENT: i64 = 100;

    #[derive(Default)]
    struct Echo {
        seen: AtomicUsize,
    }

    #[async_trait]
    impl EventHandler for Echo {
        async fn handle(&self, _ctx: &AgentContext, kind: EventKind, msg: &InboundMessage) -> Option<Reply> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            (kind == EventKind::Appeal).then(|| Reply::text(format!("re: {}", msg.body)))
        }
    }

    fn quiet_settings() -> AgentSettings {
        AgentSettings {
            queue_capacity: 2,
            messages_delay: Duration::from_millis(10),
            poll_retry_delay: Duration::from_millis(10),
            long_poll_wait: 1,
            status_delay: None,
            friends_delay: None,
        }
    }

    fn agent_with(api: Arc<ScriptedApi>, handler: Arc<dyn EventHandler>, pattern: Option<Regex>) -> Arc<Agent> {
        let coordinator = Arc::new(VerificationCoordinator::new(Arc::new(MemoryChallengeStore::new())));
        Arc::new(Agent::new(
            AGENT,
            api,
            coordinator,
            pattern,
            handler,
            Arc::new([AGENT].into_iter().collect()),
            quiet_settings(),
        ))
    }

    fn direct(from: i64, body: &str) -> InboundMessage {
        InboundMessage {
            message_id: 1,
            conversation_id: from,
            sender_id: from,
            body: body.to_string(),
            attachments: Attachments::new(),
            is_multichat: false,
        }
    }

    #[tokio::test]
    async fn replies_are_queued_and_coalesced() {
        let echo = Arc::new(Echo::default());
        let agent = agent_with(Arc::new(ScriptedApi::new()), echo.clone(), None);
        agent.process_inbound(direct(5, "one")).await;
        agent.process_inbound(direct(5, "two")).await;

        let mut queue = agent.queue().lock().await;
        assert_eq!(queue.len(), 1);
        let msg = queue.dequeue().unwrap();
        assert_eq!(msg.peer, Peer::User(5));
        assert_eq!(msg.body, "re: one\n\nre: two");
    }

    #[tokio::test]
    async fn full_queue_drops_before_handling() {
        let echo = Arc::new(Echo::default());
        let agent = agent_with(Arc::new(ScriptedApi::new()), echo.clone(), None);
        {
            let mut queue = agent.queue().lock().await;
            queue.enqueue(OutboundMessage::text(Peer::User(1), "a")).unwrap();
            queue.enqueue(OutboundMessage::text(Peer::User(2), "b")).unwrap();
        }
        agent.process_inbound(direct(3, "ignored")).await;
        assert_eq!(echo.seen.load(Ordering::SeqCst), 0);

        // a conversation that already has a pending reply still gets through
        agent.process_inbound(direct(2, "more")).await;
        assert_eq!(echo.seen.load(Ordering::SeqCst), 1);
        assert_eq!(agent.queue().lock().await.len(), 2);
    }

    #[tokio::test]
    async fn unaddressed_group_messages_are_ignored() {
        let echo = Arc::new(Echo::default());
        let pattern = Regex::new("^bot").unwrap();
        let agent = agent_with(Arc::new(ScriptedApi::new()), echo.clone(), Some(pattern));
        let mut msg = direct(42, "hello everyone");
        msg.is_multichat = true;
        msg.attachments.insert("from".into(), "7".into());
        agent.process_inbound(msg.clone()).await;
        assert_eq!(echo.seen.load(Ordering::SeqCst), 0);

        msg.body = "bot, hi".into();
        agent.process_inbound(msg).await;
        let queued = agent.queue().lock().await.dequeue().unwrap();
        assert_eq!(queued.peer, Peer::Chat(42));
        assert_eq!(queued.forward_messages, vec![1]);
    }

    #[tokio::test]
    async fn membership_events_need_no_responder() {
        let api = Arc::new(ScriptedApi::new());
        let agent = agent_with(api.clone(), Arc::new(BuiltinHandlers::default()), None);
        agent.process_inbound(direct(5, "hi")).await;
        assert!(agent.queue().lock().await.is_empty());
        assert!(api.calls().is_empty());
    }

    #[tokio::test]
    async fn inbound_update_is_answered_end_to_end() {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(GET).path("/lp").query_param("ts", "1");
            then.status(200).json_body(json!({
                "ts": 2,
                "updates": [[4, 10, 33, 555, 0, "", "&lt;hi&gt;", {}]]
            }));
        });
        server.mock(|when, then| {
            when.method(GET).path("/lp").query_param("ts", "2");
            then.status(200)
                .delay(Duration::from_millis(300))
                .json_body(json!({ "ts": 2, "updates": [] }));
        });

        let api = Arc::new(ScriptedApi::new());
        api.push(Ok(json!({ "server": format!("{}/lp", server.base_url()), "key": "k", "ts": 1 })));
        let agent = agent_with(api.clone(), Arc::new(Echo::default()), None);
        agent.start();

        let mut sent = None;
        for _ in 0..200 {
            sent = api.calls().into_iter().find(|(m, _)| m == "messages.send");
            if sent.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        agent.stop();

        let (_, params) = sent.expect("reply sent");
        assert_eq!(params["user_id"], json!(555));
        assert_eq!(params["message"], json!("re: <hi>"));
        assert_eq!(agent.cursor().as_deref(), Some("2"));
    }
}
