//! Long-poll channel: acquires a poll session through the platform API, keeps a
//! poll request open at all times and forwards decoded messages to the agent.

use crate::api::{ApiError, Params, PlatformApi, INTERNAL_ERROR};
use crate::channels::inbound::{decode_update, InboundMessage};
use serde::Deserialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Server-side wait of one poll request, in seconds.
pub const DEFAULT_WAIT: u64 = 25;
/// Delay before retrying a failed poll or session acquisition.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(1500);

/// Long-poll session as returned by `messages.getLongPollServer`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct LongPollSession {
    pub server: String,
    pub key: String,
    #[serde(deserialize_with = "cursor_from_value")]
    pub ts: String,
}

impl LongPollSession {
    /// Poll URL for the current cursor.
    pub fn poll_url(&self, wait: u64) -> String {
        let base = if self.server.starts_with("http://") || self.server.starts_with("https://") {
            self.server.clone()
        } else {
            format!("https://{}", self.server)
        };
        format!(
            "{}?act=a_check&wait={}&mode=2&key={}&ts={}",
            base, wait, self.key, self.ts
        )
    }
}

fn cursor_to_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn cursor_from_value<'de, D>(d: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let v = Value::deserialize(d)?;
    cursor_to_string(&v).ok_or_else(|| serde::de::Error::custom("ts must be a string or number"))
}

#[derive(Debug, Deserialize)]
struct PollResponse {
    #[serde(default)]
    ts: Option<Value>,
    #[serde(default)]
    updates: Vec<Value>,
    #[serde(default)]
    failed: Option<i64>,
}

#[derive(Debug)]
enum PollError {
    Status(reqwest::StatusCode),
    Transport(String),
}

impl std::fmt::Display for PollError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PollError::Status(s) => write!(f, "poll returned {}", s),
            PollError::Transport(e) => write!(f, "poll failed: {}", e),
        }
    }
}

/// Long-poll connector for one agent.
pub struct LongPollChannel {
    agent_id: i64,
    api: Arc<dyn PlatformApi>,
    client: reqwest::Client,
    running: AtomicBool,
    wait: u64,
    retry_delay: Duration,
    cursor: Mutex<Option<String>>,
}

impl LongPollChannel {
    pub fn new(agent_id: i64, api: Arc<dyn PlatformApi>) -> Self {
        Self {
            agent_id,
            api,
            client: reqwest::Client::new(),
            running: AtomicBool::new(false),
            wait: DEFAULT_WAIT,
            retry_delay: DEFAULT_RETRY_DELAY,
            cursor: Mutex::new(None),
        }
    }

    pub fn with_wait(mut self, wait: u64) -> Self {
        self.wait = wait;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop the poll loop after the in-flight request completes.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Current long-poll cursor (`ts`), if a session is established.
    pub fn cursor(&self) -> Option<String> {
        self.cursor.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_cursor(&self, ts: Option<String>) {
        *self.cursor.lock().unwrap_or_else(|e| e.into_inner()) = ts;
    }

    /// Start the long-poll loop, forwarding messages into `inbound_tx`.
    pub fn start_inbound(
        self: Arc<Self>,
        inbound_tx: mpsc::Sender<InboundMessage>,
    ) -> JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);
        log::info!("agent id{}: starting long-poll loop", self.agent_id);
        tokio::spawn(async move {
            run_long_poll_loop(self, inbound_tx).await;
        })
    }

    /// Ask the platform for a fresh poll server, key and cursor.
    pub async fn acquire_session(&self) -> Result<LongPollSession, ApiError> {
        let mut params = Params::new();
        params.insert("lp_version".to_string(), Value::from(2));
        let res = self.api.call("messages.getLongPollServer", params).await?;
        serde_json::from_value(res).map_err(|e| ApiError::Decode(e.to_string()))
    }

    fn spawn_poll(&self, url: String) -> JoinHandle<Result<PollResponse, PollError>> {
        let client = self.client.clone();
        let timeout = Duration::from_secs(self.wait + 10);
        tokio::spawn(async move {
            let res = client
                .get(&url)
                .timeout(timeout)
                .send()
                .await
                .map_err(|e| PollError::Transport(e.to_string()))?;
            if !res.status().is_success() {
                return Err(PollError::Status(res.status()));
            }
            res.json::<PollResponse>()
                .await
                .map_err(|e| PollError::Transport(e.to_string()))
        })
    }
}

async fn run_long_poll_loop(channel: Arc<LongPollChannel>, inbound_tx: mpsc::Sender<InboundMessage>) {
    let mut session: Option<LongPollSession> = None;
    let mut in_flight: Option<JoinHandle<Result<PollResponse, PollError>>> = None;

    while channel.running() {
        if session.is_none() {
            match channel.acquire_session().await {
                Ok(s) => {
                    log::debug!("agent id{}: long-poll session acquired", channel.agent_id);
                    channel.set_cursor(Some(s.ts.clone()));
                    session = Some(s);
                }
                Err(e) => {
                    if e.code() == Some(INTERNAL_ERROR) {
                        log::debug!("agent id{}: long-poll server unavailable: {}", channel.agent_id, e);
                    } else {
                        log::warn!("agent id{}: unable to get long-poll server: {}", channel.agent_id, e);
                    }
                    tokio::time::sleep(channel.retry_delay).await;
                }
            }
            continue;
        }
        let Some(current) = session.as_mut() else {
            continue;
        };

        let handle = match in_flight.take() {
            Some(h) => h,
            None => channel.spawn_poll(current.poll_url(channel.wait)),
        };
        let outcome = match handle.await {
            Ok(outcome) => outcome,
            Err(e) => Err(PollError::Transport(e.to_string())),
        };
        let body = match outcome {
            Ok(body) => body,
            Err(e) => {
                log::debug!("agent id{}: {}; retrying", channel.agent_id, e);
                tokio::time::sleep(channel.retry_delay).await;
                continue;
            }
        };

        if let Some(failed) = body.failed {
            if failed != 1 {
                log::debug!("agent id{}: long-poll key expired (failed={})", channel.agent_id, failed);
                session = None;
                continue;
            }
        }
        if let Some(ts) = body.ts.as_ref().and_then(cursor_to_string) {
            current.ts = ts;
            channel.set_cursor(Some(current.ts.clone()));
        }
        if body.updates.is_empty() {
            continue;
        }

        // Keep the connection open while this batch is handed over.
        in_flight = Some(channel.spawn_poll(current.poll_url(channel.wait)));
        for update in &body.updates {
            let Some(msg) = decode_update(channel.agent_id, update) else {
                continue;
            };
            if inbound_tx.send(msg).await.is_err() {
                log::debug!("agent id{}: inbound stream closed, stopping long-poll", channel.agent_id);
                if let Some(h) = in_flight.take() {
                    h.abort();
                }
                return;
            }
        }
    }
    if let Some(h) = in_flight.take() {
        h.abort();
    }
    log::info!("agent id{}: long-poll loop stopped", channel.agent_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::ScriptedApi;
    use httpmock::{Method::GET, MockServer};
    use serde_json::json;

    fn session_for(server: &MockServer, ts: i64) -> Value {
        json!({ "server": format!("{}/lp", server.base_url()), "key": "k1", "ts": ts })
    }

    #[test]
    fn poll_url_adds_scheme_and_cursor() {
        let s = LongPollSession {
            server: "imv4.vk.com/im0123".into(),
            key: "abc".into(),
            ts: "1700".into(),
        };
        assert_eq!(
            s.poll_url(25),
            "https://imv4.vk.com/im0123?act=a_check&wait=25&mode=2&key=abc&ts=1700"
        );
    }

    #[test]
    fn session_accepts_numeric_ts() {
        let s: LongPollSession =
            serde_json::from_value(json!({ "server": "h", "key": "k", "ts": 42 })).unwrap();
        assert_eq!(s.ts, "42");
    }

    #[tokio::test]
    async fn emits_filtered_messages_and_advances_cursor() {
        let server = MockServer::start_async().await;
        let first = server.mock(|when, then| {
            when.method(GET).path("/lp").query_param("ts", "1");
            then.status(200).json_body(json!({
                "ts": 2,
                "updates": [
                    [4, 10, 33, 555, 0, "", "&lt;hi&gt;", {}],
                    [4, 11, 35, 555, 0, "", "outgoing", {}],
                    [8, -555, 0]
                ]
            }));
        });
        server.mock(|when, then| {
            when.method(GET).path("/lp").query_param("ts", "2");
            then.status(200)
                .delay(Duration::from_millis(200))
                .json_body(json!({ "ts": 2, "updates": [] }));
        });

        let api = Arc::new(ScriptedApi::new());
        api.push(Ok(session_for(&server, 1)));
        let channel = Arc::new(
            LongPollChannel::new(100, api.clone()).with_retry_delay(Duration::from_millis(10)),
        );
        let (tx, mut rx) = mpsc::channel(8);
        let handle = channel.clone().start_inbound(tx);

        let msg = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("message in time")
            .expect("stream open");
        assert_eq!(msg.conversation_id, 555);
        assert_eq!(msg.body, "<hi>");
        assert_eq!(channel.cursor().as_deref(), Some("2"));
        first.assert_calls(1);

        channel.stop();
        handle.abort();
        assert_eq!(api.calls()[0].0, "messages.getLongPollServer");
        assert_eq!(api.calls()[0].1["lp_version"], json!(2));
    }

    #[tokio::test]
    async fn expired_key_reacquires_session() {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(GET).path("/lp").query_param("key", "k1");
            then.status(200).json_body(json!({ "failed": 2 }));
        });
        server.mock(|when, then| {
            when.method(GET).path("/lp").query_param("key", "k2");
            then.status(200).json_body(json!({
                "ts": 8,
                "updates": [[4, 1, 33, 9, 0, "", "after refresh", {}]]
            }));
        });

        let api = Arc::new(ScriptedApi::new());
        api.push(Ok(session_for(&server, 1)));
        api.push(Ok(json!({ "server": format!("{}/lp", server.base_url()), "key": "k2", "ts": 7 })));
        let channel = Arc::new(
            LongPollChannel::new(100, api.clone()).with_retry_delay(Duration::from_millis(10)),
        );
        let (tx, mut rx) = mpsc::channel(8);
        let handle = channel.clone().start_inbound(tx);

        let msg = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("message in time")
            .expect("stream open");
        assert_eq!(msg.body, "after refresh");
        channel.stop();
        handle.abort();
        let acquisitions = api
            .calls()
            .iter()
            .filter(|(m, _)| m == "messages.getLongPollServer")
            .count();
        assert!(acquisitions >= 2);
    }

    #[tokio::test]
    async fn http_errors_retry_the_same_url() {
        let server = MockServer::start_async().await;
        let failing = server.mock(|when, then| {
            when.method(GET).path("/lp");
            then.status(503);
        });

        let api = Arc::new(ScriptedApi::new());
        api.push(Ok(session_for(&server, 5)));
        let channel = Arc::new(
            LongPollChannel::new(100, api.clone()).with_retry_delay(Duration::from_millis(10)),
        );
        let (tx, _rx) = mpsc::channel(8);
        let handle = channel.clone().start_inbound(tx);

        tokio::time::sleep(Duration::from_millis(200)).await;
        channel.stop();
        handle.abort();
        assert!(failing.calls() >= 2);
        // Only the initial session was acquired; failures never reacquire.
        assert_eq!(api.calls().len(), 1);
        assert_eq!(channel.cursor().as_deref(), Some("5"));
    }

    #[tokio::test]
    async fn acquisition_errors_retry_and_network_errors_keep_the_session() {
        let api = Arc::new(ScriptedApi::new());
        api.push(Err(ApiError::platform(INTERNAL_ERROR, "Internal server error")));
        api.push(Err(ApiError::platform(5, "User authorization failed")));
        // Nothing listens on the discard port, so every poll is refused.
        api.push(Ok(json!({ "server": "http://127.0.0.1:9/lp", "key": "k1", "ts": 3 })));
        let channel = Arc::new(
            LongPollChannel::new(100, api.clone()).with_retry_delay(Duration::from_millis(10)),
        );
        let (tx, _rx) = mpsc::channel(8);
        let handle = channel.clone().start_inbound(tx);

        tokio::time::sleep(Duration::from_millis(300)).await;
        channel.stop();
        handle.abort();
        let calls = api.calls();
        assert_eq!(calls.len(), 3);
        assert!(calls.iter().all(|(m, _)| m == "messages.getLongPollServer"));
        assert_eq!(channel.cursor().as_deref(), Some("3"));
    }

    #[tokio::test]
    async fn history_loss_keeps_the_key_and_moves_the_cursor() {
        let server = MockServer::start_async().await;
        let lost = server.mock(|when, then| {
            when.method(GET).path("/lp").query_param("ts", "1");
            then.status(200).json_body(json!({ "failed": 1, "ts": 9 }));
        });
        let resumed = server.mock(|when, then| {
            when.method(GET)
                .path("/lp")
                .query_param("key", "k1")
                .query_param("ts", "9");
            then.status(200).json_body(json!({
                "ts": 10,
                "updates": [[4, 2, 33, 9, 0, "", "after gap", {}]]
            }));
        });
        server.mock(|when, then| {
            when.method(GET).path("/lp").query_param("ts", "10");
            then.status(200)
                .delay(Duration::from_millis(200))
                .json_body(json!({ "ts": 10, "updates": [] }));
        });

        let api = Arc::new(ScriptedApi::new());
        api.push(Ok(session_for(&server, 1)));
        let channel = Arc::new(
            LongPollChannel::new(100, api.clone()).with_retry_delay(Duration::from_millis(10)),
        );
        let (tx, mut rx) = mpsc::channel(8);
        let handle = channel.clone().start_inbound(tx);

        let msg = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("message in time")
            .expect("stream open");
        assert_eq!(msg.body, "after gap");
        channel.stop();
        handle.abort();
        lost.assert_calls(1);
        resumed.assert_calls(1);
        assert_eq!(api.calls().len(), 1);
        assert_eq!(channel.cursor().as_deref(), Some("10"));
    }
}
