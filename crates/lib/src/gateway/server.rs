//! Gateway host: authenticates and runs the configured agents and serves the
//! admin HTTP API on a single port.

use crate::agent::{Agent, AgentSettings};
use crate::api::{authenticate, VkApiClient};
use crate::config::{self, Config};
use crate::events::BuiltinHandlers;
use crate::gateway::auth::verify_operator;
use crate::gateway::protocol::{
    AgentStatus, ApiReply, ImageQuery, SendQuery, ACCESS_DENIED, INTERNAL_ERROR, INVALID_PARAM,
    MISSED_PARAM,
};
use crate::init;
use crate::verify::{ChallengeStore, MemoryChallengeStore, RedisChallengeStore, VerificationCoordinator};
use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::{Query, State},
    http::header,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

/// Shared state for the admin routes.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<Config>,
    pub coordinator: Arc<VerificationCoordinator>,
    pub agents: Arc<Vec<Arc<Agent>>>,
    /// HMAC key for `verify.send`. When None, every submission is refused.
    pub app_secret: Option<String>,
    pub http: reqwest::Client,
    /// RFC 3339 start time, reported by `GET /`.
    pub started_at: String,
}

impl GatewayState {
    pub fn new(
        config: Arc<Config>,
        coordinator: Arc<VerificationCoordinator>,
        agents: Vec<Arc<Agent>>,
    ) -> Self {
        let app_secret = config::resolve_app_secret(&config);
        Self {
            config,
            coordinator,
            agents: Arc::new(agents),
            app_secret,
            http: reqwest::Client::new(),
            started_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Admin API routes.
pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/", get(health_http))
        .route("/api/verify.getAll", get(verify_get_all))
        .route("/api/verify.image", get(verify_image))
        .route("/api/verify.send", get(verify_send))
        .with_state(state)
}

/// Redis when configured, otherwise an in-process store.
pub async fn open_store(config: &Config) -> Result<Arc<dyn ChallengeStore>> {
    match config::resolve_redis_url(config) {
        Some(url) => {
            let store = RedisChallengeStore::connect(&url)
                .await
                .with_context(|| format!("connecting to challenge store {}", url))?;
            log::info!("challenge store: redis");
            Ok(Arc::new(store))
        }
        None => {
            log::warn!("no store.redisUrl configured; challenges can only be solved through this process");
            Ok(Arc::new(MemoryChallengeStore::new()))
        }
    }
}

/// The configured redis store, for commands that act on challenges owned by
/// another process. Fails when no redis URL is configured, since an
/// in-process store would see no challenges and reach no waiting agent.
pub async fn open_shared_store(config: &Config) -> Result<Arc<dyn ChallengeStore>> {
    let Some(url) = config::resolve_redis_url(config) else {
        anyhow::bail!(
            "no shared challenge store configured (set store.redisUrl or PARLEY_REDIS_URL)"
        );
    };
    let store = RedisChallengeStore::connect(&url)
        .await
        .with_context(|| format!("connecting to challenge store {}", url))?;
    Ok(Arc::new(store))
}

/// Authenticate every configured agent and start it. Agents that fail to
/// authenticate are logged and skipped.
pub async fn start_agents(
    config: &Config,
    coordinator: Arc<VerificationCoordinator>,
) -> Result<Vec<Arc<Agent>>> {
    let mut identities = Vec::new();
    for entry in &config.agents {
        let pattern = config::resolve_pattern(config, entry)?;
        let credentials = entry.credentials()?;
        match authenticate(&config.platform, &credentials).await {
            Ok(identity) => identities.push((identity, pattern)),
            Err(e) => log::error!("agent authorization failed: {}", e),
        }
    }

    let managed: Arc<BTreeSet<i64>> = Arc::new(identities.iter().map(|(i, _)| i.id).collect());
    let handlers = Arc::new(BuiltinHandlers::new(config.runtime.greeting.clone()));
    let settings = AgentSettings::from_config(config);
    let agents: Vec<Arc<Agent>> = identities
        .into_iter()
        .map(|(identity, pattern)| {
            let api = Arc::new(VkApiClient::from_config(&config.platform, identity.token));
            Arc::new(Agent::new(
                identity.id,
                api,
                coordinator.clone(),
                pattern,
                handlers.clone(),
                managed.clone(),
                settings.clone(),
            ))
        })
        .collect();
    for agent in &agents {
        agent.start();
    }
    log::info!("{} agent(s) running", agents.len());
    Ok(agents)
}

/// Run the gateway: challenge store, coordinator, agents and the admin API.
/// Blocks until shutdown (e.g. Ctrl+C).
/// Requires the config file to exist (`parley init`).
pub async fn run_gateway(config: Config, config_path: PathBuf) -> Result<()> {
    init::require_initialized(&config_path)?;
    let bind = config.gateway.bind.trim().to_string();
    if !config::is_loopback_bind(&bind) && config::resolve_app_secret(&config).is_none() {
        anyhow::bail!(
            "refusing to bind gateway to {} without operator auth (set gateway.auth.appSecret or PARLEY_APP_SECRET)",
            bind
        );
    }

    let store = open_store(&config).await?;
    let coordinator = Arc::new(
        VerificationCoordinator::new(store).with_timeout(config.runtime.verification_timeout()),
    );
    let _subscriber = coordinator
        .start()
        .await
        .context("subscribing to solved challenges")?;

    let agents = start_agents(&config, coordinator.clone()).await?;
    let state = GatewayState::new(Arc::new(config.clone()), coordinator, agents);
    let agents = state.agents.clone();
    let app = router(state);

    let bind_addr = format!("{}:{}", bind, config.gateway.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!("gateway listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(agents))
        .await
        .context("gateway server exited")?;
    log::info!("gateway stopped");
    Ok(())
}

/// Future that completes when the process should shut down (SIGINT or SIGTERM).
/// Stops every agent's loops before the server drains.
async fn shutdown_signal(agents: Arc<Vec<Arc<Agent>>>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("shutdown signal received, stopping agents");
    for agent in agents.iter() {
        agent.stop();
    }
}

/// GET / returns runtime status (for probes and operators).
async fn health_http(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    let mut agents = Vec::with_capacity(state.agents.len());
    for agent in state.agents.iter() {
        agents.push(AgentStatus {
            id: agent.id(),
            queue_len: agent.queue().lock().await.len(),
            frozen_methods: agent.gate().frozen_methods(),
            cursor: agent.cursor(),
        });
    }
    Json(json!({
        "runtime": "running",
        "port": state.config.gateway.port,
        "startedAt": state.started_at,
        "pendingChallenges": state.coordinator.pending().len(),
        "agents": agents,
    }))
}

/// GET /api/verify.getAll lists outstanding challenges as `[[agentId, [sid, ...]], ...]`.
async fn verify_get_all(State(state): State<GatewayState>) -> Json<ApiReply> {
    match state.coordinator.get_all().await {
        Ok(all) => Json(ApiReply::ok(json!(all))),
        Err(e) => {
            log::error!("listing challenges: {}", e);
            Json(ApiReply::err(INTERNAL_ERROR))
        }
    }
}

/// GET /api/verify.image?sid= streams the platform's challenge image.
async fn verify_image(State(state): State<GatewayState>, Query(q): Query<ImageQuery>) -> Response {
    let Some(sid) = q.sid.filter(|s| !s.is_empty()) else {
        return Json(ApiReply::err(MISSED_PARAM)).into_response();
    };
    let res = match state
        .http
        .get(&state.config.platform.captcha_image_url)
        .query(&[("sid", sid.as_str()), ("s", "1")])
        .send()
        .await
        .and_then(|r| r.error_for_status())
    {
        Ok(res) => res,
        Err(e) => {
            log::warn!("fetching challenge image {}: {}", sid, e);
            return Json(ApiReply::err(INTERNAL_ERROR)).into_response();
        }
    };
    let content_type = res
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("image/jpeg")
        .to_string();
    (
        [(header::CONTENT_TYPE, content_type)],
        Body::from_stream(res.bytes_stream()),
    )
        .into_response()
}

/// GET /api/verify.send checks the operator hash, then publishes the solved value.
async fn verify_send(State(state): State<GatewayState>, Query(q): Query<SendQuery>) -> Json<ApiReply> {
    let present = |v: Option<String>| v.filter(|s| !s.trim().is_empty());
    let (Some(auth_key), Some(bot_id), Some(sid), Some(key), Some(user_id)) = (
        present(q.auth_key),
        present(q.bot_id),
        present(q.sid),
        present(q.key),
        present(q.user_id),
    ) else {
        return Json(ApiReply::err(MISSED_PARAM));
    };
    let Ok(agent_id) = bot_id.trim().parse::<i64>() else {
        return Json(ApiReply::err(INVALID_PARAM));
    };
    let Some(ref secret) = state.app_secret else {
        log::warn!("verify.send refused: no gateway.auth.appSecret configured");
        return Json(ApiReply::err(ACCESS_DENIED));
    };
    let app_id = state.config.gateway.auth.app_id.clone().unwrap_or_default();
    if let Err(e) = verify_operator(secret, &app_id, user_id.trim(), &auth_key) {
        log::info!("verify.send refused for operator {}: {}", user_id, e);
        return Json(ApiReply::err(ACCESS_DENIED));
    }
    match state.coordinator.submit(agent_id, &sid, &key).await {
        Ok(()) => {
            log::info!("operator {} solved challenge {} of agent id{}", user_id, sid, agent_id);
            Json(ApiReply::done())
        }
        Err(e) => {
            log::error!("publishing solution for {}: {}", sid, e);
            Json(ApiReply::err(INTERNAL_ERROR))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shared_store_requires_a_redis_url() {
        if std::env::var("PARLEY_REDIS_URL").is_ok() {
            return;
        }
        let config = Config::default();
        let err = match open_shared_store(&config).await {
            Ok(_) => panic!("opened a shared store without a redis url"),
            Err(e) => e,
        };
        assert!(err.to_string().contains("store.redisUrl"));
    }
}
