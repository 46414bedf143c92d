//! VK-style HTTP client: `POST <apiBase>/method/<name>` with form params, plus the
//! OAuth password grant used to turn configured logins into access tokens.

use super::{param_to_string, ApiError, Challenge, Params, PlatformApi};
use crate::config::PlatformConfig;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

const DEFAULT_API_BASE: &str = "https://api.vk.com";

/// Client for the platform's method API, bound to one access token.
#[derive(Clone)]
pub struct VkApiClient {
    base_url: String,
    version: String,
    access_token: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct MethodResponse {
    #[serde(default)]
    response: Option<Value>,
    #[serde(default)]
    error: Option<MethodError>,
}

#[derive(Debug, Deserialize)]
struct MethodError {
    error_code: i64,
    #[serde(default)]
    error_msg: String,
    #[serde(default)]
    captcha_sid: Option<Value>,
    #[serde(default)]
    captcha_img: Option<String>,
}

impl From<MethodError> for ApiError {
    fn from(e: MethodError) -> Self {
        let challenge = e.captcha_sid.as_ref().map(|sid| Challenge {
            sid: param_to_string(sid),
            image_url: e.captcha_img.clone(),
        });
        ApiError::Platform {
            code: e.error_code,
            message: e.error_msg,
            challenge,
        }
    }
}

impl VkApiClient {
    pub fn new(base_url: Option<String>, version: &str, access_token: impl Into<String>) -> Self {
        let base_url = base_url
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string());
        Self {
            base_url,
            version: version.to_string(),
            access_token: access_token.into(),
            client: reqwest::Client::new(),
        }
    }

    /// Client configured from the `platform` config section.
    pub fn from_config(platform: &PlatformConfig, access_token: impl Into<String>) -> Self {
        Self::new(
            Some(platform.api_base.clone()),
            &platform.api_version,
            access_token,
        )
    }
}

#[async_trait]
impl PlatformApi for VkApiClient {
    async fn call(&self, method: &str, params: Params) -> Result<Value, ApiError> {
        let url = format!("{}/method/{}", self.base_url, method);
        let mut form: Vec<(String, String)> = params
            .iter()
            .map(|(k, v)| (k.clone(), param_to_string(v)))
            .collect();
        form.push(("access_token".to_string(), self.access_token.clone()));
        form.push(("v".to_string(), self.version.clone()));

        let res = self.client.post(&url).form(&form).send().await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(ApiError::Decode(format!("{} {}: {}", method, status, body)));
        }
        let data: MethodResponse = res.json().await?;
        match (data.response, data.error) {
            (_, Some(err)) => Err(err.into()),
            (Some(response), None) => Ok(response),
            (None, None) => Err(ApiError::Decode(format!(
                "{}: neither response nor error present",
                method
            ))),
        }
    }
}

/// How an agent proves its identity to the platform.
#[derive(Debug, Clone)]
pub enum Credentials {
    /// Ready-made access token; the id is looked up when not given.
    Token { token: String, id: Option<i64> },
    /// Login and password exchanged for a token via the password grant.
    Password { login: String, password: String },
}

/// Authenticated agent identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub id: i64,
    pub token: String,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("auth request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("auth rejected: {0}")]
    Rejected(String),
    #[error("password grant needs platform.clientId and platform.clientSecret")]
    MissingClient,
    #[error("resolving agent id: {0}")]
    Api(#[from] ApiError),
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    user_id: Option<i64>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

/// Resolve credentials into an `Identity` (id + access token).
pub async fn authenticate(
    platform: &PlatformConfig,
    credentials: &Credentials,
) -> Result<Identity, AuthError> {
    match credentials {
        Credentials::Token { token, id: Some(id) } => Ok(Identity {
            id: *id,
            token: token.clone(),
        }),
        Credentials::Token { token, id: None } => {
            let api = VkApiClient::from_config(platform, token.clone());
            let users = api.call("users.get", Params::new()).await?;
            let id = users
                .get(0)
                .and_then(|u| u.get("id"))
                .and_then(|v| v.as_i64())
                .ok_or_else(|| AuthError::Rejected("users.get returned no id".to_string()))?;
            Ok(Identity {
                id,
                token: token.clone(),
            })
        }
        Credentials::Password { login, password } => {
            password_grant(platform, login, password).await
        }
    }
}

async fn password_grant(
    platform: &PlatformConfig,
    login: &str,
    password: &str,
) -> Result<Identity, AuthError> {
    let (Some(client_id), Some(client_secret)) = (
        platform.client_id.as_deref(),
        platform.client_secret.as_deref(),
    ) else {
        return Err(AuthError::MissingClient);
    };
    let url = format!("{}/token", platform.oauth_base.trim_end_matches('/'));
    let res = reqwest::Client::new()
        .get(&url)
        .query(&[
            ("grant_type", "password"),
            ("client_id", client_id),
            ("client_secret", client_secret),
            ("username", login),
            ("password", password),
            ("v", platform.api_version.as_str()),
        ])
        .send()
        .await?;
    let data: TokenResponse = res.json().await?;
    match (data.access_token, data.user_id) {
        (Some(token), Some(id)) => {
            log::info!("agent id{} was successfully authorized", id);
            Ok(Identity { id, token })
        }
        _ => Err(AuthError::Rejected(
            data.error_description
                .or(data.error)
                .unwrap_or_else(|| "no access_token in response".to_string()),
        )),
    }
}
