//! Control-plane HTTP surface: agent token fetch/refresh and artifact
//! retrieval. The socket transport lives in [`crate::transport`].

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ControlPlaneError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("control plane returned status {status} for {endpoint}")]
    Status { status: u16, endpoint: String },

    #[error("token management is delegated to an external proxy")]
    DelegatedToProxy,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
}

/// Authenticated client for the control plane's HTTP endpoints.
#[derive(Debug)]
pub struct ControlPlaneClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    /// Set when `HTTP_PROXY_FOR_AGENT` delegates token management; every
    /// token operation short-circuits.
    delegated_to_proxy: bool,
    exec_user: Option<String>,
    agent_token: tokio::sync::RwLock<Option<String>>,
}

impl ControlPlaneClient {
    pub fn new(
        ws_api_url: &str,
        api_key: String,
        delegated_to_proxy: bool,
        exec_user: Option<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            base_url: http_base_url(ws_api_url),
            api_key,
            delegated_to_proxy,
            exec_user,
            agent_token: tokio::sync::RwLock::new(None),
        }
    }

    /// A client with no reachable backend; used where only the cached-token
    /// plumbing matters.
    pub fn disconnected() -> Self {
        Self::new("ws://127.0.0.1:0", String::new(), true, None)
    }

    pub fn token_delegated_to_proxy(&self) -> bool {
        self.delegated_to_proxy
    }

    pub async fn cached_agent_token(&self) -> Option<String> {
        self.agent_token.read().await.clone()
    }

    /// Fetch a fresh agent token and cache it for subsequent invocations.
    pub async fn refresh_agent_token(&self) -> Result<(), ControlPlaneError> {
        if self.delegated_to_proxy {
            return Err(ControlPlaneError::DelegatedToProxy);
        }
        let endpoint = format!("{}/api/agent/token", self.base_url);
        let response = self
            .http
            .get(&endpoint)
            .header("X-API-KEY", &self.api_key)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ControlPlaneError::Status {
                status: response.status().as_u16(),
                endpoint,
            });
        }

        let body: TokenResponse = response.json().await?;
        *self.agent_token.write().await = Some(body.token);
        info!("agent token refreshed");
        Ok(())
    }

    /// Download a deployment artifact by name.
    pub async fn fetch_artifact(&self, name: &str) -> Result<Vec<u8>, ControlPlaneError> {
        let endpoint = format!("{}/api/artifacts/{name}", self.base_url);
        let response = self
            .http
            .get(&endpoint)
            .header("X-API-KEY", &self.api_key)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ControlPlaneError::Status {
                status: response.status().as_u16(),
                endpoint,
            });
        }

        let bytes = response.bytes().await?;
        debug!(artifact = name, size = bytes.len(), "fetched artifact");
        Ok(bytes.to_vec())
    }

    /// Where artifacts land: `/home/<EXEC_USER>` when the override is set,
    /// otherwise the current user's home.
    pub fn artifact_target_dir(&self) -> PathBuf {
        match &self.exec_user {
            Some(user) => PathBuf::from("/home").join(user),
            None => dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")),
        }
    }
}

/// Map the socket URL onto the HTTP base for the same host.
fn http_base_url(ws_api_url: &str) -> String {
    let stripped = ws_api_url.trim_end_matches('/');
    if let Some(rest) = stripped.strip_prefix("wss://") {
        format!("https://{rest}")
    } else if let Some(rest) = stripped.strip_prefix("ws://") {
        format!("http://{rest}")
    } else {
        stripped.to_string()
    }
}
