use config::{Config, Environment};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default control-plane socket endpoint, overridable through `WS_API_URL`.
pub const DEFAULT_WS_API_URL: &str = "wss://api.dockhand.dev/agent/socket";

/// Errors that make startup impossible. These are the only configuration
/// failures that terminate the process (exit code 1).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingEnv(&'static str),

    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },

    #[error("configuration error: {0}")]
    Source(#[from] config::ConfigError),
}

/// Runtime settings resolved from the environment.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Control-plane credential, sent as `X-API-KEY` on every handshake.
    pub api_key: String,
    /// Socket endpoint of the control plane.
    pub ws_api_url: String,
    /// Handshake disambiguation override; required in NoRepoMode.
    pub agent_alias: Option<String>,
    /// Size of the blocking worker pool (per-job drain tasks).
    pub max_concurrency: usize,
    /// Number of preallocated ready worktrees.
    pub worktree_pool_size: usize,
    /// When set, token management is delegated to an external proxy and the
    /// internal token fetch/refresh cycle is skipped entirely.
    pub http_proxy_for_agent: Option<String>,
    /// Artifact deployment targets `/home/<user>` instead of the current
    /// user's home when set.
    pub exec_user: Option<String>,
}

/// Raw deserialization target; validation happens in [`Settings::load`].
#[derive(Debug, Deserialize)]
struct RawSettings {
    api_key: Option<String>,
    ws_api_url: Option<String>,
    agent_alias: Option<String>,
    max_concurrency: Option<i64>,
    worktree_pool_size: Option<i64>,
    http_proxy_for_agent: Option<String>,
    exec_user: Option<String>,
}

impl Settings {
    /// Resolve settings from the process environment.
    ///
    /// Precedence is environment over defaults; `.env` loading (if any) must
    /// happen before this is called.
    pub fn load() -> Result<Self, ConfigError> {
        let raw: RawSettings = Config::builder()
            .add_source(Environment::default().try_parsing(true))
            .build()?
            .try_deserialize()?;

        Self::from_raw(raw)
    }

    fn from_raw(raw: RawSettings) -> Result<Self, ConfigError> {
        let api_key = raw
            .api_key
            .filter(|k| !k.is_empty())
            .ok_or(ConfigError::MissingEnv("API_KEY"))?;

        let max_concurrency = positive_or_default(raw.max_concurrency, 1, "MAX_CONCURRENCY")?;
        let worktree_pool_size =
            positive_or_default(raw.worktree_pool_size, max_concurrency, "WORKTREE_POOL_SIZE")?;

        Ok(Self {
            api_key,
            ws_api_url: raw
                .ws_api_url
                .filter(|u| !u.is_empty())
                .unwrap_or_else(|| DEFAULT_WS_API_URL.to_string()),
            agent_alias: raw.agent_alias.filter(|a| !a.is_empty()),
            max_concurrency,
            worktree_pool_size,
            http_proxy_for_agent: raw.http_proxy_for_agent.filter(|p| !p.is_empty()),
            exec_user: raw.exec_user.filter(|u| !u.is_empty()),
        })
    }
}

fn positive_or_default(
    value: Option<i64>,
    default: usize,
    name: &'static str,
) -> Result<usize, ConfigError> {
    match value {
        None => Ok(default),
        Some(v) if v >= 1 => Ok(v as usize),
        Some(v) => Err(ConfigError::Invalid {
            name,
            reason: format!("expected a positive integer, got {v}"),
        }),
    }
}

/// Load `.env` from the working directory if present.
pub fn load_env_file() -> anyhow::Result<()> {
    if Path::new(".env").exists() {
        dotenvy::dotenv()?;
        tracing::info!("Loaded environment variables from .env file");
    }
    Ok(())
}

/// Path of the persisted state document (`state.json`).
pub fn state_file_path() -> PathBuf {
    config_dir().join("state.json")
}

/// Per-user configuration directory for this daemon.
pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("dockhand")
}

/// Per-user data directory; worktree storage lives below this.
pub fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("dockhand")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw() -> RawSettings {
        RawSettings {
            api_key: Some("key".to_string()),
            ws_api_url: None,
            agent_alias: None,
            max_concurrency: None,
            worktree_pool_size: None,
            http_proxy_for_agent: None,
            exec_user: None,
        }
    }

    #[test]
    fn missing_api_key_is_fatal() {
        let mut r = raw();
        r.api_key = None;
        assert!(matches!(
            Settings::from_raw(r),
            Err(ConfigError::MissingEnv("API_KEY"))
        ));
    }

    #[test]
    fn defaults_apply() {
        let settings = Settings::from_raw(raw()).unwrap();
        assert_eq!(settings.ws_api_url, DEFAULT_WS_API_URL);
        assert_eq!(settings.max_concurrency, 1);
        assert_eq!(settings.worktree_pool_size, 1);
    }

    #[test]
    fn pool_size_defaults_to_max_concurrency() {
        let mut r = raw();
        r.max_concurrency = Some(4);
        let settings = Settings::from_raw(r).unwrap();
        assert_eq!(settings.worktree_pool_size, 4);
    }

    #[test]
    fn zero_pool_size_is_rejected() {
        let mut r = raw();
        r.worktree_pool_size = Some(0);
        assert!(matches!(
            Settings::from_raw(r),
            Err(ConfigError::Invalid { name: "WORKTREE_POOL_SIZE", .. })
        ));
    }

    #[test]
    fn negative_concurrency_is_rejected() {
        let mut r = raw();
        r.max_concurrency = Some(-2);
        assert!(Settings::from_raw(r).is_err());
    }
}
