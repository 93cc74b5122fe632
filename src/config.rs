use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;

use crate::ingest::CommitMode;
use crate::retry::RetryPolicy;
use crate::source::{SourceId, SourceIdError};

/// Legacy variable names some deployments still set for the backend.
const URL_ALIAS: &str = "STORAGE_KV_REST_API_URL";
const TOKEN_ALIAS: &str = "STORAGE_KV_REST_API_TOKEN";

pub const DEFAULT_MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Webhook event receiver with per-source bounded logs")]
pub struct Args {
    /// Address to bind the HTTP server to
    #[arg(long, env = "WEBHOOK_LOG_ADDR", default_value = "0.0.0.0:3000")]
    pub addr: SocketAddr,

    /// Base URL of the Redis REST backend
    #[arg(long, env = "KV_REST_API_URL")]
    pub kv_url: Option<String>,

    /// Access token for the Redis REST backend
    #[arg(long, env = "KV_REST_API_TOKEN", hide_env_values = true)]
    pub kv_token: Option<String>,

    /// Source used by the bare /webhook route
    #[arg(long, env = "WEBHOOK_LOG_DEFAULT_SOURCE", default_value = "default")]
    pub default_source: String,

    /// Commit deliveries before answering (inline) or after (background)
    #[arg(long, env = "WEBHOOK_LOG_COMMIT_MODE", value_enum, default_value_t = CommitMode::Inline)]
    pub commit_mode: CommitMode,

    /// Attempts per backend write on transient failures
    #[arg(long, env = "WEBHOOK_LOG_RETRY_ATTEMPTS", default_value_t = 3)]
    pub retry_attempts: u32,

    /// Backoff before the first retry, doubled on each further retry
    #[arg(long, env = "WEBHOOK_LOG_RETRY_BACKOFF_MS", default_value_t = 100)]
    pub retry_backoff_ms: u64,

    /// Timeout for a single backend request
    #[arg(long, env = "WEBHOOK_LOG_KV_TIMEOUT_MS", default_value_t = 5000)]
    pub kv_timeout_ms: u64,

    /// Largest delivery body read; bigger ones are acknowledged unstored
    #[arg(long, env = "WEBHOOK_LOG_MAX_BODY_BYTES", default_value_t = DEFAULT_MAX_BODY_BYTES)]
    pub max_body_bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    pub url: String,
    pub token: String,
}

/// Process configuration, resolved once at startup and passed to handlers.
#[derive(Debug, Clone)]
pub struct Config {
    pub addr: SocketAddr,
    /// `None` when the URL or the token is missing; deliveries are then
    /// acknowledged without being stored.
    pub backend: Option<BackendConfig>,
    pub default_source: String,
    pub commit_mode: CommitMode,
    pub retry_attempts: u32,
    pub retry_backoff: Duration,
    pub kv_timeout: Duration,
    pub max_body_bytes: usize,
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl Config {
    /// Parse the command line and the process environment.
    pub fn load() -> Result<Self, SourceIdError> {
        Self::resolve(Args::parse(), |name| std::env::var(name).ok())
    }

    /// Precedence: flag, then primary variable (both handled by clap), then
    /// the legacy alias looked up through `env`.
    pub fn resolve(
        args: Args,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, SourceIdError> {
        let url = non_blank(args.kv_url).or_else(|| non_blank(env(URL_ALIAS)));
        let token = non_blank(args.kv_token).or_else(|| non_blank(env(TOKEN_ALIAS)));
        let backend = match (url, token) {
            (Some(url), Some(token)) => Some(BackendConfig {
                url: url.trim_end_matches('/').to_string(),
                token,
            }),
            _ => None,
        };

        let default_source = SourceId::parse(&args.default_source)?.as_str().to_string();

        Ok(Self {
            addr: args.addr,
            backend,
            default_source,
            commit_mode: args.commit_mode,
            retry_attempts: args.retry_attempts,
            retry_backoff: Duration::from_millis(args.retry_backoff_ms),
            kv_timeout: Duration::from_millis(args.kv_timeout_ms),
            max_body_bytes: args.max_body_bytes,
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_attempts,
            base_backoff: self.retry_backoff,
            ..RetryPolicy::default()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            backend: None,
            default_source: "default".to_string(),
            commit_mode: CommitMode::Inline,
            retry_attempts: 3,
            retry_backoff: Duration::from_millis(100),
            kv_timeout: Duration::from_millis(5000),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["webhook-log"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn flags_win_over_legacy_aliases() {
        let config = Config::resolve(
            args(&["--kv-url", "https://primary.example/", "--kv-token", "t1"]),
            env_of(&[(URL_ALIAS, "https://alias.example"), (TOKEN_ALIAS, "t2")]),
        )
        .unwrap();
        assert_eq!(
            config.backend,
            Some(BackendConfig {
                url: "https://primary.example".into(),
                token: "t1".into(),
            })
        );
    }

    #[test]
    fn legacy_aliases_fill_in_missing_values() {
        let config = Config::resolve(
            args(&["--kv-token", "t1"]),
            env_of(&[(URL_ALIAS, "  https://alias.example/  ")]),
        )
        .unwrap();
        let backend = config.backend.unwrap();
        assert_eq!(backend.url, "https://alias.example");
        assert_eq!(backend.token, "t1");
    }

    #[test]
    fn backend_needs_both_url_and_token() {
        let config = Config::resolve(
            args(&["--kv-url", "https://x.example", "--kv-token", "  "]),
            env_of(&[]),
        )
        .unwrap();
        assert!(config.backend.is_none());
    }

    #[test]
    fn default_source_is_canonicalized() {
        let config = Config::resolve(args(&["--default-source", "/zalo/"]), env_of(&[])).unwrap();
        assert_eq!(config.default_source, "zalo");
        assert!(Config::resolve(args(&["--default-source", "endpoints"]), env_of(&[])).is_err());
    }

    #[test]
    fn retry_policy_follows_config() {
        let config = Config::resolve(
            args(&["--retry-attempts", "5", "--retry-backoff-ms", "20", "--commit-mode", "background"]),
            env_of(&[]),
        )
        .unwrap();
        let policy = config.retry_policy();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.base_backoff, Duration::from_millis(20));
        assert_eq!(config.commit_mode, CommitMode::Background);
        assert_eq!(config.max_body_bytes, DEFAULT_MAX_BODY_BYTES);
    }
}
