use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

use super::{KeyType, KvBackend};
use crate::error::StoreError;

/// Redis-over-HTTP client speaking the Upstash REST protocol: a command is a
/// JSON array POSTed to the base URL, transactions go to `/multi-exec`.
///
/// Built once at startup; the inner `reqwest::Client` pools connections and is
/// shared by every request handler.
pub struct RestBackend {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct Reply {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<String>,
}

impl Reply {
    fn into_result(self, key: &str) -> Result<Value, StoreError> {
        match self.error {
            Some(message) => Err(StoreError::from_reply(key, message)),
            None => Ok(self.result),
        }
    }
}

impl RestBackend {
    pub fn new(base_url: &str, token: &str, timeout: Duration) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(16)
            .build()
            .map_err(|e| StoreError::BackendUnavailable {
                message: format!("failed to build HTTP client: {e}"),
                transient: false,
            })?;
        Ok(Self {
            client,
            base_url: base_url.trim().trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn send<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        body: &impl serde::Serialize,
    ) -> Result<T, StoreError> {
        let resp = self
            .client
            .post(url)
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await
            .map_err(|e| StoreError::unavailable(format!("request failed: {e}")))?;

        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(StoreError::BackendUnavailable {
                message: format!("backend rejected credentials ({status})"),
                transient: false,
            });
        }
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            let text = resp.text().await.unwrap_or_default();
            return Err(StoreError::unavailable(format!(
                "backend returned {status}: {text}"
            )));
        }

        // Command errors come back as 4xx with an `error` field, so the body
        // is decoded whatever the status.
        resp.json::<T>()
            .await
            .map_err(|e| StoreError::decode(format!("{status}: {e}")))
    }

    async fn command(&self, key: &str, args: &[&str]) -> Result<Value, StoreError> {
        let reply: Reply = self.send(&self.base_url, &args).await?;
        reply.into_result(key)
    }

    async fn command_with(
        &self,
        key: &str,
        head: &[&str],
        tail: &[String],
    ) -> Result<Value, StoreError> {
        let mut args: Vec<&str> = head.to_vec();
        args.extend(tail.iter().map(String::as_str));
        self.command(key, &args).await
    }

    async fn transaction(&self, key: &str, commands: &[Vec<String>]) -> Result<Vec<Value>, StoreError> {
        let url = format!("{}/multi-exec", self.base_url);
        let replies: Vec<Reply> = self.send(&url, &commands).await?;
        replies.into_iter().map(|r| r.into_result(key)).collect()
    }
}

fn as_usize(value: Value) -> Result<usize, StoreError> {
    value
        .as_u64()
        .map(|n| n as usize)
        .ok_or_else(|| StoreError::decode(format!("expected integer, got {value}")))
}

fn as_string(value: Value) -> Result<String, StoreError> {
    match value {
        Value::String(s) => Ok(s),
        other => Err(StoreError::decode(format!("expected string, got {other}"))),
    }
}

fn as_strings(value: Value) -> Result<Vec<String>, StoreError> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => items.into_iter().map(as_string).collect(),
        other => Err(StoreError::decode(format!("expected array, got {other}"))),
    }
}

#[async_trait]
impl KvBackend for RestBackend {
    async fn key_type(&self, key: &str) -> Result<KeyType, StoreError> {
        let raw = as_string(self.command(key, &["TYPE", key]).await?)?;
        Ok(KeyType::parse(&raw))
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match self.command(key, &["GET", key]).await? {
            Value::Null => Ok(None),
            other => as_string(other).map(Some),
        }
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        self.command(key, &["DEL", key]).await?;
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<bool, StoreError> {
        match self.command(from, &["RENAME", from, to]).await {
            Ok(_) => Ok(true),
            Err(StoreError::Backend { message }) if message.contains("no such key") => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn lpush_capped(
        &self,
        key: &str,
        value: &str,
        max_len: usize,
    ) -> Result<(), StoreError> {
        let stop = max_len.max(1) - 1;
        let commands = vec![
            vec!["LPUSH".to_string(), key.to_string(), value.to_string()],
            vec![
                "LTRIM".to_string(),
                key.to_string(),
                "0".to_string(),
                stop.to_string(),
            ],
        ];
        self.transaction(key, &commands).await?;
        Ok(())
    }

    async fn rpush(&self, key: &str, values: &[String]) -> Result<usize, StoreError> {
        if values.is_empty() {
            return self.llen(key).await;
        }
        as_usize(self.command_with(key, &["RPUSH", key], values).await?)
    }

    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> Result<(), StoreError> {
        let (start, stop) = (start.to_string(), stop.to_string());
        self.command(key, &["LTRIM", key, &start, &stop]).await?;
        Ok(())
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, StoreError> {
        let (start, stop) = (start.to_string(), stop.to_string());
        as_strings(self.command(key, &["LRANGE", key, &start, &stop]).await?)
    }

    async fn llen(&self, key: &str) -> Result<usize, StoreError> {
        as_usize(self.command(key, &["LLEN", key]).await?)
    }

    async fn sadd(&self, key: &str, members: &[String]) -> Result<usize, StoreError> {
        if members.is_empty() {
            return Ok(0);
        }
        as_usize(self.command_with(key, &["SADD", key], members).await?)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        as_strings(self.command(key, &["SMEMBERS", key]).await?)
    }

    async fn srem(&self, key: &str, members: &[String]) -> Result<usize, StoreError> {
        if members.is_empty() {
            return Ok(0);
        }
        as_usize(self.command_with(key, &["SREM", key], members).await?)
    }
}
