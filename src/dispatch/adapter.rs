use crate::config::{resolve_secret, MessagingConfig, MessagingKind};
use crate::feed::retry::{classify_status, StatusClass};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("send to {handle} failed: {detail}")]
pub struct SendError {
    pub handle: String,
    pub detail: String,
    /// A later attempt may succeed.
    pub retryable: bool,
}

/// Outbound delivery of one rendered message to one handle.
#[async_trait]
pub trait MessagingAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// L_MAX for this destination, in characters.
    fn max_message_len(&self) -> usize;

    async fn send(&self, handle: &str, text: &str) -> Result<(), SendError>;
}

pub type SharedAdapter = Arc<dyn MessagingAdapter>;

pub fn build_adapter(config: &MessagingConfig) -> Result<SharedAdapter> {
    Ok(match config.kind {
        MessagingKind::Log => Arc::new(LogAdapter::new(config.max_message_len)),
        MessagingKind::Telegram => {
            let raw = config
                .bot_token
                .as_deref()
                .context("messaging.bot_token is required for the telegram adapter")?;
            let token = resolve_secret(raw)?;
            Arc::new(TelegramAdapter::new(config, token)?)
        }
    })
}

// ── Telegram ─────────────────────────────────────────────────────────

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
    parse_mode: &'static str,
    disable_web_page_preview: bool,
}

pub struct TelegramAdapter {
    client: Client,
    endpoint: String,
    max_len: usize,
}

impl TelegramAdapter {
    pub fn new(config: &MessagingConfig, token: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds.max(1)))
            .build()
            .context("failed to build telegram HTTP client")?;
        Ok(Self {
            client,
            endpoint: format!(
                "{}/bot{}/sendMessage",
                config.api_base.trim_end_matches('/'),
                token
            ),
            max_len: config.max_message_len,
        })
    }
}

#[async_trait]
impl MessagingAdapter for TelegramAdapter {
    fn name(&self) -> &str {
        "telegram"
    }

    fn max_message_len(&self) -> usize {
        self.max_len
    }

    async fn send(&self, handle: &str, text: &str) -> Result<(), SendError> {
        let body = SendMessage {
            chat_id: handle,
            text,
            parse_mode: "HTML",
            disable_web_page_preview: true,
        };
        let fail = |detail: String, retryable: bool| SendError {
            handle: handle.to_string(),
            detail,
            retryable,
        };
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| fail(e.without_url().to_string(), true))?;

        let status = resp.status().as_u16();
        match classify_status(status) {
            StatusClass::Success => Ok(()),
            class => {
                let text = resp.text().await.unwrap_or_default();
                let retryable = matches!(class, StatusClass::RateLimited | StatusClass::ServerError);
                Err(fail(format!("telegram returned {status}: {text}"), retryable))
            }
        }
    }
}

// ── Log (dry run) ────────────────────────────────────────────────────

/// Writes messages to the log instead of delivering them.
pub struct LogAdapter {
    max_len: usize,
}

impl LogAdapter {
    pub fn new(max_len: usize) -> Self {
        Self { max_len }
    }
}

#[async_trait]
impl MessagingAdapter for LogAdapter {
    fn name(&self) -> &str {
        "log"
    }

    fn max_message_len(&self) -> usize {
        self.max_len
    }

    async fn send(&self, handle: &str, text: &str) -> Result<(), SendError> {
        tracing::info!(handle, chars = text.chars().count(), "message (dry run)\n{text}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_log_adapter_by_default() {
        let adapter = build_adapter(&MessagingConfig::default()).unwrap();
        assert_eq!(adapter.name(), "log");
        assert_eq!(adapter.max_message_len(), 4096);
    }

    #[test]
    fn test_telegram_requires_token() {
        let config = MessagingConfig {
            kind: MessagingKind::Telegram,
            ..MessagingConfig::default()
        };
        assert!(build_adapter(&config).is_err());
    }

    #[test]
    fn test_telegram_endpoint() {
        let config = MessagingConfig {
            kind: MessagingKind::Telegram,
            bot_token: Some("123:abc".into()),
            api_base: "https://api.telegram.org/".into(),
            ..MessagingConfig::default()
        };
        let adapter = TelegramAdapter::new(&config, "123:abc".into()).unwrap();
        assert_eq!(adapter.endpoint, "https://api.telegram.org/bot123:abc/sendMessage");
    }

    #[tokio::test]
    async fn test_log_adapter_always_succeeds() {
        let adapter = LogAdapter::new(10);
        assert!(adapter.send("chat", "hello").await.is_ok());
    }
}
