//! Telegram Bot API gateway — message and media delivery.

use async_trait::async_trait;
use serde::Deserialize;
use telecast_core::config::TelegramConfig;
use telecast_core::traits::MessagingGateway;
use telecast_core::types::{MediaKind, MessageContent, SendError, SendReceipt};

/// Telegram delivery gateway.
pub struct TelegramGateway {
    config: TelegramConfig,
    client: reqwest::Client,
}

impl TelegramGateway {
    pub fn new(config: TelegramConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn api_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{}",
            self.config.api_base, self.config.bot_token, method
        )
    }

    /// POST one Bot API method and unwrap the response envelope.
    async fn call(
        &self,
        method: &str,
        body: serde_json::Value,
    ) -> Result<SentMessage, SendError> {
        let response = self
            .client
            .post(self.api_url(method))
            .json(&body)
            .send()
            .await
            .map_err(|e| SendError::transient(format!("{method} failed: {e}")))?;

        let envelope: TelegramApiResponse<SentMessage> = response
            .json()
            .await
            .map_err(|e| SendError::transient(format!("Invalid {method} response: {e}")))?;

        if !envelope.ok {
            let err = classify_api_error(
                envelope.error_code,
                envelope.description.as_deref().unwrap_or("unknown error"),
            );
            tracing::debug!("{method} rejected: {err}");
            return Err(err);
        }
        envelope
            .result
            .ok_or_else(|| SendError::transient(format!("Empty {method} result")))
    }

    async fn send_text(&self, chat_id: &str, text: &str) -> Result<SentMessage, SendError> {
        self.call(
            "sendMessage",
            serde_json::json!({
                "chat_id": chat_id,
                "text": text,
            }),
        )
        .await
    }

    async fn send_media(
        &self,
        chat_id: &str,
        kind: MediaKind,
        locator: &str,
        caption: Option<&str>,
    ) -> Result<SentMessage, SendError> {
        let (method, field) = match kind {
            MediaKind::Photo => ("sendPhoto", "photo"),
            MediaKind::Video => ("sendVideo", "video"),
        };
        let mut body = serde_json::json!({
            "chat_id": chat_id,
            field: locator,
        });
        if let Some(caption) = caption {
            body["caption"] = serde_json::Value::String(caption.to_string());
        }
        self.call(method, body).await
    }
}

#[async_trait]
impl MessagingGateway for TelegramGateway {
    fn name(&self) -> &str {
        "telegram"
    }

    /// Deliver text plus ordered media to one chat.
    ///
    /// A single attachment rides as a captioned media message; otherwise the
    /// text goes first and each attachment follows. The receipt carries the
    /// first platform message id. A failure after the first successful call
    /// is terminal for the triple — retrying would duplicate what already
    /// went out.
    async fn send(
        &self,
        channel_handle: &str,
        content: &MessageContent,
    ) -> Result<SendReceipt, SendError> {
        let first = match content.media.as_slice() {
            [] => self.send_text(channel_handle, &content.text).await?,
            [only] => {
                let caption = (!content.text.trim().is_empty()).then_some(content.text.as_str());
                self.send_media(channel_handle, only.kind, &only.locator, caption)
                    .await?
            }
            [head, rest @ ..] => {
                let first = if content.text.trim().is_empty() {
                    self.send_media(channel_handle, head.kind, &head.locator, None)
                        .await?
                } else {
                    let first = self.send_text(channel_handle, &content.text).await?;
                    self.follow_up(channel_handle, head, first.message_id)
                        .await?;
                    first
                };
                for item in rest {
                    self.follow_up(channel_handle, item, first.message_id).await?;
                }
                first
            }
        };
        Ok(SendReceipt {
            external_ref: first.message_id.to_string(),
        })
    }
}

impl TelegramGateway {
    /// Send a trailing attachment; failures after a successful first call
    /// must not be retried, so they are forced terminal.
    async fn follow_up(
        &self,
        chat_id: &str,
        item: &telecast_core::types::MediaItem,
        first_ref: i64,
    ) -> Result<(), SendError> {
        self.send_media(chat_id, item.kind, &item.locator, None)
            .await
            .map_err(|e| {
                SendError::terminal(format!(
                    "partial delivery (first message {first_ref} sent): {}",
                    e.message
                ))
            })?;
        Ok(())
    }
}

/// Map a Bot API error to the worker's retry classification.
fn classify_api_error(error_code: Option<i64>, description: &str) -> SendError {
    match error_code {
        // Rate limited: back off and retry.
        Some(429) => SendError::transient(format!("Telegram 429: {description}")),
        // Server-side trouble: retry.
        Some(code) if code >= 500 => {
            SendError::transient(format!("Telegram {code}: {description}"))
        }
        // Bad request, bot blocked, chat not found: retrying cannot help.
        Some(code) => SendError::terminal(format!("Telegram {code}: {description}")),
        None => SendError::terminal(format!("Telegram error: {description}")),
    }
}

// --- Telegram API Types ---

#[derive(Debug, Deserialize)]
pub struct TelegramApiResponse<T> {
    pub ok: bool,
    pub result: Option<T>,
    pub description: Option<String>,
    pub error_code: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SentMessage {
    pub message_id: i64,
}
