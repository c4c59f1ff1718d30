//! Telegram Bot API client: sendMessage and getUpdates long polling

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::{InboundMessage, MessageSink, MessageSource};
use crate::error::{EngineError, EngineResult};

const BASE_URL: &str = "https://api.telegram.org";
/// Long-poll wait; stays under the HTTP client timeout
const LONG_POLL_SECS: u64 = 5;

#[derive(Clone)]
pub struct TelegramClient {
    client: Client,
    base_url: String,
    bot_token: String,
}

#[derive(Debug, Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
    parse_mode: &'static str,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UpdatesResponse {
    ok: bool,
    description: Option<String>,
    #[serde(default)]
    result: Vec<Update>,
}

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
    message: Option<Message>,
}

#[derive(Debug, Deserialize)]
struct Message {
    chat: Chat,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Chat {
    id: i64,
}

impl From<Update> for InboundMessage {
    fn from(update: Update) -> Self {
        let (chat_id, text) = match update.message {
            Some(m) => (m.chat.id.to_string(), m.text.unwrap_or_default()),
            None => (String::new(), String::new()),
        };
        InboundMessage {
            update_id: update.update_id,
            chat_id,
            text,
        }
    }
}

fn messages_from_response(body: UpdatesResponse) -> EngineResult<Vec<InboundMessage>> {
    if !body.ok {
        return Err(EngineError::Broadcast(
            body.description
                .unwrap_or_else(|| "getUpdates failed".to_string()),
        ));
    }
    Ok(body.result.into_iter().map(InboundMessage::from).collect())
}

impl TelegramClient {
    pub fn new(bot_token: impl Into<String>) -> EngineResult<Self> {
        Self::with_base_url(BASE_URL, bot_token)
    }

    pub fn with_base_url(base_url: &str, bot_token: impl Into<String>) -> EngineResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| EngineError::Broadcast(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            bot_token: bot_token.into(),
        })
    }
}

#[async_trait]
impl MessageSink for TelegramClient {
    async fn send_message(&self, chat_id: &str, text: &str) -> EngineResult<()> {
        let url = format!("{}/bot{}/sendMessage", self.base_url, self.bot_token);
        let payload = SendMessage {
            chat_id,
            text,
            parse_mode: "Markdown",
        };

        let response = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| EngineError::Broadcast(e.without_url().to_string()))?;

        let status = response.status();
        let body: ApiResponse = response
            .json()
            .await
            .map_err(|e| EngineError::Broadcast(format!("{} ({})", e.without_url(), status)))?;

        if !body.ok {
            return Err(EngineError::Broadcast(
                body.description
                    .unwrap_or_else(|| format!("Telegram API error {}", status)),
            ));
        }

        debug!(chat_id, chars = text.len(), "Telegram message sent");
        Ok(())
    }
}

#[async_trait]
impl MessageSource for TelegramClient {
    async fn poll_messages(&self, offset: Option<i64>) -> EngineResult<Vec<InboundMessage>> {
        let url = format!("{}/bot{}/getUpdates", self.base_url, self.bot_token);
        let mut params = vec![("timeout", LONG_POLL_SECS.to_string())];
        if let Some(offset) = offset {
            params.push(("offset", offset.to_string()));
        }

        let response = self
            .client
            .get(&url)
            .query(&params)
            .send()
            .await
            .map_err(|e| EngineError::Broadcast(e.without_url().to_string()))?;

        let status = response.status();
        let body: UpdatesResponse = response
            .json()
            .await
            .map_err(|e| EngineError::Broadcast(format!("{} ({})", e.without_url(), status)))?;

        let messages = messages_from_response(body)?;
        debug!(count = messages.len(), "Telegram updates received");
        Ok(messages)
    }
}
