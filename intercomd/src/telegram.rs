//! Telegram Bot API channel — the one reference `Channel` implementation
//! shipped with this build (SPEC_FULL.md §6a).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use intercom_core::store::{NewMessage, Store, now_iso};
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::channel::{Channel, InboundMessage, OnMessage};

/// Telegram's own per-message length ceiling; the core's own batching
/// granularity is coarser than this, so outbound text is always re-chunked
/// here regardless of how it arrived.
const TELEGRAM_MAX_TEXT_CHARS: usize = 4096;
const POLL_TIMEOUT_SECS: u64 = 30;

pub struct TelegramBridge {
    client: Client,
    bot_token: Option<String>,
    store: Arc<Store>,
}

impl TelegramBridge {
    pub fn new(bot_token: Option<String>, store: Arc<Store>) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(POLL_TIMEOUT_SECS + 10))
                .build()
                .expect("reqwest client"),
            bot_token,
            store,
        }
    }

    fn api_url(&self, method: &str) -> Option<String> {
        self.bot_token
            .as_ref()
            .map(|t| format!("https://api.telegram.org/bot{t}/{method}"))
    }

    /// Long-polls `getUpdates` until `shutdown` fires, persisting each inbound
    /// message and forwarding it to `on_message`.
    pub async fn run_polling_loop(&self, on_message: OnMessage, mut shutdown: watch::Receiver<bool>) {
        if self.bot_token.is_none() {
            warn!("telegram bot token not configured, polling loop disabled");
            return;
        }

        let mut offset: i64 = 0;
        loop {
            if *shutdown.borrow() {
                break;
            }
            let updates = tokio::select! {
                res = self.get_updates(offset) => res,
                _ = shutdown.changed() => break,
            };

            match updates {
                Ok(updates) => {
                    for update in updates {
                        offset = offset.max(update.update_id + 1);
                        if let Some(msg) = update.message {
                            self.handle_incoming(msg, &on_message).await;
                        }
                    }
                }
                Err(e) => {
                    error!(err = %e, "telegram getUpdates failed, backing off");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        }
    }

    async fn get_updates(&self, offset: i64) -> anyhow::Result<Vec<TelegramUpdate>> {
        let url = self
            .api_url("getUpdates")
            .ok_or_else(|| anyhow::anyhow!("no bot token configured"))?;
        let resp: TelegramApiResponse<Vec<TelegramUpdate>> = self
            .client
            .get(&url)
            .query(&[
                ("offset", offset.to_string()),
                ("timeout", POLL_TIMEOUT_SECS.to_string()),
            ])
            .send()
            .await?
            .json()
            .await?;
        if !resp.ok {
            anyhow::bail!("telegram getUpdates returned ok=false");
        }
        Ok(resp.result.unwrap_or_default())
    }

    async fn handle_incoming(&self, msg: TelegramMessage, on_message: &OnMessage) {
        let chat_jid = format!("tg:{}", msg.chat.id);
        let text = match msg.text {
            Some(t) if !t.is_empty() => t,
            _ => return,
        };
        let sender_name = msg
            .from
            .as_ref()
            .map(|f| {
                f.username
                    .clone()
                    .unwrap_or_else(|| f.first_name.clone().unwrap_or_default())
            })
            .unwrap_or_default();
        let sender = msg
            .from
            .as_ref()
            .map(|f| f.id.to_string())
            .unwrap_or_default();
        let timestamp = now_iso();

        let is_group = msg.chat.chat_type == "group" || msg.chat.chat_type == "supergroup";
        if let Err(e) = self
            .store
            .store_chat_metadata(&chat_jid, &timestamp, None, Some("telegram"), Some(is_group))
            .await
        {
            warn!(err = %e, "failed to persist chat metadata");
        }

        let new_message = NewMessage {
            id: msg.message_id.to_string(),
            chat_jid: chat_jid.clone(),
            sender: sender.clone(),
            sender_name: sender_name.clone(),
            content: text.clone(),
            timestamp: timestamp.clone(),
            is_from_me: false,
            is_bot_message: false,
        };
        if let Err(e) = self.store.store_message(&new_message).await {
            warn!(err = %e, "failed to persist inbound message");
        }

        debug!(chat_jid = chat_jid.as_str(), "telegram message received");
        on_message(InboundMessage {
            chat_jid,
            sender,
            sender_name,
            content: text,
            timestamp,
        })
        .await;
    }
}

#[async_trait]
impl Channel for TelegramBridge {
    fn name(&self) -> &str {
        "telegram"
    }

    fn is_enabled(&self) -> bool {
        self.bot_token.is_some()
    }

    fn owns_jid(&self, jid: &str) -> bool {
        jid.starts_with("tg:")
    }

    async fn connect(&self) -> anyhow::Result<()> {
        if self.bot_token.is_none() {
            anyhow::bail!("telegram bot token not configured");
        }
        let url = self.api_url("getMe").expect("token present");
        let resp: TelegramApiResponse<serde_json::Value> =
            self.client.get(&url).send().await?.json().await?;
        if !resp.ok {
            anyhow::bail!("telegram getMe returned ok=false");
        }
        info!("telegram bridge connected");
        Ok(())
    }

    async fn disconnect(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn send_message(&self, chat_jid: &str, text: &str) -> anyhow::Result<()> {
        let url = self
            .api_url("sendMessage")
            .ok_or_else(|| anyhow::anyhow!("no bot token configured"))?;
        let chat_id = normalize_chat_id(chat_jid);
        for chunk in split_for_telegram(text) {
            let resp: TelegramApiResponse<serde_json::Value> = self
                .client
                .post(&url)
                .json(&serde_json::json!({ "chat_id": chat_id, "text": chunk }))
                .send()
                .await?
                .json()
                .await?;
            if !resp.ok {
                anyhow::bail!("telegram sendMessage returned ok=false");
            }
        }
        Ok(())
    }
}

fn normalize_chat_id(jid: &str) -> String {
    jid.strip_prefix("tg:").unwrap_or(jid).to_string()
}

/// Splits `text` into chunks no longer than Telegram's per-message limit,
/// breaking on the nearest preceding newline when possible so a chunk
/// boundary doesn't land mid-sentence.
fn split_for_telegram(text: &str) -> Vec<String> {
    if text.chars().count() <= TELEGRAM_MAX_TEXT_CHARS {
        return vec![text.to_string()];
    }
    let mut chunks = Vec::new();
    let mut remaining = text;
    while !remaining.is_empty() {
        if remaining.chars().count() <= TELEGRAM_MAX_TEXT_CHARS {
            chunks.push(remaining.to_string());
            break;
        }
        let mut split_at = byte_index_at_char(remaining, TELEGRAM_MAX_TEXT_CHARS);
        if let Some(newline_pos) = remaining[..split_at].rfind('\n') {
            if newline_pos > split_at / 2 {
                split_at = newline_pos + 1;
            }
        }
        let (head, tail) = remaining.split_at(split_at);
        chunks.push(head.to_string());
        remaining = tail;
    }
    chunks
}

fn byte_index_at_char(s: &str, char_count: usize) -> usize {
    s.char_indices()
        .nth(char_count)
        .map(|(i, _)| i)
        .unwrap_or(s.len())
}

#[derive(Debug, Deserialize)]
struct TelegramApiResponse<T> {
    ok: bool,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct TelegramUpdate {
    update_id: i64,
    message: Option<TelegramMessage>,
}

#[derive(Debug, Deserialize)]
struct TelegramMessage {
    message_id: i64,
    chat: TelegramChat,
    from: Option<TelegramUser>,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TelegramChat {
    id: i64,
    #[serde(rename = "type")]
    chat_type: String,
}

#[derive(Debug, Deserialize)]
struct TelegramUser {
    id: i64,
    username: Option<String>,
    first_name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_chat_id_strips_tg_prefix() {
        assert_eq!(normalize_chat_id("tg:-100123"), "-100123");
        assert_eq!(normalize_chat_id("user@example.com"), "user@example.com");
    }

    #[test]
    fn split_for_telegram_keeps_short_text_whole() {
        let chunks = split_for_telegram("hello");
        assert_eq!(chunks, vec!["hello".to_string()]);
    }

    #[test]
    fn split_for_telegram_splits_long_text_on_newline() {
        let mut text = String::new();
        for _ in 0..200 {
            text.push_str(&"word ".repeat(20));
            text.push('\n');
        }
        let chunks = split_for_telegram(&text);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= TELEGRAM_MAX_TEXT_CHARS);
        }
        assert_eq!(chunks.join(""), text);
    }

    #[tokio::test]
    async fn owns_jid_matches_tg_prefix_only() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let bridge = TelegramBridge::new(Some("token".to_string()), store);
        assert!(bridge.owns_jid("tg:123"));
        assert!(!bridge.owns_jid("user@example.com"));
    }

    #[tokio::test]
    async fn disabled_without_token() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let bridge = TelegramBridge::new(None, store);
        assert!(!bridge.is_enabled());
    }
}
