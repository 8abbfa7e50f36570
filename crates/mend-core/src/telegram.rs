use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::warn;

use crate::notify::{Button, Notification, Notifier};

pub const CALLBACK_APPROVE: &str = "repair_approve";
pub const CALLBACK_REJECT: &str = "repair_reject";
pub const CALLBACK_DETAILS: &str = "repair_details";

/// A text message sent to the bot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TgMessage {
    pub message_id: i64,
    pub chat_id: i64,
    pub sender_id: i64,
    pub text: String,
}

/// A button press on one of the bot's messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TgCallback {
    pub id: String,
    pub chat_id: i64,
    pub message_id: i64,
    pub sender_id: i64,
    pub data: String,
    /// Text of the message carrying the button.
    pub message_text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TgUpdate {
    Message(TgMessage),
    Callback(TgCallback),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackAction {
    Approve,
    Reject,
    Details,
}

/// Split `repair_<verb>:<id>` callback data. Returns `None` for foreign data
/// or an empty id.
pub fn parse_callback(data: &str) -> Option<(CallbackAction, &str)> {
    let (prefix, id) = data.split_once(':')?;
    let action = match prefix {
        CALLBACK_APPROVE => CallbackAction::Approve,
        CALLBACK_REJECT => CallbackAction::Reject,
        CALLBACK_DETAILS => CallbackAction::Details,
        _ => return None,
    };
    let id = id.trim();
    if id.is_empty() {
        return None;
    }
    Some((action, id))
}

/// Decode one entry of a `getUpdates` result.
pub fn parse_update(update: &Value) -> Option<TgUpdate> {
    if let Some(cb) = update.get("callback_query") {
        let msg = &cb["message"];
        return Some(TgUpdate::Callback(TgCallback {
            id: cb["id"].as_str()?.to_string(),
            chat_id: msg["chat"]["id"].as_i64().unwrap_or(0),
            message_id: msg["message_id"].as_i64().unwrap_or(0),
            sender_id: cb["from"]["id"].as_i64().unwrap_or(0),
            data: cb["data"].as_str().unwrap_or("").to_string(),
            message_text: msg["text"].as_str().unwrap_or("").to_string(),
        }));
    }

    let msg = update.get("message")?;
    let text = msg["text"].as_str()?;
    Some(TgUpdate::Message(TgMessage {
        message_id: msg["message_id"].as_i64().unwrap_or(0),
        chat_id: msg["chat"]["id"].as_i64().unwrap_or(0),
        sender_id: msg["from"]["id"].as_i64().unwrap_or(0),
        text: text.to_string(),
    }))
}

pub struct Telegram {
    pub token: String,
    /// Chat that receives notifications; also the only chat allowed to decide.
    pub admin_chat_id: i64,
    client: Client,
    last_update_id: AtomicI64,
}

impl Telegram {
    pub fn new(token: impl Into<String>, admin_chat_id: i64) -> Self {
        Self {
            token: token.into(),
            admin_chat_id,
            client: Client::new(),
            last_update_id: AtomicI64::new(0),
        }
    }

    fn api_url(&self, method: &str) -> String {
        format!("https://api.telegram.org/bot{}/{}", self.token, method)
    }

    async fn call(&self, method: &str, body: &Value) -> Result<Value> {
        let resp: Value = self
            .client
            .post(self.api_url(method))
            .json(body)
            .send()
            .await
            .with_context(|| format!("{method} request"))?
            .json()
            .await
            .with_context(|| format!("{method} parse"))?;
        if resp["ok"] != true {
            bail!("Telegram {method} failed: {}", resp["description"]);
        }
        Ok(resp)
    }

    /// Long-poll for messages and button presses with timeout=2s.
    pub async fn get_updates(&self) -> Result<Vec<TgUpdate>> {
        let offset = self.last_update_id.load(Ordering::Relaxed) + 1;
        let url = format!(
            "{}?timeout=2&offset={}&allowed_updates=[\"message\",\"callback_query\"]",
            self.api_url("getUpdates"),
            offset
        );

        let resp: Value = self
            .client
            .get(&url)
            .timeout(std::time::Duration::from_secs(10))
            .send()
            .await
            .context("getUpdates request")?
            .json()
            .await
            .context("getUpdates parse")?;

        let Some(updates) = resp["result"].as_array() else {
            return Ok(vec![]);
        };

        let mut out = Vec::new();
        for update in updates {
            let update_id = update["update_id"].as_i64().unwrap_or(0);
            if update_id > self.last_update_id.load(Ordering::Relaxed) {
                self.last_update_id.store(update_id, Ordering::Relaxed);
            }
            if let Some(u) = parse_update(update) {
                out.push(u);
            }
        }
        Ok(out)
    }

    /// Send plain text (no parse mode: action names contain underscores).
    pub async fn send_message(&self, chat_id: i64, text: &str, buttons: &[Button]) -> Result<()> {
        let chunks = split_text(text, 4000);
        let last = chunks.len().saturating_sub(1);
        for (i, chunk) in chunks.into_iter().enumerate() {
            let mut body = json!({ "chat_id": chat_id, "text": chunk });
            if i == last && !buttons.is_empty() {
                body["reply_markup"] = inline_keyboard(buttons);
            }
            self.call("sendMessage", &body).await?;
        }
        Ok(())
    }

    pub async fn answer_callback_query(&self, callback_id: &str, text: &str) -> Result<()> {
        self.call(
            "answerCallbackQuery",
            &json!({ "callback_query_id": callback_id, "text": text }),
        )
        .await?;
        Ok(())
    }

    /// Replace a message's text, dropping its buttons.
    pub async fn edit_message_text(&self, chat_id: i64, message_id: i64, text: &str) -> Result<()> {
        self.call(
            "editMessageText",
            &json!({ "chat_id": chat_id, "message_id": message_id, "text": text }),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Notifier for Telegram {
    async fn send(&self, notification: &Notification) -> Result<()> {
        if let Err(e) = self
            .send_message(self.admin_chat_id, &notification.text, &notification.buttons)
            .await
        {
            warn!("Telegram notification failed: {e:#}");
            return Err(e);
        }
        Ok(())
    }
}

/// One row of buttons.
pub fn inline_keyboard(buttons: &[Button]) -> Value {
    let row: Vec<Value> = buttons
        .iter()
        .map(|b| json!({ "text": b.label, "callback_data": b.callback_data }))
        .collect();
    json!({ "inline_keyboard": [row] })
}

/// Split on newlines where possible, never inside a UTF-8 sequence.
pub fn split_text(text: &str, limit: usize) -> Vec<String> {
    if text.len() <= limit {
        return vec![text.to_string()];
    }
    let mut chunks = Vec::new();
    let mut remaining = text;
    while remaining.len() > limit {
        let mut boundary = limit;
        while !remaining.is_char_boundary(boundary) {
            boundary -= 1;
        }
        let cut = match remaining[..boundary].rfind('\n') {
            Some(0) | None => boundary,
            Some(i) => i,
        };
        chunks.push(remaining[..cut].to_string());
        remaining = remaining[cut..].trim_start_matches('\n');
    }
    if !remaining.is_empty() {
        chunks.push(remaining.to_string());
    }
    chunks
}
