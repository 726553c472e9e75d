//! Telegram channel adapter using teloxide.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use teloxide::prelude::*;
use teloxide::types::ChatAction;
use tracing::{debug, warn};

use crate::chatbot::message::InboundMessage;

/// Telegram rejects messages longer than this many characters.
const MAX_MESSAGE_CHARS: usize = 4096;

/// Outbound side of the channel.
#[async_trait]
pub trait ReplySink: Send + Sync {
    async fn deliver(&self, conversation_id: i64, text: &str) -> Result<(), String>;
}

/// Telegram API client.
pub struct TelegramClient {
    bot: Bot,
}

impl TelegramClient {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }

    /// Send plain text, split into as many messages as needed.
    /// Returns the id of the last message sent.
    pub async fn send_message(&self, chat_id: i64, text: &str) -> Result<i64, String> {
        let mut last_id = 0;
        for chunk in split_message(text, MAX_MESSAGE_CHARS) {
            let msg = self
                .bot
                .send_message(ChatId(chat_id), chunk)
                .await
                .map_err(|e| {
                    let msg = format!("Failed to send: {e}");
                    warn!("{}", msg);
                    msg
                })?;
            last_id = msg.id.0 as i64;
        }
        Ok(last_id)
    }

    /// Show "typing..." while a reply is being prepared.
    pub async fn send_typing(&self, chat_id: i64) -> Result<(), String> {
        self.bot
            .send_chat_action(ChatId(chat_id), ChatAction::Typing)
            .await
            .map(|_| ())
            .map_err(|e| format!("Failed to send chat action: {e}"))
    }
}

#[async_trait]
impl ReplySink for TelegramClient {
    async fn deliver(&self, conversation_id: i64, text: &str) -> Result<(), String> {
        let msg_id = self.send_message(conversation_id, text).await?;
        debug!("✅ Sent message {} to chat {}", msg_id, conversation_id);
        Ok(())
    }
}

/// Convert an incoming Telegram message into an inbound customer message.
/// Returns `None` for updates without text (stickers, joins, ...).
pub fn inbound_from(msg: &Message) -> Option<(i64, InboundMessage)> {
    let text = msg.text().or_else(|| msg.caption())?;
    let received_at: DateTime<Utc> = msg.date;
    Some((
        msg.chat.id.0,
        InboundMessage {
            id: msg.id.0 as i64,
            text: text.to_string(),
            received_at,
        },
    ))
}

/// Split `text` into chunks of at most `max_chars` characters, preferring
/// line breaks.
pub fn split_message(text: &str, max_chars: usize) -> Vec<String> {
    if text.chars().count() <= max_chars {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;
    for line in text.split_inclusive('\n') {
        let line_len = line.chars().count();
        if current_len + line_len > max_chars && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if line_len > max_chars {
            let chars: Vec<char> = line.chars().collect();
            for piece in chars.chunks(max_chars) {
                chunks.push(piece.iter().collect());
            }
            continue;
        }
        current.push_str(line);
        current_len += line_len;
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}
