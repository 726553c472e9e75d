//! Operator alerts: a tracing layer that forwards alert events to a Telegram chat.
//!
//! Events on the [`ALERT_TARGET`] target (disabled credentials, conversations
//! that need a human) are sent immediately. Other ERROR events are batched.

use std::time::Duration;

use teloxide::prelude::*;
use teloxide::types::ChatId;
use tokio::sync::mpsc;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::Context;

/// Tracing target for events an operator must see.
pub const ALERT_TARGET: &str = "operator_alert";

const BATCH_INTERVAL: Duration = Duration::from_secs(30);
const BATCH_MAX: usize = 20;
const MAX_ALERT_CHARS: usize = 4000;

/// How an event reaches the operator chat.
#[derive(Debug, PartialEq, Eq)]
enum Route {
    Immediate,
    Batched,
}

fn route(level: Level, target: &str) -> Option<Route> {
    if target == ALERT_TARGET {
        Some(Route::Immediate)
    } else if level == Level::ERROR {
        Some(Route::Batched)
    } else {
        None
    }
}

enum AlertMessage {
    Urgent(String),
    Batched(String),
}

pub struct TelegramAlertLayer {
    tx: mpsc::UnboundedSender<AlertMessage>,
}

impl TelegramAlertLayer {
    pub fn new(bot: Bot, chat_id: ChatId) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<AlertMessage>();

        tokio::spawn(async move {
            let mut batch: Vec<String> = Vec::new();
            let mut interval = tokio::time::interval(BATCH_INTERVAL);

            loop {
                tokio::select! {
                    msg = rx.recv() => {
                        match msg {
                            Some(AlertMessage::Urgent(text)) => {
                                send_alert(&bot, chat_id, &text).await;
                            }
                            Some(AlertMessage::Batched(text)) => {
                                batch.push(text);
                                if batch.len() >= BATCH_MAX {
                                    flush_batch(&bot, chat_id, &mut batch).await;
                                }
                            }
                            None => break,
                        }
                    }
                    _ = interval.tick() => {
                        flush_batch(&bot, chat_id, &mut batch).await;
                    }
                }
            }
        });

        Self { tx }
    }
}

fn truncate(text: &str) -> String {
    if text.chars().count() > MAX_ALERT_CHARS {
        let truncated: String = text.chars().take(MAX_ALERT_CHARS).collect();
        format!("{}...", truncated)
    } else {
        text.to_string()
    }
}

async fn send_alert(bot: &Bot, chat_id: ChatId, text: &str) {
    if let Err(e) = bot.send_message(chat_id, truncate(text)).await {
        // Logging here would feed back into this layer.
        eprintln!("Failed to send alert to Telegram: {e}");
    }
}

async fn flush_batch(bot: &Bot, chat_id: ChatId, batch: &mut Vec<String>) {
    if batch.is_empty() {
        return;
    }
    let combined = batch.join("\n");
    batch.clear();
    send_alert(bot, chat_id, &combined).await;
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.insert_str(0, value);
        } else {
            self.push_field(field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message.insert_str(0, &format!("{:?}", value));
        } else {
            self.push_field(field.name(), &format!("{:?}", value));
        }
    }
}

impl MessageVisitor {
    fn push_field(&mut self, name: &str, value: &str) {
        if !self.message.is_empty() {
            self.message.push_str(", ");
        }
        self.message.push_str(&format!("{} = {}", name, value));
    }
}

impl<S: Subscriber> Layer<S> for TelegramAlertLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let Some(route) = route(*metadata.level(), metadata.target()) else {
            return;
        };

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let msg = match route {
            Route::Immediate => AlertMessage::Urgent(format!("🚨 {}", visitor.message)),
            Route::Batched => AlertMessage::Batched(format!("❌ {}", visitor.message)),
        };

        if self.tx.send(msg).is_err() {
            eprintln!("Alert channel closed, message dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alert_target_is_immediate_at_any_level() {
        assert_eq!(route(Level::WARN, ALERT_TARGET), Some(Route::Immediate));
        assert_eq!(route(Level::ERROR, ALERT_TARGET), Some(Route::Immediate));
    }

    #[test]
    fn test_other_errors_are_batched() {
        assert_eq!(route(Level::ERROR, "relaydesk::chatbot::engine"), Some(Route::Batched));
    }

    #[test]
    fn test_lower_levels_are_dropped() {
        assert_eq!(route(Level::WARN, "relaydesk::chatbot::router"), None);
        assert_eq!(route(Level::INFO, "relaydesk"), None);
    }

    #[test]
    fn test_truncates_long_alerts() {
        let long = "x".repeat(MAX_ALERT_CHARS + 10);
        let out = truncate(&long);
        assert_eq!(out.chars().count(), MAX_ALERT_CHARS + 3);
        assert!(out.ends_with("..."));
        assert_eq!(truncate("short"), "short");
    }
}
