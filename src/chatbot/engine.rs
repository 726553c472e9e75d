//! Chatbot engine - debounces customer messages and relays each burst to the
//! dispatch pipeline.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::alert::ALERT_TARGET;
use crate::chatbot::buffer::{Admission, BufferConfig, ConversationBuffers, FlushSink};
use crate::chatbot::message::{DispatchRequest, DispatchResult, InboundMessage};
use crate::chatbot::outcome::{OutcomeRecorder, record_detached};
use crate::chatbot::sequencer::Dispatcher;
use crate::chatbot::telegram::ReplySink;

/// Chatbot configuration.
#[derive(Debug, Clone)]
pub struct ChatbotConfig {
    pub debounce_ms: u64,
    /// Ceiling on how long a burst may be held back.
    pub debounce_max_ms: u64,
    /// Conversation buffers idle this long are dropped.
    pub idle_evict_secs: u64,
    pub business_name: Option<String>,
    /// Replaces the generated system prompt when set.
    pub system_prompt: Option<String>,
}

impl Default for ChatbotConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 5000,
            debounce_max_ms: 20_000,
            idle_evict_secs: 1800,
            business_name: None,
            system_prompt: None,
        }
    }
}

/// Sends each flushed burst through the dispatcher, delivers the reply and
/// reports the outcome.
pub struct ReplyPipeline {
    dispatcher: Arc<dyn Dispatcher>,
    replies: Arc<dyn ReplySink>,
    recorder: Arc<dyn OutcomeRecorder>,
}

impl ReplyPipeline {
    pub fn new(
        dispatcher: Arc<dyn Dispatcher>,
        replies: Arc<dyn ReplySink>,
        recorder: Arc<dyn OutcomeRecorder>,
    ) -> Self {
        Self {
            dispatcher,
            replies,
            recorder,
        }
    }
}

#[async_trait]
impl FlushSink for ReplyPipeline {
    async fn flush(&self, request: DispatchRequest) -> DispatchResult {
        let conversation_id = request.conversation_id;
        info!(
            "🤖 Dispatching {} message(s) for conversation {}: {} chars",
            request.message_ids.len(),
            conversation_id,
            request.text.len()
        );

        let result = self.dispatcher.dispatch(request).await;

        if result.escalate {
            warn!(
                target: ALERT_TARGET,
                conversation = conversation_id,
                reason = result.fallback.map(|r| r.as_str()).unwrap_or(""),
                "🙋 Conversation {conversation_id} needs a human"
            );
        }

        if let Err(e) = self.replies.deliver(conversation_id, &result.response_text).await {
            error!(conversation = conversation_id, "Failed to deliver reply: {e}");
        }

        record_detached(self.recorder.clone(), result.clone());
        result
    }
}

/// The chatbot engine.
pub struct ChatbotEngine {
    config: ChatbotConfig,
    buffers: ConversationBuffers,
    sweeper: Option<JoinHandle<()>>,
}

impl ChatbotEngine {
    pub fn new(
        config: ChatbotConfig,
        dispatcher: Arc<dyn Dispatcher>,
        replies: Arc<dyn ReplySink>,
        recorder: Arc<dyn OutcomeRecorder>,
    ) -> Self {
        let buffers = ConversationBuffers::new(
            BufferConfig {
                delay: Duration::from_millis(config.debounce_ms),
                max_delay: Duration::from_millis(config.debounce_max_ms),
            },
            Arc::new(ReplyPipeline::new(dispatcher, replies, recorder)),
        );
        Self {
            config,
            buffers,
            sweeper: None,
        }
    }

    /// Start the idle-buffer sweeper.
    pub fn start_sweeper(&mut self) {
        let ttl = Duration::from_secs(self.config.idle_evict_secs);
        let every = (ttl / 2).max(Duration::from_secs(1));
        if let Some(old) = self.sweeper.replace(self.buffers.spawn_sweeper(every, ttl)) {
            old.abort();
        }
    }

    /// Handle an incoming customer message. Redelivered ids are ignored.
    pub fn receive_message(
        &self,
        conversation_id: i64,
        message_id: i64,
        text: &str,
        received_at: DateTime<Utc>,
    ) -> Admission {
        if text.trim().is_empty() {
            return Admission::Ignored;
        }

        info!(
            "📨 {} ({}): \"{}\"",
            conversation_id,
            message_id,
            text.chars().take(50).collect::<String>()
        );

        self.buffers.admit(
            conversation_id,
            InboundMessage {
                id: message_id,
                text: text.to_string(),
                received_at,
            },
        )
    }

    pub fn buffers(&self) -> &ConversationBuffers {
        &self.buffers
    }
}

impl Drop for ChatbotEngine {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
    }
}

/// Build the system prompt passed to every provider call.
pub fn system_prompt(config: &ChatbotConfig) -> String {
    if let Some(custom) = config.system_prompt.as_deref().filter(|s| !s.trim().is_empty()) {
        return custom.to_string();
    }

    let business = match &config.business_name {
        Some(name) => format!("You answer customer messages on behalf of {name}."),
        None => "You answer customer messages on behalf of a small business.".to_string(),
    };

    format!(
        r#"You are a customer service assistant. {business}

Customers often send several short messages in a row; they arrive joined into one text. Answer them together in a single reply.

Rules:
- Reply in the customer's language, briefly and politely.
- Never invent prices, stock levels, delivery dates or policies you were not given.
- If you cannot help, say that a teammate will follow up shortly."#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_custom_system_prompt_wins() {
        let config = ChatbotConfig {
            system_prompt: Some("Be terse.".to_string()),
            business_name: Some("Acme".to_string()),
            ..Default::default()
        };
        assert_eq!(system_prompt(&config), "Be terse.");
    }

    #[test]
    fn test_generated_prompt_names_business() {
        let config = ChatbotConfig {
            business_name: Some("Acme Bikes".to_string()),
            system_prompt: Some("   ".to_string()),
            ..Default::default()
        };
        let prompt = system_prompt(&config);
        assert!(prompt.contains("Acme Bikes"));
        assert!(prompt.contains("teammate"));
    }
}
