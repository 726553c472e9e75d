//! Inbound messages and the request/result types that flow through dispatch.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::provider::ErrorKind;

/// A single customer message accepted from the channel.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub id: i64,
    pub text: String,
    pub received_at: DateTime<Utc>,
}

/// One candidate that was tried and failed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Attempt {
    pub credential_id: String,
    pub model: String,
    pub error_kind: ErrorKind,
    pub detail: String,
}

/// A coalesced burst of messages, dispatched as one AI call.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub conversation_id: i64,
    pub text: String,
    /// Ids of the messages folded into `text`, in arrival order.
    pub message_ids: Vec<i64>,
    pub attempt_history: Vec<Attempt>,
}

impl DispatchRequest {
    /// Build a request from a flushed snapshot. Texts are joined with a single
    /// space in arrival order; blank texts are skipped.
    pub fn from_snapshot(conversation_id: i64, snapshot: &[InboundMessage]) -> Self {
        let text = snapshot
            .iter()
            .map(|m| m.text.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ");

        Self {
            conversation_id,
            text,
            message_ids: snapshot.iter().map(|m| m.id).collect(),
            attempt_history: Vec::new(),
        }
    }
}

/// Why a dispatch ended with the canned reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackReason {
    /// No credential/model was eligible when the request arrived.
    NoCandidates,
    /// Every candidate was tried and failed.
    AllCandidatesExhausted,
    /// The dispatch queue was full.
    Overloaded,
}

impl FallbackReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FallbackReason::NoCandidates => "no_candidates",
            FallbackReason::AllCandidatesExhausted => "all_candidates_exhausted",
            FallbackReason::Overloaded => "overloaded",
        }
    }
}

/// Outcome of one dispatch. Always carries a reply text: either the model's
/// answer or the fallback message.
#[derive(Debug, Clone)]
pub struct DispatchResult {
    pub conversation_id: i64,
    pub success: bool,
    pub response_text: String,
    pub used_credential: Option<String>,
    pub used_model: Option<String>,
    pub latency: Duration,
    pub error_kind: Option<ErrorKind>,
    pub fallback: Option<FallbackReason>,
    /// Set when a human should pick the conversation up.
    pub escalate: bool,
    pub attempts: Vec<Attempt>,
    pub message_ids: Vec<i64>,
}

impl DispatchResult {
    pub fn success(
        request: DispatchRequest,
        response_text: String,
        credential_id: &str,
        model: &str,
        latency: Duration,
    ) -> Self {
        Self {
            conversation_id: request.conversation_id,
            success: true,
            response_text,
            used_credential: Some(credential_id.to_string()),
            used_model: Some(model.to_string()),
            latency,
            error_kind: None,
            fallback: None,
            escalate: false,
            attempts: request.attempt_history,
            message_ids: request.message_ids,
        }
    }

    pub fn fallback(
        request: DispatchRequest,
        reason: FallbackReason,
        reply: &str,
        latency: Duration,
    ) -> Self {
        let error_kind = request.attempt_history.last().map(|a| a.error_kind);
        Self {
            conversation_id: request.conversation_id,
            success: false,
            response_text: reply.to_string(),
            used_credential: None,
            used_model: None,
            latency,
            error_kind,
            fallback: Some(reason),
            escalate: true,
            attempts: request.attempt_history,
            message_ids: request.message_ids,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(id: i64, text: &str) -> InboundMessage {
        InboundMessage {
            id,
            text: text.to_string(),
            received_at: Utc::now(),
        }
    }

    #[test]
    fn test_snapshot_joins_in_arrival_order() {
        let request = DispatchRequest::from_snapshot(7, &[msg(1, "hi"), msg(2, "how much is it")]);
        assert_eq!(request.text, "hi how much is it");
        assert_eq!(request.message_ids, vec![1, 2]);
        assert_eq!(request.conversation_id, 7);
    }

    #[test]
    fn test_snapshot_skips_blank_and_trims() {
        let request =
            DispatchRequest::from_snapshot(7, &[msg(1, "  hello "), msg(2, "   "), msg(3, "there\n")]);
        assert_eq!(request.text, "hello there");
        assert_eq!(request.message_ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_fallback_carries_last_error_and_escalates() {
        let mut request = DispatchRequest::from_snapshot(7, &[msg(1, "hi")]);
        request.attempt_history.push(Attempt {
            credential_id: "a".to_string(),
            model: "m".to_string(),
            error_kind: ErrorKind::Quota,
            detail: "429".to_string(),
        });
        let result = DispatchResult::fallback(
            request,
            FallbackReason::AllCandidatesExhausted,
            "sorry",
            Duration::ZERO,
        );
        assert!(!result.success);
        assert!(result.escalate);
        assert_eq!(result.response_text, "sorry");
        assert_eq!(result.error_kind, Some(ErrorKind::Quota));
        assert_eq!(result.attempts.len(), 1);
    }
}
