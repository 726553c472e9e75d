//! End-to-end tests for the chatbot pipeline: buffer → sequencer → pool →
//! ledger → delivery → recorder, wired the way `main` wires them.
//!
//! Run with: cargo test chatbot

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::sleep;

use crate::chatbot::buffer::Admission;
use crate::chatbot::credentials::{Credential, CredentialState, CredentialStore};
use crate::chatbot::database::Database;
use crate::chatbot::engine::{ChatbotConfig, ChatbotEngine};
use crate::chatbot::ledger::UsageLedger;
use crate::chatbot::message::FallbackReason;
use crate::chatbot::outcome::OutcomeRecorder;
use crate::chatbot::router::{CredentialPool, PoolConfig};
use crate::chatbot::sequencer::{DispatchSequencer, SequencerConfig};
use crate::chatbot::testing::{CapturingRecorder, RecordingSink, ScriptedProvider, credential, eventually};
use crate::provider::{ErrorKind, ProviderError};

const FALLBACK: &str = "Thanks! A teammate will reply shortly.";

struct Harness {
    db: Arc<Database>,
    ledger: UsageLedger,
    provider: Arc<ScriptedProvider>,
    pool: Arc<CredentialPool>,
    sink: Arc<RecordingSink>,
    recorder: Arc<CapturingRecorder>,
    engine: ChatbotEngine,
}

struct Settings {
    debounce_ms: u64,
    debounce_max_ms: u64,
    max_concurrent: usize,
    max_queue_depth: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            debounce_ms: 50,
            debounce_max_ms: 2000,
            max_concurrent: 4,
            max_queue_depth: 16,
        }
    }
}

async fn harness(credentials: Vec<Credential>, settings: Settings) -> Harness {
    let db = Arc::new(Database::new().unwrap());
    for c in &credentials {
        db.upsert(c).await.unwrap();
    }
    let ledger = UsageLedger::new(db.clone(), chrono_tz::UTC, 8);
    let provider = Arc::new(ScriptedProvider::new());

    let pool = Arc::new(CredentialPool::new(
        PoolConfig {
            provider_timeout: Duration::from_secs(2),
            transport_backoff: Duration::from_millis(5),
            fallback_reply: FALLBACK.to_string(),
            system_prompt: "You are a support agent.".to_string(),
        },
        db.clone(),
        ledger.clone(),
        provider.clone(),
    ));
    pool.refresh().await.unwrap();

    let sequencer = Arc::new(DispatchSequencer::new(
        pool.clone(),
        SequencerConfig {
            max_concurrent: settings.max_concurrent,
            max_queue_depth: settings.max_queue_depth,
            fallback_reply: FALLBACK.to_string(),
        },
    ));

    let sink = Arc::new(RecordingSink::default());
    let recorder = Arc::new(CapturingRecorder::default());
    let engine = ChatbotEngine::new(
        ChatbotConfig {
            debounce_ms: settings.debounce_ms,
            debounce_max_ms: settings.debounce_max_ms,
            ..Default::default()
        },
        sequencer,
        sink.clone(),
        recorder.clone(),
    );

    Harness {
        db,
        ledger,
        provider,
        pool,
        sink,
        recorder,
        engine,
    }
}

fn send(h: &Harness, conversation_id: i64, message_id: i64, text: &str) -> Admission {
    h.engine.receive_message(conversation_id, message_id, text, Utc::now())
}

// =============================================================================
// DEBOUNCE SCENARIOS
// =============================================================================

mod debounce {
    use super::*;

    #[tokio::test]
    async fn test_two_quick_messages_become_one_request() {
        // "hi", then "how much is it" shortly after, well inside the quiet period.
        let h = harness(vec![credential("c1", 0, &[("m", 100)])], Settings {
            debounce_ms: 100,
            ..Default::default()
        })
        .await;

        send(&h, 1, 10, "hi");
        sleep(Duration::from_millis(40)).await;
        send(&h, 1, 11, "how much is it");

        h.sink.wait_for(1, Duration::from_secs(2)).await;
        let calls = h.provider.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].2, "hi how much is it");
        assert_eq!(h.sink.delivered(), vec![(1, "c1/m: hi how much is it".to_string())]);
    }

    #[tokio::test]
    async fn test_burst_keeps_arrival_order() {
        let h = harness(vec![credential("c1", 0, &[("m", 100)])], Settings::default()).await;

        for (id, word) in ["one", "two", "three", "four", "five"].iter().enumerate() {
            send(&h, 3, id as i64, word);
            sleep(Duration::from_millis(10)).await;
        }

        h.recorder.wait_for(1, Duration::from_secs(2)).await;
        let results = h.recorder.results();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].message_ids, vec![0, 1, 2, 3, 4]);
        assert_eq!(h.provider.calls()[0].2, "one two three four five");
    }

    #[tokio::test]
    async fn test_redelivered_message_is_never_dispatched_twice() {
        let h = harness(vec![credential("c1", 0, &[("m", 100)])], Settings::default()).await;

        assert_eq!(send(&h, 1, 7, "where is my order"), Admission::Buffered);
        assert_eq!(send(&h, 1, 7, "where is my order"), Admission::Duplicate);
        h.sink.wait_for(1, Duration::from_secs(2)).await;

        assert_eq!(send(&h, 1, 7, "where is my order"), Admission::Duplicate);
        sleep(Duration::from_millis(150)).await;

        assert_eq!(h.provider.call_count(), 1);
        assert_eq!(h.sink.delivered().len(), 1);
    }

    #[tokio::test]
    async fn test_blank_messages_are_ignored() {
        let h = harness(vec![credential("c1", 0, &[("m", 100)])], Settings::default()).await;

        assert_eq!(send(&h, 1, 1, "   \n"), Admission::Ignored);
        sleep(Duration::from_millis(120)).await;
        assert_eq!(h.provider.call_count(), 0);
        assert!(h.engine.buffers().is_empty());
    }

    #[tokio::test]
    async fn test_messages_during_dispatch_get_their_own_reply() {
        let h = harness(vec![credential("c1", 0, &[("m", 100)])], Settings::default()).await;
        h.provider.set_delay(Duration::from_millis(150));

        send(&h, 1, 1, "first");
        sleep(Duration::from_millis(90)).await;
        assert_eq!(send(&h, 1, 2, "second"), Admission::Deferred);

        h.sink.wait_for(2, Duration::from_secs(3)).await;
        let prompts: Vec<String> = h.provider.calls().into_iter().map(|(_, _, p)| p).collect();
        assert_eq!(prompts, vec!["first", "second"]);
        assert_eq!(h.provider.max_in_flight(), 1);
    }
}

// =============================================================================
// DISPATCH SCENARIOS
// =============================================================================

mod dispatch {
    use super::*;

    #[tokio::test]
    async fn test_global_cap_of_one_orders_provider_calls() {
        let h = harness(vec![credential("c1", 0, &[("m", 100)])], Settings {
            max_concurrent: 1,
            ..Default::default()
        })
        .await;
        h.provider.set_delay(Duration::from_millis(80));

        send(&h, 1, 1, "from one");
        send(&h, 2, 1, "from two");

        h.sink.wait_for(2, Duration::from_secs(3)).await;
        assert_eq!(h.provider.call_count(), 2);
        assert_eq!(h.provider.max_in_flight(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_credential_is_skipped() {
        let h = harness(
            vec![credential("c1", 0, &[("m", 10)]), credential("c2", 0, &[("m", 10)])],
            Settings::default(),
        )
        .await;
        h.ledger.commit_usage("c2", "m", 10).await.unwrap();

        send(&h, 1, 1, "hello");
        h.recorder.wait_for(1, Duration::from_secs(2)).await;

        let result = &h.recorder.results()[0];
        assert_eq!(result.used_credential.as_deref(), Some("c1"));
        assert_eq!(h.ledger.read("c1", "m").await.unwrap().used, 1);
        assert_eq!(h.ledger.read("c2", "m").await.unwrap().used, 10);
    }

    #[tokio::test]
    async fn test_auth_failure_disables_credential_but_customer_gets_reply() {
        let h = harness(
            vec![credential("c1", 0, &[("m", 10)]), credential("c2", 1, &[("m", 10)])],
            Settings::default(),
        )
        .await;
        h.provider.push("c1", Err(ProviderError::Auth("invalid x-api-key".to_string())));

        send(&h, 1, 1, "hi");
        h.recorder.wait_for(1, Duration::from_secs(2)).await;

        let result = &h.recorder.results()[0];
        assert!(result.success);
        assert_eq!(result.used_credential.as_deref(), Some("c2"));
        assert_eq!(result.attempts[0].error_kind, ErrorKind::Auth);
        assert_eq!(h.pool.credential("c1").unwrap().state, CredentialState::Disabled);
        assert_eq!(h.db.list().await.unwrap()[0].state, CredentialState::Disabled);

        send(&h, 1, 2, "still there?");
        h.recorder.wait_for(2, Duration::from_secs(2)).await;
        let c1_calls = h.provider.calls().iter().filter(|(id, _, _)| id == "c1").count();
        assert_eq!(c1_calls, 1);
    }

    #[tokio::test]
    async fn test_all_throttled_delivers_fallback_quickly() {
        let h = harness(vec![credential("c1", 0, &[("m", 1)])], Settings::default()).await;
        h.ledger.commit_usage("c1", "m", 1).await.unwrap();

        let started = tokio::time::Instant::now();
        send(&h, 5, 1, "anyone?");
        h.sink.wait_for(1, Duration::from_secs(2)).await;
        assert!(started.elapsed() < Duration::from_secs(1));

        assert_eq!(h.sink.delivered(), vec![(5, FALLBACK.to_string())]);
        h.recorder.wait_for(1, Duration::from_secs(1)).await;
        let result = &h.recorder.results()[0];
        assert!(result.escalate);
        assert_eq!(result.fallback, Some(FallbackReason::NoCandidates));
        assert_eq!(h.provider.call_count(), 0);
    }

    #[tokio::test]
    async fn test_every_candidate_failing_escalates() {
        let h = harness(
            vec![credential("c1", 0, &[("m", 10)]), credential("c2", 1, &[("m", 10)])],
            Settings::default(),
        )
        .await;
        h.provider.push("c1", Err(ProviderError::Quota("429".to_string())));
        h.provider.push("c2", Err(ProviderError::Unknown("500-ish".to_string())));

        send(&h, 1, 1, "hi");
        h.recorder.wait_for(1, Duration::from_secs(2)).await;

        let result = &h.recorder.results()[0];
        assert!(!result.success);
        assert!(result.escalate);
        assert_eq!(result.fallback, Some(FallbackReason::AllCandidatesExhausted));
        assert_eq!(result.error_kind, Some(ErrorKind::Unknown));
        assert_eq!(result.attempts.len(), 2);
        assert_eq!(h.sink.delivered()[0].1, FALLBACK);
    }
}

// =============================================================================
// OUTCOME RECORDING
// =============================================================================

mod outcomes {
    use super::*;

    #[tokio::test]
    async fn test_recorder_sees_each_flush_exactly_once() {
        let h = harness(vec![credential("c1", 0, &[("m", 100)])], Settings::default()).await;

        send(&h, 1, 1, "a");
        send(&h, 2, 1, "b");
        h.recorder.wait_for(2, Duration::from_secs(2)).await;
        send(&h, 1, 2, "c");
        h.recorder.wait_for(3, Duration::from_secs(2)).await;
        sleep(Duration::from_millis(100)).await;

        let results = h.recorder.results();
        assert_eq!(results.len(), 3);
        assert_eq!(results.iter().filter(|r| r.conversation_id == 1).count(), 2);
    }

    #[tokio::test]
    async fn test_database_records_outcomes() {
        let h = harness(vec![credential("c1", 0, &[("m", 100)])], Settings::default()).await;

        send(&h, 1, 1, "hello");
        h.recorder.wait_for(1, Duration::from_secs(2)).await;

        let result = h.recorder.results().remove(0);
        h.db.on_dispatch_completed(&result).await;
        assert_eq!(h.db.outcome_count(), 1);
    }
}

// =============================================================================
// IDLE EVICTION
// =============================================================================

mod eviction {
    use super::*;

    #[tokio::test]
    async fn test_quiet_conversations_are_reclaimed() {
        let h = harness(vec![credential("c1", 0, &[("m", 100)])], Settings::default()).await;

        for conversation in 0..10 {
            send(&h, conversation, 1, "hi");
        }
        h.recorder.wait_for(10, Duration::from_secs(3)).await;
        assert!(
            eventually(Duration::from_secs(1), || {
                (0..10).all(|c| !h.engine.buffers().is_in_flight(c))
            })
            .await
        );

        assert_eq!(h.engine.buffers().len(), 10);
        assert_eq!(h.engine.buffers().evict_idle(Duration::ZERO), 10);
        assert!(h.engine.buffers().is_empty());
    }

    #[tokio::test]
    async fn test_redelivered_message_after_eviction_is_not_answered_twice() {
        let h = harness(vec![credential("c1", 0, &[("m", 100)])], Settings::default()).await;

        send(&h, 5, 41, "where is my order");
        h.recorder.wait_for(1, Duration::from_secs(3)).await;
        assert!(eventually(Duration::from_secs(1), || !h.engine.buffers().is_in_flight(5)).await);
        assert_eq!(h.engine.buffers().evict_idle(Duration::ZERO), 1);

        assert_eq!(send(&h, 5, 41, "where is my order"), Admission::Duplicate);
        sleep(Duration::from_millis(200)).await;
        assert_eq!(h.recorder.results().len(), 1);
    }
}
