//! Dispatch outcome reporting.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::chatbot::message::DispatchResult;

/// Receives every dispatch result, once per flush.
#[async_trait]
pub trait OutcomeRecorder: Send + Sync {
    async fn on_dispatch_completed(&self, result: &DispatchResult);
}

/// Writes outcomes to the log.
pub struct LogRecorder;

#[async_trait]
impl OutcomeRecorder for LogRecorder {
    async fn on_dispatch_completed(&self, result: &DispatchResult) {
        if result.success {
            info!(
                conversation = result.conversation_id,
                credential = result.used_credential.as_deref().unwrap_or(""),
                model = result.used_model.as_deref().unwrap_or(""),
                latency_ms = result.latency.as_millis() as u64,
                messages = result.message_ids.len(),
                "Dispatch succeeded"
            );
        } else {
            warn!(
                conversation = result.conversation_id,
                reason = result.fallback.map(|r| r.as_str()).unwrap_or(""),
                error_kind = result.error_kind.map(|k| k.as_str()).unwrap_or(""),
                attempts = result.attempts.len(),
                "Dispatch fell back"
            );
        }
    }
}

/// Fans one result out to several recorders in order.
pub struct CompositeRecorder {
    recorders: Vec<Arc<dyn OutcomeRecorder>>,
}

impl CompositeRecorder {
    pub fn new(recorders: Vec<Arc<dyn OutcomeRecorder>>) -> Self {
        Self { recorders }
    }
}

#[async_trait]
impl OutcomeRecorder for CompositeRecorder {
    async fn on_dispatch_completed(&self, result: &DispatchResult) {
        for recorder in &self.recorders {
            recorder.on_dispatch_completed(result).await;
        }
    }
}

/// Hand the result to `recorder` on a detached task so the reply path never waits.
pub fn record_detached(recorder: Arc<dyn OutcomeRecorder>, result: DispatchResult) {
    tokio::spawn(async move {
        recorder.on_dispatch_completed(&result).await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chatbot::message::{DispatchRequest, FallbackReason};
    use crate::chatbot::testing::CapturingRecorder;
    use std::time::Duration;

    fn result(conversation_id: i64) -> DispatchResult {
        let request = DispatchRequest::from_snapshot(conversation_id, &[]);
        DispatchResult::fallback(request, FallbackReason::NoCandidates, "later", Duration::ZERO)
    }

    #[tokio::test]
    async fn test_composite_reaches_every_recorder() {
        let a = Arc::new(CapturingRecorder::default());
        let b = Arc::new(CapturingRecorder::default());
        let composite = CompositeRecorder::new(vec![a.clone(), b.clone(), Arc::new(LogRecorder)]);

        composite.on_dispatch_completed(&result(1)).await;
        assert_eq!(a.results().len(), 1);
        assert_eq!(b.results().len(), 1);
    }

    #[tokio::test]
    async fn test_record_detached_runs_in_background() {
        let recorder = Arc::new(CapturingRecorder::default());
        record_detached(recorder.clone(), result(9));

        recorder.wait_for(1, Duration::from_secs(1)).await;
        assert_eq!(recorder.results()[0].conversation_id, 9);
    }
}
