//! Shared fakes for unit and scenario tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::chatbot::credentials::{Credential, CredentialState, ModelSlot};
use crate::chatbot::ledger::WindowKind;
use crate::chatbot::message::{DispatchRequest, DispatchResult};
use crate::chatbot::outcome::OutcomeRecorder;
use crate::chatbot::sequencer::Dispatcher;
use crate::chatbot::telegram::ReplySink;
use crate::provider::{Provider, ProviderError, ProviderFamily};

pub fn credential(id: &str, priority: u32, models: &[(&str, u64)]) -> Credential {
    Credential {
        id: id.to_string(),
        family: ProviderFamily::Anthropic,
        api_key: format!("key-{id}"),
        state: CredentialState::Enabled,
        priority,
        models: models
            .iter()
            .map(|(m, limit)| (m.to_string(), ModelSlot::new(*limit, WindowKind::Daily)))
            .collect(),
    }
}

/// Poll `check` every few milliseconds until it holds or `timeout` passes.
pub async fn eventually(timeout: Duration, check: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

/// Provider whose answers are scripted per credential id. Unscripted calls
/// succeed with `"<credential>/<model>: <prompt>"`.
#[derive(Default)]
pub struct ScriptedProvider {
    scripts: Mutex<HashMap<String, VecDeque<Result<String, ProviderError>>>>,
    calls: Mutex<Vec<(String, String, String)>>,
    delay: Mutex<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, credential_id: &str, response: Result<String, ProviderError>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(credential_id.to_string())
            .or_default()
            .push_back(response);
    }

    /// Every call sleeps this long before answering.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    /// (credential, model, prompt) per call, in call order.
    pub fn calls(&self) -> Vec<(String, String, String)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    async fn invoke(
        &self,
        credential: &Credential,
        model: &str,
        prompt: &str,
        _context: &str,
    ) -> Result<String, ProviderError> {
        self.calls
            .lock()
            .unwrap()
            .push((credential.id.clone(), model.to_string(), prompt.to_string()));

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let scripted = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&credential.id)
            .and_then(|queue| queue.pop_front());
        scripted.unwrap_or_else(|| Ok(format!("{}/{}: {}", credential.id, model, prompt)))
    }
}

#[derive(Default)]
pub struct CapturingRecorder {
    results: Mutex<Vec<DispatchResult>>,
}

impl CapturingRecorder {
    pub fn results(&self) -> Vec<DispatchResult> {
        self.results.lock().unwrap().clone()
    }

    pub async fn wait_for(&self, count: usize, timeout: Duration) {
        eventually(timeout, || self.results.lock().unwrap().len() >= count).await;
    }
}

#[async_trait]
impl OutcomeRecorder for CapturingRecorder {
    async fn on_dispatch_completed(&self, result: &DispatchResult) {
        self.results.lock().unwrap().push(result.clone());
    }
}

#[derive(Default)]
pub struct RecordingSink {
    delivered: Mutex<Vec<(i64, String)>>,
}

impl RecordingSink {
    pub fn delivered(&self) -> Vec<(i64, String)> {
        self.delivered.lock().unwrap().clone()
    }

    pub async fn wait_for(&self, count: usize, timeout: Duration) {
        eventually(timeout, || self.delivered.lock().unwrap().len() >= count).await;
    }
}

#[async_trait]
impl ReplySink for RecordingSink {
    async fn deliver(&self, conversation_id: i64, text: &str) -> Result<(), String> {
        self.delivered
            .lock()
            .unwrap()
            .push((conversation_id, text.to_string()));
        Ok(())
    }
}

/// Dispatcher that answers `re: <text>` after `delay`.
pub struct SlowDispatcher {
    pub delay: Duration,
    active: AtomicUsize,
    max_active: AtomicUsize,
    log: Mutex<Vec<(i64, String, Instant, Instant)>>,
}

impl SlowDispatcher {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            log: Mutex::new(Vec::new()),
        }
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    /// (conversation, text, started, finished) per completed dispatch.
    pub fn log(&self) -> Vec<(i64, String, Instant, Instant)> {
        self.log.lock().unwrap().clone()
    }
}

#[async_trait]
impl Dispatcher for SlowDispatcher {
    async fn dispatch(&self, request: DispatchRequest) -> DispatchResult {
        let started = Instant::now();
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.active.fetch_sub(1, Ordering::SeqCst);

        self.log.lock().unwrap().push((
            request.conversation_id,
            request.text.clone(),
            started,
            Instant::now(),
        ));
        let text = format!("re: {}", request.text);
        DispatchResult::success(request, text, "fake", "model", started.elapsed())
    }
}
