//! Provider credential pool: picks a live credential/model for each request,
//! invokes it, and fails over across the pool.
//!
//! Candidates are every non-disabled credential × each enabled, non-throttled
//! model with quota left in the current window, ordered by
//! `(priority asc, remaining quota desc, least recently used)`.

use std::cmp::Reverse;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::alert::ALERT_TARGET;
use crate::chatbot::credentials::{Credential, CredentialRegistry, CredentialState, CredentialStore, StoreError};
use crate::chatbot::ledger::{LedgerError, UsageLedger};
use crate::chatbot::message::{Attempt, DispatchRequest, DispatchResult, FallbackReason};
use crate::chatbot::sequencer::Dispatcher;
use crate::provider::{ErrorKind, Provider, ProviderError};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Hard limit on a single provider call.
    pub provider_timeout: Duration,
    /// Pause before retrying a candidate after a transport failure.
    pub transport_backoff: Duration,
    pub fallback_reply: String,
    pub system_prompt: String,
}

#[derive(Debug, Clone)]
struct Candidate {
    credential_id: String,
    model: String,
    priority: u32,
    remaining: u64,
    limit: u64,
    window_end: DateTime<Utc>,
    last_used: Option<Instant>,
}

/// A pending write-through of a transition made in memory.
enum StoreWrite {
    State(String, CredentialState),
    Throttle(String, String, Option<DateTime<Utc>>),
}

pub struct CredentialPool {
    config: PoolConfig,
    store: Arc<dyn CredentialStore>,
    ledger: UsageLedger,
    provider: Arc<dyn Provider>,
    registry: RwLock<CredentialRegistry>,
}

impl CredentialPool {
    pub fn new(
        config: PoolConfig,
        store: Arc<dyn CredentialStore>,
        ledger: UsageLedger,
        provider: Arc<dyn Provider>,
    ) -> Self {
        Self {
            config,
            store,
            ledger,
            provider,
            registry: RwLock::new(CredentialRegistry::default()),
        }
    }

    fn read_registry(&self) -> RwLockReadGuard<'_, CredentialRegistry> {
        self.registry.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_registry(&self) -> RwLockWriteGuard<'_, CredentialRegistry> {
        self.registry.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Reload credentials from the store and make sure every model has a
    /// ledger counter. Returns the number of credentials loaded.
    pub async fn refresh(&self) -> Result<usize, StoreError> {
        let credentials = self.store.list().await?;

        for credential in &credentials {
            for (model, slot) in &credential.models {
                if let Err(e) = self
                    .ledger
                    .register(&credential.id, model, slot.limit, slot.window)
                    .await
                {
                    warn!(credential = %credential.id, model = %model, "Failed to register quota counter: {e}");
                }
            }
        }

        let count = credentials.len();
        self.write_registry().replace(credentials);
        debug!("Credential registry refreshed ({count} credentials)");
        Ok(count)
    }

    /// Snapshot of one credential as the pool currently sees it.
    pub fn credential(&self, id: &str) -> Option<Credential> {
        self.read_registry().get(id).cloned()
    }

    async fn candidates(&self, now: DateTime<Utc>) -> Vec<Candidate> {
        let mut writes = Vec::new();
        let live: Vec<(String, String, u32, Option<Instant>)> = {
            let mut registry = self.write_registry();
            for credential in registry.iter_mut() {
                let expired: Vec<String> = credential
                    .models
                    .iter()
                    .filter(|(_, slot)| slot.throttled_until.is_some_and(|until| now >= until))
                    .map(|(model, _)| model.clone())
                    .collect();
                let state_changed = credential.recover(now);
                for model in expired {
                    writes.push(StoreWrite::Throttle(credential.id.clone(), model, None));
                }
                if state_changed {
                    info!(credential = %credential.id, "🔓 Credential recovered after window reset");
                    writes.push(StoreWrite::State(credential.id.clone(), credential.state));
                }
            }

            registry
                .iter()
                .flat_map(|credential| {
                    credential.live_models(now).map(move |(model, slot)| {
                        (credential.id.clone(), model.clone(), credential.priority, slot.last_used)
                    })
                })
                .collect()
        };
        self.persist(writes).await;

        let mut candidates = Vec::with_capacity(live.len());
        for (credential_id, model, priority, last_used) in live {
            let counter = match self.ledger.read_at(&credential_id, &model, now).await {
                Ok(counter) => counter,
                Err(e) => {
                    warn!(credential = %credential_id, model = %model, "Skipping candidate, ledger read failed: {e}");
                    continue;
                }
            };
            let window_end = counter.window_end(self.ledger.timezone());
            if counter.is_exhausted() {
                self.throttle(&credential_id, &model, window_end, now).await;
                continue;
            }
            candidates.push(Candidate {
                credential_id,
                model,
                priority,
                remaining: counter.remaining(),
                limit: counter.limit,
                window_end,
                last_used,
            });
        }

        candidates.sort_by_key(|c| (c.priority, Reverse(c.remaining), c.last_used));
        candidates
    }

    /// Re-check a candidate right before use and stamp it as used.
    fn checkout(&self, candidate: &Candidate, now: DateTime<Utc>) -> Option<Credential> {
        let mut registry = self.write_registry();
        let credential = registry.get_mut(&candidate.credential_id)?;
        if credential.state == CredentialState::Disabled {
            return None;
        }
        let slot = credential.models.get_mut(&candidate.model)?;
        if !slot.enabled || slot.is_throttled(now) {
            return None;
        }
        slot.last_used = Some(Instant::now());
        Some(credential.clone())
    }

    async fn invoke_once(&self, credential: &Credential, model: &str, prompt: &str) -> Result<String, ProviderError> {
        let call = self
            .provider
            .invoke(credential, model, prompt, &self.config.system_prompt);
        match tokio::time::timeout(self.config.provider_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Transport(format!(
                "timed out after {}ms",
                self.config.provider_timeout.as_millis()
            ))),
        }
    }

    /// Transport failures get exactly one retry after the backoff.
    async fn invoke_with_retry(
        &self,
        credential: &Credential,
        model: &str,
        prompt: &str,
    ) -> Result<String, ProviderError> {
        match self.invoke_once(credential, model, prompt).await {
            Err(e) if e.kind() == ErrorKind::Transport => {
                warn!(credential = %credential.id, model, "Transport failure, retrying once: {e}");
                tokio::time::sleep(self.config.transport_backoff).await;
                self.invoke_once(credential, model, prompt).await
            }
            other => other,
        }
    }

    async fn on_failure(&self, candidate: &Candidate, err: &ProviderError, now: DateTime<Utc>) {
        let id = &candidate.credential_id;
        let model = &candidate.model;
        match err.kind() {
            ErrorKind::Auth => {
                if let Some(credential) = self.write_registry().get_mut(id) {
                    credential.state = CredentialState::Disabled;
                }
                self.persist(vec![StoreWrite::State(id.clone(), CredentialState::Disabled)])
                    .await;
                error!(
                    target: ALERT_TARGET,
                    credential = %id,
                    "🔒 Credential {id} disabled after authentication failure: {err}"
                );
            }
            ErrorKind::Quota => {
                warn!(credential = %id, model = %model, "Provider reported quota exhaustion: {err}");
                self.throttle(id, model, candidate.window_end, now).await;
            }
            ErrorKind::Transport | ErrorKind::Unknown => {
                warn!(credential = %id, model = %model, "Candidate failed: {err}");
            }
        }
    }

    /// Throttle (credential, model) until `until`, writing the change through.
    async fn throttle(&self, credential_id: &str, model: &str, until: DateTime<Utc>, now: DateTime<Utc>) {
        let mut writes = vec![StoreWrite::Throttle(
            credential_id.to_string(),
            model.to_string(),
            Some(until),
        )];
        {
            let mut registry = self.write_registry();
            let Some(credential) = registry.get_mut(credential_id) else {
                return;
            };
            if credential.throttle_model(model, until, now) {
                writes.push(StoreWrite::State(credential_id.to_string(), credential.state));
            }
        }
        info!(credential = credential_id, model, until = %until, "⏸️ Quota throttled");
        self.persist(writes).await;
    }

    async fn persist(&self, writes: Vec<StoreWrite>) {
        for write in writes {
            let result = match &write {
                StoreWrite::State(id, state) => self.store.set_state(id, *state).await,
                StoreWrite::Throttle(id, model, until) => self.store.set_model_throttle(id, model, *until).await,
            };
            if let Err(e) = result {
                warn!("Failed to persist credential change: {e}");
            }
        }
    }

    /// Count one successful call against the ledger. Returns the attempt to
    /// record when the ledger could not be updated.
    async fn commit(&self, candidate: &Candidate, now: DateTime<Utc>) -> Option<Attempt> {
        let id = &candidate.credential_id;
        let model = &candidate.model;
        match self.ledger.commit_usage(id, model, 1).await {
            Ok(used) => {
                if used >= candidate.limit {
                    self.throttle(id, model, candidate.window_end, now).await;
                }
                None
            }
            Err(LedgerError::Exhausted { used, limit }) => {
                info!(credential = %id, model = %model, used, limit, "Quota filled by a concurrent dispatch");
                self.throttle(id, model, candidate.window_end, now).await;
                None
            }
            Err(e) => {
                warn!(credential = %id, model = %model, "Usage not recorded: {e}");
                Some(Attempt {
                    credential_id: id.clone(),
                    model: model.clone(),
                    error_kind: ErrorKind::Transport,
                    detail: e.to_string(),
                })
            }
        }
    }

    /// Run one request across the pool. Never fails: exhaustion yields the
    /// fallback reply with the escalation flag set.
    pub async fn route(&self, mut request: DispatchRequest) -> DispatchResult {
        let started = Instant::now();
        let candidates = self.candidates(Utc::now()).await;

        if candidates.is_empty() {
            warn!(conversation = request.conversation_id, "No eligible credentials, using fallback reply");
            return DispatchResult::fallback(
                request,
                FallbackReason::NoCandidates,
                &self.config.fallback_reply,
                started.elapsed(),
            );
        }

        for candidate in &candidates {
            let Some(credential) = self.checkout(candidate, Utc::now()) else {
                debug!(credential = %candidate.credential_id, model = %candidate.model, "Candidate no longer eligible");
                continue;
            };

            match self
                .invoke_with_retry(&credential, &candidate.model, &request.text)
                .await
            {
                Ok(text) => {
                    let ledger_failure = self.commit(candidate, Utc::now()).await;
                    let mut result = DispatchResult::success(
                        request,
                        text,
                        &candidate.credential_id,
                        &candidate.model,
                        started.elapsed(),
                    );
                    if let Some(attempt) = ledger_failure {
                        result.error_kind = Some(attempt.error_kind);
                        result.attempts.push(attempt);
                    }
                    return result;
                }
                Err(e) => {
                    self.on_failure(candidate, &e, Utc::now()).await;
                    request.attempt_history.push(Attempt {
                        credential_id: candidate.credential_id.clone(),
                        model: candidate.model.clone(),
                        error_kind: e.kind(),
                        detail: e.to_string(),
                    });
                }
            }
        }

        warn!(
            conversation = request.conversation_id,
            attempts = request.attempt_history.len(),
            "All candidates failed, using fallback reply"
        );
        DispatchResult::fallback(
            request,
            FallbackReason::AllCandidatesExhausted,
            &self.config.fallback_reply,
            started.elapsed(),
        )
    }
}

#[async_trait]
impl Dispatcher for CredentialPool {
    async fn dispatch(&self, request: DispatchRequest) -> DispatchResult {
        self.route(request).await
    }
}

/// Periodically reload admin edits from the credential store.
pub fn spawn_refresh_loop(pool: Arc<CredentialPool>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.tick().await;
        loop {
            interval.tick().await;
            if let Err(e) = pool.refresh().await {
                warn!("Credential refresh failed: {e}");
            }
        }
    })
}
