//! Dispatch sequencer: one AI call in flight per conversation, a global cap
//! on concurrent calls and a bounded queue behind it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::{Semaphore, TryAcquireError};
use tracing::{debug, warn};

use crate::chatbot::message::{DispatchRequest, DispatchResult, FallbackReason};

/// Whatever actually answers a request (the credential pool in production).
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, request: DispatchRequest) -> DispatchResult;
}

#[derive(Debug, Clone)]
pub struct SequencerConfig {
    /// Global cap on concurrent dispatches.
    pub max_concurrent: usize,
    /// Submissions allowed to wait for a permit once the cap is reached.
    pub max_queue_depth: usize,
    pub fallback_reply: String,
}

type Lane = Arc<tokio::sync::Mutex<()>>;

pub struct DispatchSequencer {
    dispatcher: Arc<dyn Dispatcher>,
    config: SequencerConfig,
    permits: Arc<Semaphore>,
    lanes: Mutex<HashMap<i64, Lane>>,
    waiting: AtomicUsize,
    in_flight: AtomicUsize,
}

/// Counts itself in an atomic for as long as it lives.
struct Gauge<'a>(&'a AtomicUsize);

impl<'a> Gauge<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }

    fn try_enter(counter: &'a AtomicUsize, limit: usize) -> Option<Self> {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < limit).then_some(n + 1))
            .ok()
            .map(|_| Self(counter))
    }
}

impl Drop for Gauge<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Holds a conversation lane; drops the map entry when nobody else needs it.
struct LaneClaim<'a> {
    sequencer: &'a DispatchSequencer,
    conversation_id: i64,
    lane: Lane,
}

impl Drop for LaneClaim<'_> {
    fn drop(&mut self) {
        let mut lanes = self.sequencer.lanes();
        // Only the map and this claim still reference the lane.
        if lanes
            .get(&self.conversation_id)
            .is_some_and(|lane| Arc::ptr_eq(lane, &self.lane) && Arc::strong_count(lane) == 2)
        {
            lanes.remove(&self.conversation_id);
        }
    }
}

impl DispatchSequencer {
    pub fn new(dispatcher: Arc<dyn Dispatcher>, config: SequencerConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            dispatcher,
            config,
            permits,
            lanes: Mutex::new(HashMap::new()),
            waiting: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
        }
    }

    fn lanes(&self) -> MutexGuard<'_, HashMap<i64, Lane>> {
        self.lanes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn claim(&self, conversation_id: i64) -> LaneClaim<'_> {
        let lane = self.lanes().entry(conversation_id).or_default().clone();
        LaneClaim {
            sequencer: self,
            conversation_id,
            lane,
        }
    }

    /// Dispatch `request` once its conversation's previous dispatch has
    /// resolved and a global permit is free. Never fails: a full queue
    /// yields the fallback reply.
    pub async fn submit(&self, request: DispatchRequest) -> DispatchResult {
        let claim = self.claim(request.conversation_id);
        // tokio's Mutex wakes waiters in FIFO order.
        let _turn = claim.lane.lock().await;
        self.run(request).await
    }

    async fn run(&self, request: DispatchRequest) -> DispatchResult {
        let started = Instant::now();
        let _permit = match self.permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::Closed) => return self.shed(request, started),
            Err(TryAcquireError::NoPermits) => {
                let Some(_queued) = Gauge::try_enter(&self.waiting, self.config.max_queue_depth) else {
                    return self.shed(request, started);
                };
                debug!(conversation = request.conversation_id, "Waiting for a dispatch permit");
                match self.permits.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return self.shed(request, started),
                }
            }
        };

        let _active = Gauge::enter(&self.in_flight);
        self.dispatcher.dispatch(request).await
    }

    fn shed(&self, request: DispatchRequest, started: Instant) -> DispatchResult {
        warn!(
            conversation = request.conversation_id,
            queued = self.queued(),
            "Dispatch queue full, answering with fallback"
        );
        DispatchResult::fallback(
            request,
            FallbackReason::Overloaded,
            &self.config.fallback_reply,
            started.elapsed(),
        )
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn queued(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    /// Conversations that currently hold or wait on a lane.
    pub fn active_lanes(&self) -> usize {
        self.lanes().len()
    }
}

#[async_trait]
impl Dispatcher for DispatchSequencer {
    async fn dispatch(&self, request: DispatchRequest) -> DispatchResult {
        self.submit(request).await
    }
}
