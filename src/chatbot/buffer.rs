//! Per-conversation debounce buffers.
//!
//! Each conversation collects messages until it has been quiet for `delay`,
//! bounded by `max_delay` from the first buffered message. Every re-arm bumps
//! the conversation's `epoch`; a timer that fires with an old epoch does
//! nothing. A flush hands an immutable snapshot to the [`FlushSink`] and
//! messages arriving while it is in flight wait for the result before a new
//! cycle starts.
//!
//! Evicting an idle conversation keeps its highest message id, so a message
//! redelivered after eviction is still recognized as a duplicate.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::chatbot::message::{DispatchRequest, DispatchResult, InboundMessage};

/// Message ids remembered per conversation for deduplication.
const SEEN_IDS_PER_CONVERSATION: usize = 512;
/// Evicted conversations whose high-water mark is kept.
const EVICTED_MARKS_MAX: usize = 65_536;

#[derive(Debug, Clone, Copy)]
pub struct BufferConfig {
    /// Quiet period before a burst is considered complete.
    pub delay: Duration,
    /// Upper bound on how long the first message of a burst may wait.
    pub max_delay: Duration,
}

/// Receives each flushed snapshot.
#[async_trait]
pub trait FlushSink: Send + Sync {
    async fn flush(&self, request: DispatchRequest) -> DispatchResult;
}

/// What happened to an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Buffered, debounce timer (re)armed.
    Buffered,
    /// Buffered and flushed immediately because the ceiling was reached.
    Flushed,
    /// Buffered behind an in-flight dispatch.
    Deferred,
    /// Already seen; dropped.
    Duplicate,
    /// Nothing to reply to.
    Ignored,
}

#[derive(Debug, Default)]
struct RecentIds {
    order: VecDeque<i64>,
    set: HashSet<i64>,
}

impl RecentIds {
    /// Returns false if `id` was already present.
    fn insert(&mut self, id: i64) -> bool {
        if !self.set.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > SEEN_IDS_PER_CONVERSATION {
            if let Some(oldest) = self.order.pop_front() {
                self.set.remove(&oldest);
            }
        }
        true
    }
}

/// Highest message id of each evicted conversation, oldest entries dropped first.
#[derive(Default)]
struct EvictedMarks {
    marks: HashMap<i64, i64>,
    order: VecDeque<i64>,
}

impl EvictedMarks {
    fn get(&self, conversation_id: i64) -> Option<i64> {
        self.marks.get(&conversation_id).copied()
    }

    fn record(&mut self, conversation_id: i64, mark: i64) {
        if self.marks.insert(conversation_id, mark).is_some() {
            return;
        }
        self.order.push_back(conversation_id);
        if self.order.len() > EVICTED_MARKS_MAX {
            if let Some(oldest) = self.order.pop_front() {
                self.marks.remove(&oldest);
            }
        }
    }
}

struct ConversationBufferState {
    pending: Vec<InboundMessage>,
    epoch: u64,
    timer: Option<JoinHandle<()>>,
    first_pending_at: Option<Instant>,
    flush_in_progress: bool,
    flush_seq: u64,
    last_flush_at: Option<Instant>,
    last_activity: Instant,
    seen: RecentIds,
    /// Ids at or below this were admitted before the state was last evicted.
    floor: Option<i64>,
    high_water: Option<i64>,
}

impl ConversationBufferState {
    fn new(now: Instant, floor: Option<i64>) -> Self {
        Self {
            pending: Vec::new(),
            epoch: 0,
            timer: None,
            first_pending_at: None,
            flush_in_progress: false,
            flush_seq: 0,
            last_flush_at: None,
            last_activity: now,
            seen: RecentIds::default(),
            floor,
            high_water: floor,
        }
    }

    /// Record `id` as seen; false if it is a duplicate.
    fn remember(&mut self, id: i64) -> bool {
        if self.floor.is_some_and(|floor| id <= floor) || !self.seen.insert(id) {
            return false;
        }
        self.high_water = Some(self.high_water.map_or(id, |mark| mark.max(id)));
        true
    }

    fn is_idle(&self, now: Instant, ttl: Duration) -> bool {
        self.pending.is_empty()
            && self.timer.is_none()
            && !self.flush_in_progress
            && now.duration_since(self.last_activity) >= ttl
    }
}

struct Inner {
    config: BufferConfig,
    sink: Arc<dyn FlushSink>,
    states: Mutex<HashMap<i64, ConversationBufferState>>,
    /// Locked after `states` when both are needed.
    evicted: Mutex<EvictedMarks>,
}

#[derive(Clone)]
pub struct ConversationBuffers {
    inner: Arc<Inner>,
}

impl ConversationBuffers {
    pub fn new(config: BufferConfig, sink: Arc<dyn FlushSink>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                sink,
                states: Mutex::new(HashMap::new()),
                evicted: Mutex::new(EvictedMarks::default()),
            }),
        }
    }

    fn states(&self) -> MutexGuard<'_, HashMap<i64, ConversationBufferState>> {
        self.inner
            .states
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn evicted(&self) -> MutexGuard<'_, EvictedMarks> {
        self.inner
            .evicted
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Accept one message for `conversation_id`.
    pub fn admit(&self, conversation_id: i64, message: InboundMessage) -> Admission {
        let now = Instant::now();
        let mut states = self.states();
        let state = states
            .entry(conversation_id)
            .or_insert_with(|| ConversationBufferState::new(now, self.evicted().get(conversation_id)));
        state.last_activity = now;

        if !state.remember(message.id) {
            debug!(conversation = conversation_id, message = message.id, "Duplicate message ignored");
            return Admission::Duplicate;
        }

        if state.pending.is_empty() {
            state.first_pending_at = Some(now);
        }
        state.pending.push(message);

        if state.flush_in_progress {
            debug!(conversation = conversation_id, "Dispatch in flight, message deferred");
            return Admission::Deferred;
        }

        if state.timer.is_some() && self.past_ceiling(state, now) {
            self.flush_locked(conversation_id, state);
            return Admission::Flushed;
        }

        self.arm(conversation_id, state);
        Admission::Buffered
    }

    /// Would waiting another full delay exceed the ceiling?
    fn past_ceiling(&self, state: &ConversationBufferState, now: Instant) -> bool {
        let first = state.first_pending_at.unwrap_or(now);
        now.duration_since(first) + self.inner.config.delay > self.inner.config.max_delay
    }

    /// Bump the epoch and (re)start the debounce timer.
    fn arm(&self, conversation_id: i64, state: &mut ConversationBufferState) {
        state.epoch += 1;
        if let Some(old) = state.timer.take() {
            old.abort();
        }

        let epoch = state.epoch;
        let delay = self.inner.config.delay;
        let buffers = self.clone();
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            buffers.fire(conversation_id, epoch);
        }));
    }

    fn fire(&self, conversation_id: i64, epoch: u64) {
        let mut states = self.states();
        let Some(state) = states.get_mut(&conversation_id) else {
            return;
        };
        if state.epoch != epoch || state.timer.is_none() {
            debug!(conversation = conversation_id, epoch, current = state.epoch, "Stale timer ignored");
            return;
        }
        // This task is the timer; it must not abort itself.
        state.timer = None;
        if state.flush_in_progress || state.pending.is_empty() {
            return;
        }
        self.flush_locked(conversation_id, state);
    }

    fn flush_locked(&self, conversation_id: i64, state: &mut ConversationBufferState) {
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        state.epoch += 1;

        let snapshot = std::mem::take(&mut state.pending);
        state.first_pending_at = None;
        state.flush_in_progress = true;
        state.flush_seq += 1;
        let seq = state.flush_seq;

        info!(
            conversation = conversation_id,
            messages = snapshot.len(),
            "⚡ Flushing buffered messages"
        );
        let request = DispatchRequest::from_snapshot(conversation_id, &snapshot);

        let buffers = self.clone();
        tokio::spawn(async move {
            let sink = buffers.inner.sink.clone();
            // Run the sink on its own task so a panic there still completes the flush.
            let outcome = tokio::spawn(async move { sink.flush(request).await }).await;
            if let Err(e) = outcome {
                error!(conversation = conversation_id, "Flush task failed: {e}");
            }
            buffers.complete(conversation_id, seq);
        });
    }

    fn complete(&self, conversation_id: i64, seq: u64) {
        let now = Instant::now();
        let mut states = self.states();
        let Some(state) = states.get_mut(&conversation_id) else {
            return;
        };
        if state.flush_seq != seq || !state.flush_in_progress {
            debug!(conversation = conversation_id, seq, "Stale flush result ignored");
            return;
        }

        state.flush_in_progress = false;
        state.last_flush_at = Some(now);
        state.last_activity = now;

        if state.pending.is_empty() {
            return;
        }
        if self.past_ceiling(state, now) {
            self.flush_locked(conversation_id, state);
        } else {
            self.arm(conversation_id, state);
        }
    }

    /// Drop states that are empty, unarmed, not in flight and idle for `ttl`.
    pub fn evict_idle(&self, ttl: Duration) -> usize {
        let now = Instant::now();
        let mut states = self.states();
        let idle: Vec<i64> = states
            .iter()
            .filter(|(_, state)| state.is_idle(now, ttl))
            .map(|(id, _)| *id)
            .collect();

        let mut evicted = self.evicted();
        for conversation_id in &idle {
            if let Some(mark) = states.remove(conversation_id).and_then(|state| state.high_water) {
                evicted.record(*conversation_id, mark);
            }
        }
        idle.len()
    }

    /// Run `evict_idle(ttl)` every `every`.
    pub fn spawn_sweeper(&self, every: Duration, ttl: Duration) -> JoinHandle<()> {
        let buffers = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                interval.tick().await;
                let evicted = buffers.evict_idle(ttl);
                if evicted > 0 {
                    debug!("💤 Evicted {evicted} idle conversation buffer(s)");
                }
            }
        })
    }

    /// Number of conversations with live state.
    pub fn len(&self) -> usize {
        self.states().len()
    }

    pub fn is_empty(&self) -> bool {
        self.states().is_empty()
    }

    pub fn pending_len(&self, conversation_id: i64) -> usize {
        self.states()
            .get(&conversation_id)
            .map_or(0, |state| state.pending.len())
    }

    pub fn is_in_flight(&self, conversation_id: i64) -> bool {
        self.states()
            .get(&conversation_id)
            .is_some_and(|state| state.flush_in_progress)
    }

    /// When this conversation's last flush completed.
    pub fn last_flush_at(&self, conversation_id: i64) -> Option<Instant> {
        self.states()
            .get(&conversation_id)
            .and_then(|state| state.last_flush_at)
    }
}
