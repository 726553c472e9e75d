//! Provider credentials, their state machine and the store contract.
//!
//! ```text
//! ENABLED ──quota exhausted──▶ THROTTLED ──window reset──▶ ENABLED
//!    │                            │
//!    └────────auth error──────────┴──────▶ DISABLED (admin re-enable only)
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::chatbot::ledger::WindowKind;
use crate::provider::ProviderFamily;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialState {
    Enabled,
    Throttled,
    Disabled,
}

impl CredentialState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialState::Enabled => "enabled",
            CredentialState::Throttled => "throttled",
            CredentialState::Disabled => "disabled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "enabled" => Some(CredentialState::Enabled),
            "throttled" => Some(CredentialState::Throttled),
            "disabled" => Some(CredentialState::Disabled),
            _ => None,
        }
    }
}

/// One model a credential may call, with its quota settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSlot {
    pub enabled: bool,
    pub limit: u64,
    pub window: WindowKind,
    /// Set while the model is throttled; cleared once the instant passes.
    pub throttled_until: Option<DateTime<Utc>>,
    /// Process-local, used only for least-recently-used tie breaking.
    pub last_used: Option<Instant>,
}

impl ModelSlot {
    pub fn new(limit: u64, window: WindowKind) -> Self {
        Self {
            enabled: true,
            limit,
            window,
            throttled_until: None,
            last_used: None,
        }
    }

    pub fn is_throttled(&self, now: DateTime<Utc>) -> bool {
        self.throttled_until.is_some_and(|until| now < until)
    }
}

#[derive(Clone)]
pub struct Credential {
    pub id: String,
    pub family: ProviderFamily,
    pub api_key: String,
    pub state: CredentialState,
    /// Lower is preferred.
    pub priority: u32,
    pub models: BTreeMap<String, ModelSlot>,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("id", &self.id)
            .field("family", &self.family)
            .field("api_key", &"<redacted>")
            .field("state", &self.state)
            .field("priority", &self.priority)
            .field("models", &self.models)
            .finish()
    }
}

impl Credential {
    /// Models that may be selected right now, ignoring quota counters.
    pub fn live_models(&self, now: DateTime<Utc>) -> impl Iterator<Item = (&String, &ModelSlot)> {
        let usable = self.state != CredentialState::Disabled;
        self.models
            .iter()
            .filter(move |(_, slot)| usable && slot.enabled && !slot.is_throttled(now))
    }

    /// Clear expired model throttles and recompute ENABLED/THROTTLED.
    /// Returns true when the credential state changed.
    pub fn recover(&mut self, now: DateTime<Utc>) -> bool {
        for slot in self.models.values_mut() {
            if slot.throttled_until.is_some_and(|until| now >= until) {
                slot.throttled_until = None;
            }
        }
        self.sync_state(now)
    }

    /// Throttle one model until `until`. Returns true when the credential as a
    /// whole flipped to THROTTLED.
    pub fn throttle_model(&mut self, model: &str, until: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        if let Some(slot) = self.models.get_mut(model) {
            slot.throttled_until = Some(until);
        }
        self.sync_state(now)
    }

    fn sync_state(&mut self, now: DateTime<Utc>) -> bool {
        if self.state == CredentialState::Disabled {
            return false;
        }
        let any_open = self
            .models
            .values()
            .any(|slot| slot.enabled && !slot.is_throttled(now));
        let next = if any_open {
            CredentialState::Enabled
        } else {
            CredentialState::Throttled
        };
        let changed = next != self.state;
        self.state = next;
        changed
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("credential not found: {0}")]
    NotFound(String),
    #[error("credential store failure: {0}")]
    Backend(String),
}

/// Persistence contract for credentials. Admin tooling writes here; the pool
/// reads it periodically and writes its own transitions back.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn list(&self) -> Result<Vec<Credential>, StoreError>;

    /// Create or update a credential. An existing credential keeps its state.
    async fn upsert(&self, credential: &Credential) -> Result<(), StoreError>;

    async fn set_state(&self, id: &str, state: CredentialState) -> Result<(), StoreError>;

    async fn set_model_throttle(
        &self,
        id: &str,
        model: &str,
        until: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;
}

/// In-memory credential arena with an id index.
#[derive(Debug, Default)]
pub struct CredentialRegistry {
    slots: Vec<Credential>,
    index: HashMap<String, usize>,
}

impl CredentialRegistry {
    pub fn new(credentials: Vec<Credential>) -> Self {
        let mut registry = Self::default();
        registry.replace(credentials);
        registry
    }

    /// Swap in a fresh list from the store, keeping process-local LRU data.
    pub fn replace(&mut self, credentials: Vec<Credential>) {
        let mut previous: HashMap<String, Credential> = self
            .slots
            .drain(..)
            .map(|c| (c.id.clone(), c))
            .collect();

        self.index.clear();
        for mut credential in credentials {
            if let Some(old) = previous.remove(&credential.id) {
                for (model, slot) in credential.models.iter_mut() {
                    if let Some(old_slot) = old.models.get(model) {
                        slot.last_used = old_slot.last_used;
                    }
                }
            }
            self.index.insert(credential.id.clone(), self.slots.len());
            self.slots.push(credential);
        }
    }

    pub fn get(&self, id: &str) -> Option<&Credential> {
        self.index.get(id).and_then(|&idx| self.slots.get(idx))
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Credential> {
        match self.index.get(id) {
            Some(&idx) => self.slots.get_mut(idx),
            None => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Credential> {
        self.slots.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Credential> {
        self.slots.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }
}
