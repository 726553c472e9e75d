//! Usage ledger: quota counters per (credential, model).
//!
//! All writes go through a version-checked compare-and-swap on the backing
//! [`UsageStore`]. Windows are fixed calendar windows (a day or a month) in
//! the operator's timezone.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::Deserialize;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowKind {
    Daily,
    Monthly,
}

impl WindowKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WindowKind::Daily => "daily",
            WindowKind::Monthly => "monthly",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "daily" => Some(WindowKind::Daily),
            "monthly" => Some(WindowKind::Monthly),
            _ => None,
        }
    }

    /// Start of the window containing `now`.
    pub fn window_start(&self, now: DateTime<Utc>, tz: Tz) -> DateTime<Utc> {
        let today = now.with_timezone(&tz).date_naive();
        let first = match self {
            WindowKind::Daily => today,
            WindowKind::Monthly => today.with_day(1).unwrap_or(today),
        };
        local_midnight(first, tz)
    }

    /// Start of the window following the one that began at `start`.
    pub fn window_end(&self, start: DateTime<Utc>, tz: Tz) -> DateTime<Utc> {
        let day = start.with_timezone(&tz).date_naive();
        let next = match self {
            WindowKind::Daily => day.succ_opt(),
            WindowKind::Monthly if day.month() == 12 => NaiveDate::from_ymd_opt(day.year() + 1, 1, 1),
            WindowKind::Monthly => NaiveDate::from_ymd_opt(day.year(), day.month() + 1, 1),
        };
        match next {
            Some(date) => local_midnight(date, tz),
            None => start,
        }
    }
}

fn local_midnight(date: NaiveDate, tz: Tz) -> DateTime<Utc> {
    let naive = date.and_time(NaiveTime::MIN);
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| Utc.from_utc_datetime(&naive))
}

#[derive(Debug, Clone, PartialEq)]
pub struct QuotaCounter {
    pub used: u64,
    pub limit: u64,
    pub window_start: DateTime<Utc>,
    pub window_kind: WindowKind,
    /// Bumped on every committed write.
    pub version: u64,
}

impl QuotaCounter {
    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.used)
    }

    pub fn is_exhausted(&self) -> bool {
        self.used >= self.limit
    }

    pub fn window_end(&self, tz: Tz) -> DateTime<Utc> {
        self.window_kind.window_end(self.window_start, tz)
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LedgerError {
    #[error("counter for {credential_id}/{model} changed concurrently")]
    Conflict { credential_id: String, model: String },
    #[error("quota exhausted ({used}/{limit})")]
    Exhausted { used: u64, limit: u64 },
    #[error("gave up after {attempts} conflicting commits")]
    Contended { attempts: u32 },
    #[error("no counter registered for {credential_id}/{model}")]
    Unregistered { credential_id: String, model: String },
    #[error("usage store failure: {0}")]
    Storage(String),
}

/// Backing store for counters. `compare_and_swap` must only write when the
/// stored version equals `expected.version`, and must then store `next` with
/// its version.
#[async_trait]
pub trait UsageStore: Send + Sync {
    async fn load(&self, credential_id: &str, model: &str) -> Result<Option<QuotaCounter>, LedgerError>;

    /// Create the counter, or update limit and window kind of an existing one
    /// without touching `used`.
    async fn register(
        &self,
        credential_id: &str,
        model: &str,
        limit: u64,
        window_kind: WindowKind,
        window_start: DateTime<Utc>,
    ) -> Result<(), LedgerError>;

    async fn compare_and_swap(
        &self,
        credential_id: &str,
        model: &str,
        expected: &QuotaCounter,
        next: &QuotaCounter,
    ) -> Result<(), LedgerError>;
}

#[derive(Clone)]
pub struct UsageLedger {
    store: Arc<dyn UsageStore>,
    tz: Tz,
    max_retries: u32,
}

impl UsageLedger {
    pub fn new(store: Arc<dyn UsageStore>, tz: Tz, max_retries: u32) -> Self {
        Self {
            store,
            tz,
            max_retries,
        }
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    pub async fn register(
        &self,
        credential_id: &str,
        model: &str,
        limit: u64,
        window_kind: WindowKind,
    ) -> Result<(), LedgerError> {
        let start = window_kind.window_start(Utc::now(), self.tz);
        self.store
            .register(credential_id, model, limit, window_kind, start)
            .await
    }

    pub async fn read(&self, credential_id: &str, model: &str) -> Result<QuotaCounter, LedgerError> {
        self.read_at(credential_id, model, Utc::now()).await
    }

    /// Latest committed counter, rolled over first if its window has ended.
    pub async fn read_at(
        &self,
        credential_id: &str,
        model: &str,
        now: DateTime<Utc>,
    ) -> Result<QuotaCounter, LedgerError> {
        for _ in 0..=self.max_retries {
            let counter = self.load(credential_id, model).await?;
            if now < counter.window_end(self.tz) {
                return Ok(counter);
            }
            match self.roll_over(credential_id, model, &counter, now).await {
                Ok(fresh) => return Ok(fresh),
                Err(LedgerError::Conflict { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(LedgerError::Contended {
            attempts: self.max_retries + 1,
        })
    }

    /// One compare-and-swap increment. Returns the new `used` value.
    pub async fn increment_and_commit(
        &self,
        credential_id: &str,
        model: &str,
        amount: u64,
    ) -> Result<u64, LedgerError> {
        self.increment_and_commit_at(credential_id, model, amount, Utc::now())
            .await
    }

    pub async fn increment_and_commit_at(
        &self,
        credential_id: &str,
        model: &str,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<u64, LedgerError> {
        let current = self.read_at(credential_id, model, now).await?;
        let used = current.used.saturating_add(amount);
        if used > current.limit {
            return Err(LedgerError::Exhausted {
                used: current.used,
                limit: current.limit,
            });
        }
        let next = QuotaCounter {
            used,
            version: current.version + 1,
            ..current.clone()
        };
        self.store
            .compare_and_swap(credential_id, model, &current, &next)
            .await?;
        Ok(used)
    }

    /// Increment, re-reading and retrying on conflicts a bounded number of
    /// times before reporting `Contended`.
    pub async fn commit_usage(
        &self,
        credential_id: &str,
        model: &str,
        amount: u64,
    ) -> Result<u64, LedgerError> {
        let attempts = self.max_retries + 1;
        for attempt in 1..=attempts {
            match self.increment_and_commit(credential_id, model, amount).await {
                Err(LedgerError::Conflict { .. }) => {
                    debug!(credential = credential_id, model, attempt, "Ledger conflict, retrying");
                }
                other => return other,
            }
        }
        Err(LedgerError::Contended { attempts })
    }

    /// Zero `used` and move `window_start` to the window containing now.
    pub async fn reset_window(&self, credential_id: &str, model: &str) -> Result<QuotaCounter, LedgerError> {
        let now = Utc::now();
        for _ in 0..=self.max_retries {
            let counter = self.load(credential_id, model).await?;
            match self.roll_over(credential_id, model, &counter, now).await {
                Err(LedgerError::Conflict { .. }) => continue,
                other => return other,
            }
        }
        Err(LedgerError::Contended {
            attempts: self.max_retries + 1,
        })
    }

    async fn load(&self, credential_id: &str, model: &str) -> Result<QuotaCounter, LedgerError> {
        self.store
            .load(credential_id, model)
            .await?
            .ok_or_else(|| LedgerError::Unregistered {
                credential_id: credential_id.to_string(),
                model: model.to_string(),
            })
    }

    async fn roll_over(
        &self,
        credential_id: &str,
        model: &str,
        counter: &QuotaCounter,
        now: DateTime<Utc>,
    ) -> Result<QuotaCounter, LedgerError> {
        let fresh = QuotaCounter {
            used: 0,
            window_start: counter.window_kind.window_start(now, self.tz),
            version: counter.version + 1,
            ..counter.clone()
        };
        self.store
            .compare_and_swap(credential_id, model, counter, &fresh)
            .await?;
        info!(
            credential = credential_id,
            model,
            window_start = %fresh.window_start,
            "Quota window reset"
        );
        Ok(fresh)
    }
}
