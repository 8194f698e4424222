//! Monthly usage accounting. Increments go through a compare-and-swap loop
//! so `consumed_minutes` only ever grows, and quota resets happen by key
//! change on the month boundary rather than by mutating a row.

use crate::errors::SvcError;
use chrono::{Datelike, TimeZone, Utc};
use labpool_common::{
    now_ts,
    store::definitions::{CasOutcome, Store},
    types::{
        plan::PlanTier,
        usage::{UsageKey, UsageRecord},
    },
};
use serde::Serialize;

/// Sessions shorter than this are not billed.
const MIN_BILLABLE_SECS: i64 = 30;

/// Result of a quota check.
#[derive(Debug, Clone, PartialEq)]
pub struct QuotaCheck {
    pub allowed: bool,
    pub consumed_minutes: i64,
    /// `-1` means unlimited.
    pub remaining_minutes: i64,
    pub resets_at: Option<String>,
}

/// Usage summary surfaced to the owner.
#[derive(Debug, Clone, Serialize)]
pub struct UsageStats {
    pub owner_id: String,
    pub usage_month: String,
    pub plan: PlanTier,
    pub quota_minutes: i64,
    pub consumed_minutes: i64,
    pub remaining_minutes: i64,
    pub session_count: i64,
    pub resets_at: String,
}

/// The current month as `YYYY-MM` in UTC.
pub fn month_of(now: i64) -> String {
    let at = Utc.timestamp(now, 0);
    format!("{:04}-{:02}", at.year(), at.month())
}

/// First instant of the next calendar month, ISO 8601.
pub fn next_month_start(now: i64) -> String {
    let at = Utc.timestamp(now, 0);
    let next = if at.month() == 12 {
        Utc.ymd(at.year() + 1, 1, 1)
    } else {
        Utc.ymd(at.year(), at.month() + 1, 1)
    };
    next.and_hms(0, 0, 0).to_rfc3339()
}

pub struct UsageLedger<S: Store> {
    store: S,
}

impl<S: Store> Clone for UsageLedger<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<S: Store> UsageLedger<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    async fn consumed(&self, owner_id: &str, usage_month: &str) -> Result<i64, SvcError> {
        let record: Option<UsageRecord> = self
            .store
            .find_obj(&UsageKey::new(owner_id, usage_month))
            .await?;
        Ok(record.map(|r| r.consumed_minutes).unwrap_or(0))
    }

    /// Whether the owner may start a new session under the given quota.
    pub async fn check_quota(
        &self,
        owner_id: &str,
        quota_minutes: i64,
    ) -> Result<QuotaCheck, SvcError> {
        self.check_quota_at(owner_id, quota_minutes, now_ts()).await
    }

    pub async fn check_quota_at(
        &self,
        owner_id: &str,
        quota_minutes: i64,
        now: i64,
    ) -> Result<QuotaCheck, SvcError> {
        if quota_minutes == -1 {
            return Ok(QuotaCheck {
                allowed: true,
                consumed_minutes: 0,
                remaining_minutes: -1,
                resets_at: None,
            });
        }
        let consumed = self.consumed(owner_id, &month_of(now)).await?;
        let remaining = quota_minutes - consumed;
        Ok(QuotaCheck {
            allowed: remaining > 0,
            consumed_minutes: consumed,
            remaining_minutes: remaining.max(0),
            resets_at: Some(next_month_start(now)),
        })
    }

    /// Add the given minutes to the owner's month. The write is an atomic
    /// add: concurrent increments both land.
    pub async fn add_minutes(
        &self,
        owner_id: &str,
        minutes: i64,
        plan: PlanTier,
        quota_minutes: i64,
        now: i64,
    ) -> Result<i64, SvcError> {
        let usage_month = month_of(now);
        loop {
            let key = UsageKey::new(owner_id, &usage_month);
            match self.store.find_obj::<UsageRecord>(&key).await? {
                None => {
                    let record = UsageRecord {
                        owner_id: owner_id.to_string(),
                        usage_month: usage_month.clone(),
                        consumed_minutes: minutes.max(0),
                        session_count: 1,
                        plan: Some(plan),
                        quota_minutes: Some(quota_minutes),
                        updated_at: now,
                    };
                    if let CasOutcome::Committed = self.store.create_if_absent(&record).await? {
                        return Ok(record.consumed_minutes);
                    }
                }
                Some(current) => {
                    let updated = current.incremented(minutes, now);
                    if let CasOutcome::Committed =
                        self.store.compare_and_put(&current, &updated).await?
                    {
                        return Ok(updated.consumed_minutes);
                    }
                }
            }
            // lost the race against another increment, re-read and retry
        }
    }

    /// Record the usage of a finished session. Billed to the month the
    /// session ended in; sub-30-second sessions are free.
    pub async fn record_session(
        &self,
        owner_id: &str,
        started_at: i64,
        ended_at: i64,
        plan: PlanTier,
        quota_minutes: i64,
    ) -> Result<(), SvcError> {
        let elapsed_secs = (ended_at - started_at).max(0);
        if elapsed_secs < MIN_BILLABLE_SECS {
            return Ok(());
        }
        let minutes = elapsed_secs / 60;
        self.add_minutes(owner_id, minutes, plan, quota_minutes, ended_at)
            .await?;
        tracing::info!(
            owner.id = owner_id,
            minutes,
            "Recorded session usage"
        );
        Ok(())
    }

    /// Usage summary for the owner's current month.
    pub async fn stats(
        &self,
        owner_id: &str,
        plan: PlanTier,
        quota_minutes: i64,
        now: i64,
    ) -> Result<UsageStats, SvcError> {
        let usage_month = month_of(now);
        let record: Option<UsageRecord> = self
            .store
            .find_obj(&UsageKey::new(owner_id, &usage_month))
            .await?;
        let (consumed, session_count) = record
            .map(|r| (r.consumed_minutes, r.session_count))
            .unwrap_or((0, 0));
        let remaining = if quota_minutes == -1 {
            -1
        } else {
            (quota_minutes - consumed).max(0)
        };
        Ok(UsageStats {
            owner_id: owner_id.to_string(),
            usage_month,
            plan,
            quota_minutes,
            consumed_minutes: consumed,
            remaining_minutes: remaining,
            session_count,
            resets_at: next_month_start(now),
        })
    }
}
