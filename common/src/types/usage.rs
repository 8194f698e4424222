//! Per-owner monthly usage accounting. Rows are keyed by owner and calendar
//! month, so the quota resets by key change rather than by mutation.

use crate::store::definitions::{ObjectKey, StorableObject, StorableObjectType};
use crate::types::plan::PlanTier;
use serde::{Deserialize, Serialize};

/// Consumed minutes for one owner in one calendar month (`YYYY-MM`, UTC).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct UsageRecord {
    pub owner_id: String,
    pub usage_month: String,
    pub consumed_minutes: i64,
    pub session_count: i64,
    #[serde(default)]
    pub plan: Option<PlanTier>,
    #[serde(default)]
    pub quota_minutes: Option<i64>,
    pub updated_at: i64,
}

impl UsageRecord {
    /// A copy with the given minutes added and the session count bumped.
    /// `consumed_minutes` only ever grows.
    pub fn incremented(&self, minutes: i64, now: i64) -> Self {
        let mut updated = self.clone();
        updated.consumed_minutes += minutes.max(0);
        updated.session_count += 1;
        updated.updated_at = now;
        updated
    }
}

/// Key used by the store to uniquely identify a usage record.
pub struct UsageKey {
    owner_id: String,
    usage_month: String,
}

impl UsageKey {
    pub fn new(owner_id: &str, usage_month: &str) -> Self {
        Self {
            owner_id: owner_id.to_string(),
            usage_month: usage_month.to_string(),
        }
    }
}

impl ObjectKey for UsageKey {
    fn key_type(&self) -> StorableObjectType {
        StorableObjectType::Usage
    }

    fn key_uuid(&self) -> String {
        format!("{}/{}", self.owner_id, self.usage_month)
    }
}

impl StorableObject for UsageRecord {
    type Key = UsageKey;

    fn key(&self) -> Self::Key {
        UsageKey::new(&self.owner_id, &self.usage_month)
    }
}
