//! Pool records tracking which workstation belongs to which session. The
//! `status` field is the claim latch: transitions out of `available` only ever
//! commit through a conditional update.

use crate::{
    cloud::InstanceState,
    store::definitions::{ObjectKey, StorableObject, StorableObjectType},
    types::{plan::PlanTier, session::SessionId},
};
use serde::{Deserialize, Serialize};

/// Pool status of a workstation.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Eq, PartialEq)]
#[derive(strum_macros::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum InstanceStatus {
    /// Free to be claimed.
    Available,
    /// Claimed by a session.
    Assigned,
    /// Booting; promoted to available (or handed to its session) once the
    /// cloud reports it running.
    Starting,
    /// Being stopped after a session released it.
    Stopping,
    /// Failed the pre-claim liveness check.
    Unhealthy,
}

impl Default for InstanceStatus {
    fn default() -> Self {
        Self::Available
    }
}

/// A workstation tracked in the instance pool.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct InstanceRecord {
    pub instance_id: String,
    pub status: InstanceStatus,
    /// Records written before tiering default to the pro pool.
    #[serde(default = "PlanTier::legacy_default")]
    pub plan: PlanTier,
    #[serde(default)]
    pub session_id: Option<SessionId>,
    #[serde(default)]
    pub owner_id: Option<String>,
    #[serde(default)]
    pub assigned_at: Option<i64>,
    #[serde(default)]
    pub released_at: Option<i64>,
    #[serde(default)]
    pub discovered_at: Option<i64>,
    /// Cloud-reported machine state as of the last sync.
    #[serde(default)]
    pub instance_state: Option<InstanceState>,
    #[serde(default)]
    pub updated_at: Option<i64>,
}

impl InstanceRecord {
    /// A claimed copy of this record, owned by the given session.
    pub fn assigned_to(&self, session_id: &SessionId, owner_id: &str, now: i64) -> Self {
        let mut updated = self.clone();
        updated.status = InstanceStatus::Assigned;
        updated.session_id = Some(session_id.clone());
        updated.owner_id = Some(owner_id.to_string());
        updated.assigned_at = Some(now);
        updated.updated_at = Some(now);
        updated
    }

    /// A released copy of this record, back in the pool (or stopping).
    pub fn released(&self, status: InstanceStatus, now: i64) -> Self {
        let mut updated = self.clone();
        updated.status = status;
        updated.session_id = None;
        updated.owner_id = None;
        updated.released_at = Some(now);
        updated.updated_at = Some(now);
        updated
    }
}

/// Key used by the store to uniquely identify an instance record.
pub struct InstanceRecordKey(String);

impl From<&str> for InstanceRecordKey {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}
impl From<&String> for InstanceRecordKey {
    fn from(id: &String) -> Self {
        Self(id.clone())
    }
}

impl ObjectKey for InstanceRecordKey {
    fn key_type(&self) -> StorableObjectType {
        StorableObjectType::Instance
    }

    fn key_uuid(&self) -> String {
        self.0.clone()
    }
}

impl StorableObject for InstanceRecord {
    type Key = InstanceRecordKey;

    fn key(&self) -> Self::Key {
        InstanceRecordKey(self.instance_id.clone())
    }
}
