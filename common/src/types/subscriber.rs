//! Push-notification subscriber records. The transport which drains these is
//! an external collaborator; the control plane only maintains the table and
//! resolves targets when a session changes.

use crate::store::definitions::{ObjectKey, StorableObject, StorableObjectType};
use crate::types::session::SessionId;
use serde::{Deserialize, Serialize};

/// What a subscriber is interested in.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SubscriberKind {
    SessionStatus,
    AdminDashboard,
}

impl Default for SubscriberKind {
    fn default() -> Self {
        Self::SessionStatus
    }
}

/// One connected push client.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Subscriber {
    pub connection_id: String,
    #[serde(default)]
    pub kind: SubscriberKind,
    #[serde(default)]
    pub session_id: Option<SessionId>,
    #[serde(default)]
    pub owner_id: Option<String>,
    pub connected_at: i64,
    /// TTL attribute; expired rows are ignored and eventually reaped.
    pub expires_at: i64,
}

impl Subscriber {
    /// Whether this subscriber wants events for the given session/owner.
    pub fn wants(&self, session_id: &SessionId, owner_id: &str, now: i64) -> bool {
        if self.expires_at <= now {
            return false;
        }
        match self.kind {
            SubscriberKind::AdminDashboard => true,
            SubscriberKind::SessionStatus => {
                self.session_id.as_ref() == Some(session_id)
                    || self.owner_id.as_deref() == Some(owner_id)
            }
        }
    }
}

/// Key used by the store to uniquely identify a subscriber.
pub struct SubscriberKey(String);

impl From<&str> for SubscriberKey {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl ObjectKey for SubscriberKey {
    fn key_type(&self) -> StorableObjectType {
        StorableObjectType::Subscriber
    }

    fn key_uuid(&self) -> String {
        self.0.clone()
    }
}

impl StorableObject for Subscriber {
    type Key = SubscriberKey;

    fn key(&self) -> Self::Key {
        SubscriberKey(self.connection_id.clone())
    }
}
